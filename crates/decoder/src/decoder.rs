//! The decoding loop controller.
//!
//! A [`Decoder`] is built per batch from the encoders of that batch. It owns
//! two sets of attention objects built under the same parameter names, one
//! for the teacher-forced unroll and one for the free-running unroll, so the
//! two unrolls share weights but never loop state or histories.

use std::sync::Arc;

use attention::{Attention, AttentionDims, AttentionHistories, Encoder};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, VarBuilder};
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::CellKind;
use vocabulary::{BatchingOptions, SequenceBatch, Vocabulary, START_TOKEN};

use crate::config::{DecoderConfig, OutputAveraging};
use crate::error::{DecoderError, Result};
use crate::initial_state::InitialState;
use crate::loss;
use crate::output::{DecoderOutput, DecoderOutputs};
use crate::state::{DecodingMode, LoopState};
use crate::step::{StepDims, StepFunction};

/// Per-batch inputs of a decoder.
#[derive(Debug, Clone)]
pub struct DecoderFeed {
    /// Enables dropout.
    pub train: bool,
    /// First input of every sequence, `[batch]` `u32`.
    pub go_symbols: Tensor,
    /// Reference sequences, needed for teacher forcing and the losses.
    pub targets: Option<SequenceBatch>,
}

impl DecoderFeed {
    pub fn batch_size(&self) -> usize {
        self.go_symbols.dims()[0]
    }

    fn targets(&self) -> Result<&SequenceBatch> {
        self.targets.as_ref().ok_or(DecoderError::MissingTargets)
    }
}

pub struct Decoder {
    config: DecoderConfig,
    cell_kind: CellKind,
    vocabulary: Arc<Vocabulary>,
    encoders: Vec<Arc<dyn Encoder>>,
    initial_state: InitialState,
    step: StepFunction,
    train_attentions: Vec<Box<dyn Attention>>,
    runtime_attentions: Vec<Box<dyn Attention>>,
    dropout: Dropout,
    device: Device,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("name", &self.config.name)
            .field("cell", &self.cell_kind)
            .field("initial_state", &self.initial_state.kind())
            .field("rnn_size", &self.rnn_size())
            .field("embedding_size", &self.embedding_size())
            .field("attentions", &self.train_attentions.len())
            .finish()
    }
}

fn create_attentions(
    encoders: &[Arc<dyn Encoder>],
    dims: AttentionDims,
    vb: &VarBuilder,
) -> Result<Vec<Box<dyn Attention>>> {
    let mut attentions = Vec::new();
    for encoder in encoders {
        match encoder.as_attentive() {
            Some(attentive) => attentions.push(attentive.create_attention_object(dims, vb.clone())?),
            None => log::debug!("encoder '{}' provides no attention", encoder.name()),
        }
    }
    Ok(attentions)
}

impl Decoder {
    /// Builds the decoder for one batch of encoder outputs.
    ///
    /// Parameters are requested under `vb.pp(config.name)`; building the
    /// decoder again with the same `VarMap` reuses them.
    pub fn new(
        config: DecoderConfig,
        vocabulary: Arc<Vocabulary>,
        encoders: &[Arc<dyn Encoder>],
        embeddings_source: Option<TokenEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        log::info!("Initializing decoder, name: '{}'", config.name);

        let embedding_size = match (config.embedding_size, &embeddings_source) {
            (None, None) => return Err(DecoderError::MissingEmbeddingSize),
            (Some(_), Some(source)) => {
                log::warn!(
                    "Overriding the embedding_size parameter with the size of the reused \
                     embeddings ({})",
                    source.embedding_size()
                );
                source.embedding_size()
            }
            (None, Some(source)) => source.embedding_size(),
            (Some(size), None) => size,
        };
        if let Some(source) = &embeddings_source {
            if source.vocab_size() != vocabulary.len() {
                return Err(DecoderError::InvalidConfig(format!(
                    "reused embeddings cover {} words but the vocabulary has {}",
                    source.vocab_size(),
                    vocabulary.len()
                )));
            }
        }

        let cell_kind = config.cell_kind()?;
        let vb = vb.pp(config.name.as_str());
        let (initial_state, rnn_size) = InitialState::resolve(&config, encoders, &vb)?;

        let embedding = match embeddings_source {
            Some(source) => source,
            None => TokenEmbedding::new(
                TokenEmbeddingConfig {
                    vocab_size: vocabulary.len(),
                    embedding_size,
                },
                vb.pp("word_embeddings"),
            )?,
        };

        let (train_attentions, runtime_attentions) = if config.use_attention {
            let dims = AttentionDims {
                decoder_state: rnn_size,
                decoder_input: embedding_size,
            };
            (
                create_attentions(encoders, dims, &vb)?,
                create_attentions(encoders, dims, &vb)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let conditional_gru = match (config.conditional_gru, cell_kind) {
            (true, CellKind::Lstm) => {
                log::warn!("Conditional GRU is only available with GRU cells; ignoring it");
                false
            }
            (flag, _) => flag,
        };

        let step = StepFunction::new(
            StepDims {
                embedding_size,
                rnn_size,
                vocabulary_size: vocabulary.len(),
                context_sizes: train_attentions.iter().map(|a| a.context_size()).collect(),
            },
            cell_kind,
            config.attention_on_input,
            conditional_gru,
            embedding,
            config.dropout_p,
            &vb,
        )?;

        let device = vb.device().clone();
        let decoder = Self {
            dropout: Dropout::new(config.dropout_p),
            cell_kind,
            vocabulary,
            encoders: encoders.to_vec(),
            initial_state,
            step,
            train_attentions,
            runtime_attentions,
            device,
            config,
        };
        log::info!(
            "Decoder '{}' initialized: {} cell, {} initial state, rnn_size {}, {} attention object(s)",
            decoder.config.name,
            decoder.cell_kind,
            decoder.initial_state.kind().as_str(),
            rnn_size,
            decoder.train_attentions.len()
        );
        Ok(decoder)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn cell_kind(&self) -> CellKind {
        self.cell_kind
    }

    pub fn rnn_size(&self) -> usize {
        self.step.dims().rnn_size
    }

    pub fn embedding_size(&self) -> usize {
        self.step.dims().embedding_size
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn embedding(&self) -> &TokenEmbedding {
        self.step.embedding()
    }

    pub fn initial_state(&self) -> &InitialState {
        &self.initial_state
    }

    pub fn step_function(&self) -> &StepFunction {
        &self.step
    }

    /// Attention objects of the given unroll.
    pub fn attentions(&self, mode: DecodingMode) -> &[Box<dyn Attention>] {
        match mode {
            DecodingMode::Train => &self.train_attentions,
            DecodingMode::Run => &self.runtime_attentions,
        }
    }

    /// Key under which the attention histories of `mode` are stored.
    pub fn history_key(&self, mode: DecodingMode) -> String {
        format!("{}_{}", self.config.name, mode.as_str())
    }

    /// Builds the feed for a batch of `batch_size` sequences.
    ///
    /// References are batched up to `max_output_len` with an end symbol and
    /// no start symbol; they are required when `train` is set.
    pub fn feed<S: AsRef<str>>(
        &self,
        batch_size: usize,
        references: Option<&[Vec<S>]>,
        train: bool,
    ) -> Result<DecoderFeed> {
        if references.is_none() && train {
            return Err(DecoderError::MissingTargets);
        }
        let go_symbol = self.vocabulary.get_word_index(START_TOKEN);
        let go_symbols = Tensor::from_vec(vec![go_symbol; batch_size], batch_size, &self.device)?;

        let targets = match references {
            Some(sentences) => {
                if sentences.len() != batch_size {
                    return Err(DecoderError::InvalidConfig(format!(
                        "{} reference sentences fed for a batch of {batch_size}",
                        sentences.len()
                    )));
                }
                let options = BatchingOptions {
                    max_len: Some(self.config.max_output_len),
                    pad_to_max_len: false,
                    add_start_symbol: false,
                    add_end_symbol: true,
                };
                Some(
                    self.vocabulary
                        .sentences_to_tensor(sentences, &options, &self.device)?,
                )
            }
            None => None,
        };

        Ok(DecoderFeed {
            train,
            go_symbols,
            targets,
        })
    }

    /// Runs the loop in `mode` until every sequence finished or the length limit.
    pub fn unroll(&self, feed: &DecoderFeed, mode: DecodingMode) -> Result<DecoderOutput> {
        let attentions = self.attentions(mode);
        let train_inputs = match mode {
            DecodingMode::Train => Some(feed.targets()?.ids.clone()),
            DecodingMode::Run => None,
        };
        let batch = feed.batch_size();
        let initial = self.initial_state.compute(
            &self.encoders,
            batch,
            &self.dropout,
            feed.train,
            &self.device,
        )?;

        let context_sizes: Vec<usize> = attentions.iter().map(|a| a.context_size()).collect();
        let mut state = LoopState::initial(
            feed.go_symbols.to_dtype(DType::U32)?,
            train_inputs,
            initial,
            self.vocabulary.len(),
            &context_sizes,
            attentions.iter().map(|a| a.initial_loop_state()).collect(),
            &self.device,
        )?;

        while state.should_continue(self.config.max_output_len) {
            state = self.step.step(attentions, state, feed.train)?;
        }

        let key = self.history_key(mode);
        let mut attention_histories = AttentionHistories::new();
        for (attention, loop_state) in attentions.iter().zip(state.attention_loop_states) {
            attention.finalize(&key, loop_state, &mut attention_histories)?;
        }

        let steps = state.step;
        let logits = if state.logits.is_empty() {
            Tensor::zeros((0, batch, self.vocabulary.len()), DType::F32, &self.device)?
        } else {
            Tensor::stack(&state.logits, 0)?
        };
        let mask = if state.mask.is_empty() {
            Tensor::zeros((0, batch), DType::F32, &self.device)?
        } else {
            Tensor::stack(&state.mask, 0)?
        };
        let rnn_outputs = Tensor::stack(&state.rnn_outputs, 0)?;
        let finished_count = state.finished.iter().filter(|&&done| done).count();
        log::debug!(
            "decoder '{}' {} unroll: {} step(s), {}/{} finished",
            self.config.name,
            mode.as_str(),
            steps,
            finished_count,
            batch
        );

        Ok(DecoderOutput {
            mode,
            logits,
            rnn_outputs,
            mask,
            finished: state.finished,
            steps,
            attention_histories,
        })
    }

    /// Teacher-forced unroll.
    pub fn train_logits(&self, feed: &DecoderFeed) -> Result<DecoderOutput> {
        self.unroll(feed, DecodingMode::Train)
    }

    /// Free-running unroll.
    pub fn runtime(&self, feed: &DecoderFeed) -> Result<DecoderOutput> {
        self.unroll(feed, DecodingMode::Run)
    }

    /// Per-example cross-entropies of a teacher-forced unroll, `[batch]`.
    pub fn train_xents(&self, feed: &DecoderFeed, output: &DecoderOutput) -> Result<Tensor> {
        let targets = feed.targets()?;
        loss::sequence_xents(&output.logits, &targets.ids, &targets.mask)
    }

    /// Scalar training loss reduced as configured.
    pub fn train_loss(&self, feed: &DecoderFeed, output: &DecoderOutput) -> Result<Tensor> {
        let targets = feed.targets()?;
        loss::sequence_loss(
            &output.logits,
            &targets.ids,
            &targets.mask,
            self.config.output_averaging,
        )
    }

    /// Token-averaged loss of a free-running unroll against the references,
    /// over the time extent both share.
    pub fn runtime_loss(&self, feed: &DecoderFeed, output: &DecoderOutput) -> Result<Tensor> {
        let targets = feed.targets()?;
        let (logits, ids, mask) = loss::truncate_to_shorter(&output.logits, &targets.ids, &targets.mask)?;
        loss::sequence_loss(&logits, &ids, &mask, OutputAveraging::BatchMean)
    }

    /// Runs both unrolls and every loss the feed allows.
    pub fn outputs(&self, feed: &DecoderFeed) -> Result<DecoderOutputs> {
        let runtime = self.runtime(feed)?;
        if feed.targets.is_none() {
            return Ok(DecoderOutputs {
                train: None,
                train_xents: None,
                train_loss: None,
                runtime,
                runtime_loss: None,
            });
        }
        let train = self.train_logits(feed)?;
        let train_xents = self.train_xents(feed, &train)?;
        let train_loss = self.train_loss(feed, &train)?;
        let runtime_loss = self.runtime_loss(feed, &runtime)?;
        Ok(DecoderOutputs {
            train: Some(train),
            train_xents: Some(train_xents),
            train_loss: Some(train_loss),
            runtime,
            runtime_loss: Some(runtime_loss),
        })
    }

    /// Decoded token sequences of an unroll, cut at the first end token.
    pub fn decoded_sentences(&self, output: &DecoderOutput) -> Result<Vec<Vec<String>>> {
        Ok(self.vocabulary.vectors_to_sentences(&output.decoded()?)?)
    }
}
