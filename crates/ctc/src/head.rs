use std::sync::Arc;

use attention::Encoder;
use candle_core::{DType, Device, Tensor};
use candle_nn::{ops, VarBuilder};
use layers::{checks, Linear, LinearConfig, LinearInit};
use vocabulary::{BatchingOptions, Vocabulary, END_TOKEN};

use crate::config::CtcConfig;
use crate::decoding::{beam_search_decode, greedy_decode, Hypothesis};
use crate::error::{CtcError, Result};
use crate::loss::{collapse_repeated, ctc_loss};

/// Range of the uniform initialiser of the projection weights.
pub const CTC_INIT_BOUND: f64 = 0.5;

/// Collapsed outputs of a batch.
#[derive(Debug, Clone)]
pub struct CtcDecoded {
    pub hypotheses: Vec<Hypothesis>,
    /// Batch-major `[batch, longest]` ids padded with the end token.
    pub dense: Tensor,
}

/// Position-wise classifier over encoder states with an extra blank class.
pub struct CtcDecoder {
    config: CtcConfig,
    vocabulary: Arc<Vocabulary>,
    encoder_name: String,
    projection: Linear,
    states: Tensor,
    input_lengths: Vec<usize>,
    device: Device,
}

impl std::fmt::Debug for CtcDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtcDecoder")
            .field("name", &self.config.name)
            .field("encoder", &self.encoder_name)
            .field("classes", &self.classes())
            .finish()
    }
}

impl CtcDecoder {
    /// Builds the head for one batch; parameters live under `vb.pp(config.name)`.
    pub fn new(
        config: CtcConfig,
        vocabulary: Arc<Vocabulary>,
        encoder: &dyn Encoder,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let states = encoder
            .hidden_states()
            .ok_or_else(|| CtcError::MissingEncoderTensor {
                encoder: encoder.name().to_string(),
                tensor: "hidden states",
            })?;
        let mask = encoder
            .input_mask()
            .ok_or_else(|| CtcError::MissingEncoderTensor {
                encoder: encoder.name().to_string(),
                tensor: "an input mask",
            })?;
        let (batch, time, state_size) = states.dims3()?;
        checks::expect_shape("ctc.input_mask", mask, &[batch, time])?;

        let classes = vocabulary.len() + 1;
        let projection = Linear::build(
            LinearConfig::new(state_size, classes),
            &LinearInit::Uniform {
                bound: CTC_INIT_BOUND,
            },
            vb.pp(config.name.as_str()).pp("output_projection"),
        )?;

        let input_lengths = mask
            .to_dtype(DType::F32)?
            .sum(1)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|length| length.round() as usize)
            .collect();

        log::info!(
            "CTC decoder '{}' over encoder '{}': {} classes, beam width {}",
            config.name,
            encoder.name(),
            classes,
            config.beam_width
        );
        Ok(Self {
            device: states.device().clone(),
            encoder_name: encoder.name().to_string(),
            config,
            vocabulary,
            projection,
            states: states.clone(),
            input_lengths,
        })
    }

    pub fn config(&self) -> &CtcConfig {
        &self.config
    }

    /// Vocabulary size plus the blank.
    pub fn classes(&self) -> usize {
        self.vocabulary.len() + 1
    }

    /// The blank is the last class.
    pub fn blank(&self) -> u32 {
        self.vocabulary.len() as u32
    }

    /// Time-major logits `[time, batch, classes]`.
    pub fn logits(&self) -> Result<Tensor> {
        Ok(self
            .projection
            .forward(&self.states)?
            .transpose(0, 1)?
            .contiguous()?)
    }

    /// Valid steps per sequence, from the encoder mask.
    pub fn input_lengths(&self) -> &[usize] {
        &self.input_lengths
    }

    /// Reference ids of every sentence, without start or end symbols.
    pub fn targets<S: AsRef<str>>(&self, sentences: &[Vec<S>]) -> Result<Vec<Vec<u32>>> {
        let options = BatchingOptions {
            add_end_symbol: false,
            ..BatchingOptions::default()
        };
        let batch = self
            .vocabulary
            .sentences_to_tensor(sentences, &options, &self.device)?;
        let ids = batch.ids.t()?.contiguous()?.to_vec2::<u32>()?;
        Ok(ids
            .into_iter()
            .zip(batch.lengths)
            .map(|(mut sequence, length)| {
                sequence.truncate(length);
                sequence
            })
            .collect())
    }

    /// Summed CTC loss of the batch against `targets`.
    pub fn loss(&self, targets: &[Vec<u32>]) -> Result<Tensor> {
        let log_probs = ops::log_softmax(&self.logits()?, 2)?;
        let targets: Vec<Vec<u32>> = if self.config.merge_repeated_targets {
            targets.iter().map(|labels| collapse_repeated(labels)).collect()
        } else {
            targets.to_vec()
        };
        let losses = ctc_loss(
            &log_probs,
            &targets,
            &self.input_lengths,
            self.blank(),
            self.config.merge_repeated_outputs,
        )?;
        Ok(losses.sum_all()?)
    }

    /// Loss for optional references; training without them is an error.
    pub fn cost<S: AsRef<str>>(&self, references: Option<&[Vec<S>]>) -> Result<Tensor> {
        let sentences = references.ok_or(CtcError::MissingTargets)?;
        self.loss(&self.targets(sentences)?)
    }

    /// Greedy collapsing for a beam width of one, prefix beam search otherwise.
    pub fn decode(&self) -> Result<CtcDecoded> {
        let log_probs = ops::log_softmax(&self.logits()?, 2)?
            .transpose(0, 1)?
            .contiguous()?
            .to_vec3::<f32>()?;
        let blank = self.blank();
        let merge = self.config.merge_repeated_outputs;

        let hypotheses: Vec<Hypothesis> = log_probs
            .iter()
            .zip(&self.input_lengths)
            .map(|(sequence, &length)| {
                let steps = &sequence[..length.min(sequence.len())];
                if self.config.beam_width == 1 {
                    greedy_decode(steps, blank, merge)
                } else {
                    beam_search_decode(steps, blank, self.config.beam_width, merge)
                }
            })
            .collect();

        let longest = hypotheses.iter().map(|h| h.labels.len()).max().unwrap_or(0);
        let fill = self.vocabulary.get_word_index(END_TOKEN);
        let mut dense = vec![fill; hypotheses.len() * longest];
        for (b, hypothesis) in hypotheses.iter().enumerate() {
            dense[b * longest..b * longest + hypothesis.labels.len()]
                .copy_from_slice(&hypothesis.labels);
        }
        let dense = Tensor::from_vec(dense, (hypotheses.len(), longest), &self.device)?;
        Ok(CtcDecoded { hypotheses, dense })
    }

    /// Decoded sentences, cut at the first end token.
    pub fn decoded_sentences(&self, decoded: &CtcDecoded) -> Vec<Vec<String>> {
        decoded
            .hypotheses
            .iter()
            .map(|hypothesis| self.vocabulary.ids_to_words(&hypothesis.labels))
            .collect()
    }
}
