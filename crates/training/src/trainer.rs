use std::sync::Arc;

use attention::Encoder;
use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use decoder::Decoder;
use rand::{rngs::StdRng, SeedableRng};
use vocabulary::Vocabulary;

use crate::{
    data::{Minibatch, ParallelCorpus},
    encoder::BagOfEmbeddingsEncoder,
    logging::{Logger, LoggingSettings},
    metrics::{DecodedSample, EvaluationMetrics, EvaluationSummary, TrainingMetrics},
    optimizer::{AdamWConfig, TrainerOptimizer},
    TrainingConfig, TrainingError,
};

const SOURCE_VOCABULARY_FILE: &str = "source_vocabulary.json";
const TARGET_VOCABULARY_FILE: &str = "target_vocabulary.json";

/// Trains an encoder-decoder pair on an in-memory parallel corpus.
///
/// The decoder is rebuilt for every batch from the same [`VarMap`], so its
/// parameters persist across batches while attention objects and loop state
/// stay per batch.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    varmap: VarMap,
    target_vocabulary: Arc<Vocabulary>,
    encoder: BagOfEmbeddingsEncoder,
    train_data: ParallelCorpus,
    validation_data: Option<ParallelCorpus>,
    optimizer: TrainerOptimizer,
    metrics: TrainingMetrics,
    logger: Logger,
    rng: StdRng,
    optimizer_steps: usize,
    epochs_completed: usize,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device();

        let train_data =
            ParallelCorpus::from_files(&config.data.train_source, &config.data.train_target)?;
        if train_data.is_empty() {
            return Err(TrainingError::initialization("training corpus is empty"));
        }
        let validation_data = match (
            config.data.validation_source.as_ref(),
            config.data.validation_target.as_ref(),
        ) {
            (Some(source), Some(target)) => Some(ParallelCorpus::from_files(source, target)?),
            _ => None,
        };

        let source_vocabulary = Arc::new(Vocabulary::from_sentences(
            train_data.sources(),
            config.data.min_count,
            config.data.max_vocabulary_size,
        ));
        let target_vocabulary = Arc::new(Vocabulary::from_sentences(
            train_data.targets(),
            config.data.min_count,
            config.data.max_vocabulary_size,
        ));
        log::info!(
            "loaded {} training pairs; vocabularies: {} source, {} target words",
            train_data.len(),
            source_vocabulary.len(),
            target_vocabulary.len()
        );
        if let Some(dir) = config.data.vocabulary_dir.as_ref() {
            source_vocabulary.save_json(&dir.join(SOURCE_VOCABULARY_FILE))?;
            target_vocabulary.save_json(&dir.join(TARGET_VOCABULARY_FILE))?;
            log::info!("vocabularies written to {}", dir.display());
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = BagOfEmbeddingsEncoder::new(config.encoder.clone(), source_vocabulary, vb)?;

        let parts = TrainerParts {
            config: &config,
            device: &device,
            varmap: &varmap,
            encoder: &encoder,
            target_vocabulary: &target_vocabulary,
        };
        // The decoder requests its parameters lazily; one build creates them all.
        let batches = train_data.batches(config.data.batch_size, None);
        if let Some(batch) = batches.first() {
            parts.build_decoder(&batch.sources)?;
        }

        let named_parameters = named_variables(&varmap)?;
        log::info!(
            "optimizing {} parameter tensors ({} values)",
            named_parameters.len(),
            named_parameters
                .iter()
                .map(|(_, var)| var.as_tensor().elem_count())
                .sum::<usize>()
        );
        let optimizer = TrainerOptimizer::new(
            named_parameters,
            AdamWConfig::from(&config.optimizer),
            config.optimizer.max_grad_norm.map(f64::from),
        )?;

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let rng = StdRng::seed_from_u64(config.runtime.seed);

        Ok(Self {
            rng,
            logger,
            optimizer,
            metrics: TrainingMetrics::new(),
            device,
            varmap,
            target_vocabulary,
            encoder,
            train_data,
            validation_data,
            optimizer_steps: 0,
            epochs_completed: 0,
            config,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn target_vocabulary(&self) -> &Vocabulary {
        &self.target_vocabulary
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the configured epochs, stopping early at `max_steps` or when
    /// `should_stop` returns true between batches.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let max_steps = self.config.runtime.max_steps;
        'epochs: while self.epochs_completed < self.config.runtime.epochs {
            let rng = if self.config.data.shuffle {
                Some(&mut self.rng)
            } else {
                None
            };
            let batches = self.train_data.batches(self.config.data.batch_size, rng);

            for batch in &batches {
                if should_stop() {
                    log::info!("stop requested after {} steps", self.optimizer_steps);
                    break 'epochs;
                }
                if max_steps.is_some_and(|limit| self.optimizer_steps >= limit) {
                    break 'epochs;
                }

                let (loss, grad_norm) = self.train_step(batch)?;
                self.optimizer_steps += 1;

                let snapshot = self.metrics.record_step(
                    batch.len() as u64,
                    batch.target_tokens() as u64,
                    loss,
                    grad_norm,
                );
                if self.optimizer_steps % self.config.runtime.log_every_n_steps == 0
                    || self.optimizer_steps == 1
                {
                    let lr = self.optimizer.learning_rate();
                    self.logger
                        .log_training_step(self.optimizer_steps, lr, &snapshot);
                }

                if let Some(every) = self.config.runtime.evaluation.every_n_steps {
                    if self.optimizer_steps % every == 0 {
                        self.run_evaluation()?;
                    }
                }
            }

            self.epochs_completed += 1;
            log::info!(
                "epoch {} finished after {} steps",
                self.epochs_completed,
                self.optimizer_steps
            );
        }

        self.run_evaluation()?;
        self.logger.flush();
        Ok(())
    }

    /// One teacher-forced update; returns the loss and the gradient norm.
    pub fn train_step(&mut self, batch: &Minibatch) -> Result<(f64, f64), TrainingError> {
        let decoder = self.parts().build_decoder(&batch.sources)?;
        let feed = decoder.feed(batch.len(), Some(batch.targets.as_slice()), true)?;
        let output = decoder.train_logits(&feed)?;
        let loss = decoder.train_loss(&feed, &output)?;

        let value = loss.to_scalar::<f32>()? as f64;
        if !value.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite loss {} at step {}",
                value,
                self.optimizer_steps + 1
            )));
        }

        let mut grads = loss.backward()?;
        let grad_norm = self.optimizer.step(&mut grads)?;
        Ok((value, grad_norm))
    }

    /// Scores the validation corpus, or the training corpus without one.
    pub fn evaluate(&self, max_batches: Option<usize>) -> Result<EvaluationSummary, TrainingError> {
        let corpus = self.validation_data.as_ref().unwrap_or(&self.train_data);
        let batches = corpus.batches(self.config.data.batch_size, None);
        let limit = max_batches.unwrap_or(batches.len());
        let samples = self.config.runtime.evaluation.samples;

        let mut metrics = EvaluationMetrics::default();
        for batch in batches.iter().take(limit) {
            let decoder = self.parts().build_decoder(&batch.sources)?;
            let feed = decoder.feed(batch.len(), Some(batch.targets.as_slice()), false)?;
            let outputs = decoder.outputs(&feed)?;

            let (Some(train_loss), Some(runtime_loss)) =
                (outputs.train_loss.as_ref(), outputs.runtime_loss.as_ref())
            else {
                return Err(TrainingError::runtime(
                    "evaluation requires losses against the references",
                ));
            };
            let hypotheses = decoder.decoded_sentences(&outputs.runtime)?;
            let references = reference_words(&decoder, &batch.targets);
            metrics.update(
                train_loss.to_scalar::<f32>()? as f64,
                runtime_loss.to_scalar::<f32>()? as f64,
                &references,
                &hypotheses,
            );
            metrics.offer_samples(
                samples,
                batch
                    .sources
                    .iter()
                    .zip(references.iter())
                    .zip(hypotheses.iter())
                    .map(|((source, reference), hypothesis)| DecodedSample {
                        source: source.clone(),
                        reference: reference.clone(),
                        hypothesis: hypothesis.clone(),
                    }),
            );
        }

        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation corpus is empty"))
    }

    fn run_evaluation(&mut self) -> Result<(), TrainingError> {
        let summary = self.evaluate(self.config.runtime.evaluation.max_batches)?;
        self.logger.log_evaluation(self.optimizer_steps, &summary);
        Ok(())
    }

    fn parts(&self) -> TrainerParts<'_> {
        TrainerParts {
            config: &self.config,
            device: &self.device,
            varmap: &self.varmap,
            encoder: &self.encoder,
            target_vocabulary: &self.target_vocabulary,
        }
    }
}

/// Borrowed pieces needed to assemble a decoder for one batch.
struct TrainerParts<'a> {
    config: &'a TrainingConfig,
    device: &'a Device,
    varmap: &'a VarMap,
    encoder: &'a BagOfEmbeddingsEncoder,
    target_vocabulary: &'a Arc<Vocabulary>,
}

impl TrainerParts<'_> {
    fn build_decoder(&self, sources: &[Vec<String>]) -> Result<Decoder, TrainingError> {
        let encoded: Arc<dyn Encoder> = Arc::new(self.encoder.encode(sources, self.device)?);
        let vb = VarBuilder::from_varmap(self.varmap, DType::F32, self.device);
        Ok(Decoder::new(
            self.config.decoder.clone(),
            Arc::clone(self.target_vocabulary),
            &[encoded],
            None,
            vb,
        )?)
    }
}

/// References as the decoder sees them: unknown words mapped and cut to the length limit.
fn reference_words(decoder: &Decoder, targets: &[Vec<String>]) -> Vec<Vec<String>> {
    let vocabulary = decoder.vocabulary();
    let max_len = decoder.config().max_output_len;
    targets
        .iter()
        .map(|sentence| {
            let ids: Vec<u32> = sentence
                .iter()
                .take(max_len)
                .map(|word| vocabulary.get_word_index(word))
                .collect();
            vocabulary.ids_to_words(&ids)
        })
        .collect()
}

fn named_variables(varmap: &VarMap) -> Result<Vec<(String, Var)>, TrainingError> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("parameter store lock poisoned"))?;
    let mut named: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(named)
}

fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("device: using CUDA GPU #0");
            device
        }
        Ok(device) => {
            log::info!("device: using CPU");
            device
        }
        Err(err) => {
            log::warn!("cuda initialization failed, falling back to CPU: {err}");
            Device::Cpu
        }
    }
}
