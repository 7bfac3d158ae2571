use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    sentences_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            sentences_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(
        &mut self,
        sentences: u64,
        tokens: u64,
        loss: f64,
        grad_norm: f64,
    ) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.sentences_processed = self.sentences_processed.saturating_add(sentences);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            sentences,
            tokens,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            grad_norm,
            total_sentences: self.sentences_processed,
            wall_time: now.duration_since(self.start_time),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed training loss.
    pub loss: f64,
    pub step_loss: f64,
    pub sentences: u64,
    pub tokens: u64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub total_sentences: u64,
    pub wall_time: Duration,
}

/// Decoded sentence next to its reference.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub source: Vec<String>,
    pub reference: Vec<String>,
    pub hypothesis: Vec<String>,
}

/// Sentence-weighted sums over evaluation batches.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    train_loss_sum: f64,
    runtime_loss_sum: f64,
    sentences: u64,
    exact_matches: u64,
    samples: Vec<DecodedSample>,
}

impl EvaluationMetrics {
    pub fn update(
        &mut self,
        train_loss: f64,
        runtime_loss: f64,
        references: &[Vec<String>],
        hypotheses: &[Vec<String>],
    ) {
        let sentences = references.len() as u64;
        self.train_loss_sum += train_loss * sentences as f64;
        self.runtime_loss_sum += runtime_loss * sentences as f64;
        self.sentences += sentences;
        self.exact_matches += references
            .iter()
            .zip(hypotheses)
            .filter(|(reference, hypothesis)| reference == hypothesis)
            .count() as u64;
    }

    /// Keeps up to `limit` samples in arrival order.
    pub fn offer_samples(&mut self, limit: usize, samples: impl IntoIterator<Item = DecodedSample>) {
        let room = limit.saturating_sub(self.samples.len());
        self.samples.extend(samples.into_iter().take(room));
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.sentences == 0 {
            return None;
        }
        let sentences = self.sentences as f64;
        Some(EvaluationSummary {
            train_loss: self.train_loss_sum / sentences,
            runtime_loss: self.runtime_loss_sum / sentences,
            exact_match: self.exact_matches as f64 / sentences,
            sentences: self.sentences,
            samples: self.samples,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    /// Teacher-forced loss.
    pub train_loss: f64,
    /// Loss of the free-running unroll over the length it shares with the reference.
    pub runtime_loss: f64,
    /// Share of sentences decoded exactly.
    pub exact_match: f64,
    pub sentences: u64,
    pub samples: Vec<DecodedSample>,
}
