//! Training harness for the recurrent decoder.
//!
//! A [`Trainer`] reads a line-aligned parallel corpus, builds source and
//! target vocabularies, and optimizes a bag-of-embeddings encoder together
//! with a [`decoder::Decoder`] on the teacher-forced loss. Evaluations run the
//! free-running unroll and report both losses with decoded samples.

pub mod config;
pub mod data;
pub mod encoder;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod overrides;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{Minibatch, ParallelCorpus};
pub use encoder::BagOfEmbeddingsEncoder;
pub use metrics::{DecodedSample, EvaluationSummary, StepSnapshot};
pub use optimizer::{AdamWConfig, TrainerOptimizer};
pub use overrides::{apply_overrides, OverrideArg};
pub use trainer::Trainer;
