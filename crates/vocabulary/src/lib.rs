//! Token <-> id mapping and batching for sequence models.
//!
//! Ids `0..4` are reserved for padding, sequence start, sequence end and
//! unknown words. Batches are time-major: `[time, batch]` id tensors with a
//! parallel `f32` validity mask.

pub mod batching;
pub mod errors;
pub mod vocab;

pub use batching::{BatchingOptions, SequenceBatch};
pub use errors::{Error, Result};
pub use vocab::{
    Vocabulary, END_TOKEN, END_TOKEN_INDEX, PAD_TOKEN, PAD_TOKEN_INDEX, START_TOKEN,
    START_TOKEN_INDEX, UNK_TOKEN, UNK_TOKEN_INDEX,
};
