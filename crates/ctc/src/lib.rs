//! Connectionist temporal classification head.
//!
//! Encoder states are classified position by position into the vocabulary
//! plus a trailing blank class. Training uses the CTC objective summed over
//! the batch; decoding collapses the per-step classes greedily or with a
//! prefix beam search.

pub mod config;
pub mod decoding;
pub mod error;
pub mod head;
pub mod loss;

pub use config::CtcConfig;
pub use decoding::{beam_search_decode, greedy_decode, Hypothesis};
pub use error::{CtcError, Result};
pub use head::{CtcDecoded, CtcDecoder};
pub use loss::{collapse_repeated, ctc_loss};
