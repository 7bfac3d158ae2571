//! Recurrent sequence decoder with optional attention over one or more encoders.
//!
//! The decoder unrolls a GRU or LSTM cell step by step, either teacher-forced
//! on reference sequences or free running on its own argmax predictions, and
//! stacks the per-step logits, cell outputs and validity mask once every
//! sequence has emitted the end token or the length limit is reached.

pub mod config;
pub mod decoder;
pub mod error;
pub mod initial_state;
pub mod loss;
pub mod output;
pub mod state;
pub mod step;

pub use config::{DecoderConfig, InitialStateKind, OutputAveraging};
pub use decoder::{Decoder, DecoderFeed};
pub use error::{DecoderError, Result};
pub use initial_state::InitialState;
pub use output::{decode_without_padding, DecoderOutput, DecoderOutputs};
pub use state::{DecodingMode, LoopState};
pub use step::{StepDims, StepFunction};
