//! Recurrent sequence-to-sequence decoding with multi-source attention.
//!
//! The workspace crates are re-exported under their own names so that
//! applications can depend on a single package.

pub use attention;
pub use ctc;
pub use decoder;
pub use embedding;
pub use layers;
pub use training;
pub use vocabulary;

pub use attention::{CombinationConfig, CombinationStrategy, EncodedSequence, Encoder, EncoderWrapper};
pub use ctc::{CtcConfig, CtcDecoder};
pub use decoder::{Decoder, DecoderConfig, DecoderFeed, DecoderOutput, DecoderOutputs, DecodingMode};
pub use training::{Trainer, TrainingConfig};
pub use vocabulary::Vocabulary;
