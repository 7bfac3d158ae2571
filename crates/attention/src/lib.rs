//! Attention over encoder outputs for step-wise recurrent decoders.
//!
//! An attention object is created per batch from encoder outputs laid out as
//! `[batch, time, state]` with a `[batch, time]` validity mask. At every
//! decoding step it receives the decoder's new cell output, its previous
//! output and the step input, and returns a `[batch, context]` vector together
//! with its grown loop state.
//!
//! Three strategies are provided:
//!
//! * [`single::AdditiveAttention`], built by a plain attentive encoder;
//! * [`flat::FlatAttention`], one joint distribution over all positions of
//!   several encoders;
//! * [`hierarchical::HierarchicalAttention`], attention over the context
//!   vectors of per-encoder attentions.
//!
//! The multi-source strategies are created through an
//! [`wrapper::EncoderWrapper`] and may add a sentinel candidate.

pub mod core;
pub mod encoder;
pub mod flat;
pub mod hierarchical;
pub mod masks;
pub mod scoring;
pub mod sentinel;
pub mod single;
pub mod wrapper;

pub use self::core::{
    Attention, AttentionDims, AttentionError, AttentionHistories, AttentionHistory,
    AttentionLoopState, AttentionQuery, CombinationConfig, CombinationStrategy,
    HierarchicalLoopState,
};
pub use encoder::{Attentive, EncodedSequence, Encoder};
pub use wrapper::EncoderWrapper;
