//! Core traits and types shared across attention implementations.
//!
//! Attention objects are built once per unroll from the encoder outputs of the
//! current batch. Their parameters live in a [`candle_nn::VarMap`] and are
//! requested by name, so every object built under the same prefix shares them.

pub mod config;
pub mod errors;
pub mod state;

use std::fmt::Debug;

use candle_core::Tensor;

pub use config::{CombinationConfig, CombinationStrategy};
pub use errors::AttentionError;
pub use state::{AttentionHistories, AttentionHistory, AttentionLoopState, HierarchicalLoopState};

/// Sizes of the decoder tensors an attention object is queried with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    /// Width of the decoder cell output (and of the previous output).
    pub decoder_state: usize,
    /// Width of the step input fed to the decoder cell.
    pub decoder_input: usize,
}

/// Decoder tensors available to an attention object at one step.
#[derive(Debug, Clone, Copy)]
pub struct AttentionQuery<'a> {
    /// Cell output of the current step, `(batch, decoder_state)`.
    pub decoder_state: &'a Tensor,
    /// Cell output of the previous step, `(batch, decoder_state)`.
    pub prev_decoder_state: &'a Tensor,
    /// Input fed to the cell at the current step, `(batch, decoder_input)`.
    pub decoder_input: &'a Tensor,
}

/// Unified interface for per-step attention.
///
/// * `attend` consumes the loop state of the previous step and returns the
///   context vector `(batch, context_size)` together with the grown state.
/// * `finalize` materializes the recorded distributions into `histories`
///   under `key`; composite objects finalize their children as well.
pub trait Attention: Send + Sync + Debug {
    /// Parameter scope and history name of this object.
    fn name(&self) -> &str;

    /// Width of the context vectors produced by [`Attention::attend`].
    fn context_size(&self) -> usize;

    /// Empty loop state for a fresh unroll.
    fn initial_loop_state(&self) -> AttentionLoopState;

    /// Computes the context vector for `step`.
    fn attend(
        &self,
        query: &AttentionQuery<'_>,
        loop_state: AttentionLoopState,
        step: usize,
    ) -> Result<(Tensor, AttentionLoopState), AttentionError>;

    /// Stores the stacked attention weights of a finished unroll.
    fn finalize(
        &self,
        key: &str,
        loop_state: AttentionLoopState,
        histories: &mut AttentionHistories,
    ) -> Result<(), AttentionError>;
}
