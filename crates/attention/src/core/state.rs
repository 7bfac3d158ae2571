//! Per-unroll attention bookkeeping.
//!
//! Each attention object owns one loop state per unroll. The state is moved
//! into [`Attention::attend`](super::Attention::attend) and a grown copy is
//! returned, so no step ever observes a later step's history.

use std::collections::BTreeMap;

use candle_core::Tensor;

use super::AttentionError;

/// Append-only history of one attention object.
#[derive(Debug, Clone, Default)]
pub struct AttentionHistory {
    contexts: Vec<Tensor>,
    weights: Vec<Tensor>,
}

impl AttentionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the history extended by one step.
    pub fn push(mut self, context: Tensor, weights: Tensor) -> Self {
        self.contexts.push(context);
        self.weights.push(weights);
        self
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn contexts(&self) -> &[Tensor] {
        &self.contexts
    }

    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    /// Stacks the per-step distributions into a `(time, batch, candidates)` tensor.
    ///
    /// Returns `None` for a history without steps.
    pub fn stacked_weights(&self) -> Result<Option<Tensor>, AttentionError> {
        if self.weights.is_empty() {
            return Ok(None);
        }
        Ok(Some(Tensor::stack(&self.weights, 0)?))
    }
}

/// Loop state of a hierarchical combination: one state per child plus its own.
#[derive(Debug, Clone)]
pub struct HierarchicalLoopState {
    pub children: Vec<AttentionLoopState>,
    pub combination: AttentionHistory,
}

/// Loop state threaded through the decoding loop for one attention object.
#[derive(Debug, Clone)]
pub enum AttentionLoopState {
    Plain(AttentionHistory),
    Hierarchical(HierarchicalLoopState),
}

impl AttentionLoopState {
    /// Number of steps recorded at the top level.
    pub fn len(&self) -> usize {
        match self {
            AttentionLoopState::Plain(history) => history.len(),
            AttentionLoopState::Hierarchical(state) => state.combination.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-level history regardless of the variant.
    pub fn history(&self) -> &AttentionHistory {
        match self {
            AttentionLoopState::Plain(history) => history,
            AttentionLoopState::Hierarchical(state) => &state.combination,
        }
    }

    pub(crate) fn into_plain(self, owner: &str) -> Result<AttentionHistory, AttentionError> {
        match self {
            AttentionLoopState::Plain(history) => Ok(history),
            AttentionLoopState::Hierarchical(_) => Err(AttentionError::LoopState {
                context: format!("{owner} expects a plain loop state"),
            }),
        }
    }

    pub(crate) fn into_hierarchical(
        self,
        owner: &str,
    ) -> Result<HierarchicalLoopState, AttentionError> {
        match self {
            AttentionLoopState::Hierarchical(state) => Ok(state),
            AttentionLoopState::Plain(_) => Err(AttentionError::LoopState {
                context: format!("{owner} expects a hierarchical loop state"),
            }),
        }
    }
}

/// Verifies that a loop state has recorded exactly `step` entries.
pub(crate) fn expect_step(owner: &str, recorded: usize, step: usize) -> Result<(), AttentionError> {
    if recorded == step {
        Ok(())
    } else {
        Err(AttentionError::LoopState {
            context: format!("{owner} has {recorded} recorded steps but step {step} was requested"),
        })
    }
}

/// Finalized attention distributions keyed by attention object and run key.
///
/// The run key identifies one unroll, e.g. `decoder_train` or `decoder_run`.
#[derive(Debug, Clone, Default)]
pub struct AttentionHistories {
    entries: BTreeMap<(String, String), Tensor>,
}

impl AttentionHistories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attention: &str, key: &str, weights: Tensor) {
        self.entries
            .insert((attention.to_string(), key.to_string()), weights);
    }

    /// Weights of `attention` recorded under `key`, shaped `(time, batch, candidates)`.
    pub fn get(&self, attention: &str, key: &str) -> Option<&Tensor> {
        self.entries.get(&(attention.to_string(), key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Tensor)> {
        self.entries
            .iter()
            .map(|((attention, key), weights)| (attention.as_str(), key.as_str(), weights))
    }

    /// Moves every entry of `other` into `self`.
    pub fn extend(&mut self, other: AttentionHistories) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn stacked_weights_are_time_major() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let mut history = AttentionHistory::new();
        assert!(history.stacked_weights().unwrap().is_none());
        for _ in 0..3 {
            history = history.push(
                Tensor::zeros((2, 4), DType::F32, &device)?,
                Tensor::zeros((2, 5), DType::F32, &device)?,
            );
        }
        let stacked = history.stacked_weights().unwrap().unwrap();
        assert_eq!(stacked.dims(), &[3, 2, 5]);
        Ok(())
    }

    #[test]
    fn histories_keep_train_and_run_apart() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let mut histories = AttentionHistories::new();
        histories.insert("attention_src", "decoder_train", Tensor::zeros((2, 1, 3), DType::F32, &device)?);
        histories.insert("attention_src", "decoder_run", Tensor::zeros((4, 1, 3), DType::F32, &device)?);
        assert_eq!(histories.len(), 2);
        assert_eq!(histories.get("attention_src", "decoder_train").unwrap().dims()[0], 2);
        assert_eq!(histories.get("attention_src", "decoder_run").unwrap().dims()[0], 4);
        assert!(histories.get("attention_src", "other_run").is_none());
        Ok(())
    }
}
