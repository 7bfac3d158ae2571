//! Loop state threaded through the decoding unroll.

use attention::AttentionLoopState;
use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Source of the next input symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodingMode {
    /// Teacher forcing: the next input is the reference token.
    Train,
    /// Free running: the next input is the argmax of the step logits.
    Run,
}

impl DecodingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodingMode::Train => "train",
            DecodingMode::Run => "run",
        }
    }
}

/// Snapshot of one decoding step.
///
/// Each step consumes the snapshot and returns the next one; the growing
/// histories move along with it, so no step keeps a handle on an older
/// snapshot.
#[derive(Debug)]
pub struct LoopState {
    pub step: usize,
    /// Current input ids, `[batch]` `u32`.
    pub input_symbol: Tensor,
    /// Reference ids `[time, batch]`, present only when teacher forcing.
    pub train_inputs: Option<Tensor>,
    /// Cell state; the LSTM memory, or the hidden output for GRU cells.
    pub prev_rnn_state: Tensor,
    pub prev_rnn_output: Tensor,
    /// Cell outputs seeded with the initial state, `steps + 1` entries.
    pub rnn_outputs: Vec<Tensor>,
    pub prev_logits: Tensor,
    pub logits: Vec<Tensor>,
    /// One context per attention object from the previous step.
    pub prev_contexts: Vec<Tensor>,
    /// Per-step validity, `[batch]` `f32`.
    pub mask: Vec<Tensor>,
    pub finished: Vec<bool>,
    pub attention_loop_states: Vec<AttentionLoopState>,
}

impl LoopState {
    /// State before the first step.
    pub fn initial(
        go_symbols: Tensor,
        train_inputs: Option<Tensor>,
        initial_state: Tensor,
        vocabulary_size: usize,
        context_sizes: &[usize],
        attention_loop_states: Vec<AttentionLoopState>,
        device: &Device,
    ) -> Result<Self> {
        let batch = go_symbols.dims1()?;
        let prev_contexts = context_sizes
            .iter()
            .map(|&size| Tensor::zeros((batch, size), DType::F32, device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            step: 0,
            input_symbol: go_symbols,
            train_inputs,
            prev_rnn_state: initial_state.clone(),
            prev_rnn_output: initial_state.clone(),
            rnn_outputs: vec![initial_state],
            prev_logits: Tensor::zeros((batch, vocabulary_size), DType::F32, device)?,
            logits: Vec::new(),
            prev_contexts,
            mask: Vec::new(),
            finished: vec![false; batch],
            attention_loop_states,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.finished.len()
    }

    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(|&done| done)
    }

    /// Halting condition evaluated before every step.
    ///
    /// Teacher forcing runs over the whole reference batch, so an end token
    /// inside a reference does not cut the unroll short.
    pub fn should_continue(&self, max_output_len: usize) -> bool {
        match self.train_inputs.as_ref() {
            Some(inputs) => self.step < max_output_len.min(inputs.dims()[0]),
            None => !self.all_finished() && self.step < max_output_len,
        }
    }

    /// Reference ids fed at the current step.
    pub fn reference_symbols(&self) -> Option<Result<Tensor>> {
        self.train_inputs
            .as_ref()
            .map(|inputs| Ok(inputs.get(self.step)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(train_inputs: Option<Tensor>) -> Result<LoopState> {
        let device = Device::Cpu;
        LoopState::initial(
            Tensor::new(&[1u32, 1], &device)?,
            train_inputs,
            Tensor::zeros((2, 3), DType::F32, &device)?,
            6,
            &[4, 5],
            Vec::new(),
            &device,
        )
    }

    #[test]
    fn initial_state_seeds_histories() -> Result<()> {
        let state = state(None)?;
        assert_eq!(state.step, 0);
        assert_eq!(state.rnn_outputs.len(), 1);
        assert!(state.logits.is_empty());
        assert_eq!(state.prev_logits.dims(), &[2, 6]);
        assert_eq!(state.prev_contexts[1].dims(), &[2, 5]);
        assert_eq!(state.finished, vec![false, false]);
        Ok(())
    }

    #[test]
    fn halting_depends_on_the_decoding_mode() -> Result<()> {
        let mut free = state(None)?;
        assert!(free.should_continue(3));
        free.step = 3;
        assert!(!free.should_continue(3));

        let references = Tensor::zeros((2, 2), DType::U32, &Device::Cpu)?;
        let mut forced = state(Some(references))?;
        forced.step = 2;
        assert!(!forced.should_continue(10));

        let mut done = state(None)?;
        done.finished = vec![true, true];
        assert!(!done.should_continue(10));

        let references = Tensor::zeros((4, 2), DType::U32, &Device::Cpu)?;
        let mut forced = state(Some(references))?;
        forced.step = 1;
        forced.finished = vec![true, true];
        assert!(forced.should_continue(10));
        Ok(())
    }
}
