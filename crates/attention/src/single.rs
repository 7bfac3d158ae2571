//! Single-source additive attention.
//!
//! Encoder states are projected once when the object is built. Each step
//! projects the decoder state, scores every position with
//! `v . tanh(W_s h + W_e e_j)`, renormalizes against the encoder mask and
//! returns the weighted sum of the raw encoder states.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{checks, Linear, LinearConfig, LinearInit};

use crate::core::state::expect_step;
use crate::core::{
    Attention, AttentionDims, AttentionError, AttentionHistories, AttentionHistory,
    AttentionLoopState, AttentionQuery,
};
use crate::masks::renorm_softmax;
use crate::scoring::{additive_logits, attention_vector, ATTENTION_INIT_STDEV};

#[derive(Debug)]
pub struct AdditiveAttention {
    name: String,
    states: Tensor,
    mask: Tensor,
    keys: Tensor,
    state_projection: Linear,
    attn_v: Tensor,
}

impl AdditiveAttention {
    /// Builds the attention over `states` `(batch, time, size)` under `vb.pp(name)`.
    pub fn new(
        name: impl Into<String>,
        states: &Tensor,
        mask: &Tensor,
        dims: AttentionDims,
        vb: VarBuilder,
    ) -> Result<Self, AttentionError> {
        let name = name.into();
        let (_, _, state_size) = states.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!("{name} expects encoder states [batch, time, size]"),
        })?;
        let vb = vb.pp(&name);

        let encoder_projection = Linear::build(
            LinearConfig::new(state_size, state_size).without_bias(),
            &LinearInit::Normal {
                stdev: ATTENTION_INIT_STDEV,
            },
            vb.pp("encoder_projection"),
        )?;
        let keys = encoder_projection.forward(states)?;
        let state_projection = Linear::build(
            LinearConfig::new(dims.decoder_state, state_size),
            &LinearInit::XavierUniform,
            vb.pp("state_projection"),
        )?;
        let attn_v = attention_vector(state_size, &vb)?;
        log::debug!("attention::single init name={} state_size={}", name, state_size);

        Ok(Self {
            name,
            states: states.clone(),
            mask: mask.clone(),
            keys,
            state_projection,
            attn_v,
        })
    }

    /// Attention distribution for one step, `(batch, time)`.
    pub fn weights(&self, decoder_state: &Tensor) -> Result<Tensor, AttentionError> {
        checks::expect_same_batch(&self.name, decoder_state, &self.states)?;
        let projected = self.state_projection.forward(decoder_state)?.unsqueeze(1)?;
        let logits = additive_logits(&projected, &self.keys, &self.attn_v)?;
        Ok(renorm_softmax(&logits, &self.mask)?)
    }
}

impl Attention for AdditiveAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_size(&self) -> usize {
        self.states.dims()[2]
    }

    fn initial_loop_state(&self) -> AttentionLoopState {
        AttentionLoopState::Plain(AttentionHistory::new())
    }

    fn attend(
        &self,
        query: &AttentionQuery<'_>,
        loop_state: AttentionLoopState,
        step: usize,
    ) -> Result<(Tensor, AttentionLoopState), AttentionError> {
        let history = loop_state.into_plain(&self.name)?;
        expect_step(&self.name, history.len(), step)?;

        let weights = self.weights(query.decoder_state)?;
        let context = weights
            .unsqueeze(2)?
            .broadcast_mul(&self.states)?
            .sum(1)?;
        let history = history.push(context.clone(), weights);
        Ok((context, AttentionLoopState::Plain(history)))
    }

    fn finalize(
        &self,
        key: &str,
        loop_state: AttentionLoopState,
        histories: &mut AttentionHistories,
    ) -> Result<(), AttentionError> {
        let history = loop_state.into_plain(&self.name)?;
        if let Some(weights) = history.stacked_weights()? {
            histories.insert(&self.name, key, weights);
        }
        Ok(())
    }
}
