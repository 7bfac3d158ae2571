//! Sentinel vector: a gated copy of the decoder state offered to the
//! attention as an extra candidate, letting the decoder rely on itself
//! instead of the encoders.

use candle_core::Tensor;
use candle_nn::ops::sigmoid;
use candle_nn::VarBuilder;
use layers::{Linear, LinearConfig, LinearInit};

use crate::core::{AttentionDims, AttentionError, AttentionQuery};

#[derive(Debug, Clone)]
pub struct Sentinel {
    gate: Linear,
}

impl Sentinel {
    /// Builds the gate under `vb.pp("sentinel")`.
    pub fn new(dims: AttentionDims, vb: &VarBuilder) -> Result<Self, AttentionError> {
        let gate = Linear::build(
            LinearConfig::new(dims.decoder_state + dims.decoder_input, dims.decoder_state),
            &LinearInit::XavierUniform,
            vb.pp("sentinel"),
        )?;
        Ok(Self { gate })
    }

    /// `sigmoid(W [prev_state; input] + b) * state`, shaped `(batch, decoder_state)`.
    pub fn value(&self, query: &AttentionQuery<'_>) -> Result<Tensor, AttentionError> {
        let gate = sigmoid(
            &self
                .gate
                .forward_concat(&[query.prev_decoder_state, query.decoder_input])?,
        )?;
        Ok(gate.mul(query.decoder_state)?)
    }
}
