//! Encoder collaborator contract.
//!
//! Decoders consume encoders only through these traits: a pooled `encoded`
//! vector for the initial state, per-position `hidden_states` with a validity
//! mask for attention, and optionally the ability to build an attention
//! object of their own.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::core::{Attention, AttentionDims, AttentionError};
use crate::single::AdditiveAttention;

/// Outputs of an encoder for one batch.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    /// Pooled representation, `(batch, encoded_size)`.
    fn encoded(&self) -> &Tensor;

    /// Per-position states, `(batch, time, state_size)`, if the encoder has them.
    fn hidden_states(&self) -> Option<&Tensor>;

    /// Validity mask matching [`Encoder::hidden_states`], `(batch, time)`.
    fn input_mask(&self) -> Option<&Tensor>;

    /// Returns the attention-producing capability if the encoder has one.
    fn as_attentive(&self) -> Option<&dyn Attentive> {
        None
    }
}

/// Encoders that can build an attention object for a decoder.
pub trait Attentive: Encoder {
    /// Builds the attention object, requesting parameters under `vb`.
    fn create_attention_object(
        &self,
        dims: AttentionDims,
        vb: VarBuilder,
    ) -> Result<Box<dyn Attention>, AttentionError>;
}

/// Hidden states and mask of an encoder, required by position-level attention.
pub(crate) fn attention_tensors(encoder: &dyn Encoder) -> Result<(&Tensor, &Tensor), AttentionError> {
    let states = encoder
        .hidden_states()
        .ok_or_else(|| AttentionError::MissingEncoderTensor {
            encoder: encoder.name().to_string(),
            tensor: "attention tensor",
        })?;
    let mask = encoder
        .input_mask()
        .ok_or_else(|| AttentionError::MissingEncoderTensor {
            encoder: encoder.name().to_string(),
            tensor: "attention mask",
        })?;
    Ok((states, mask))
}

/// Plain single-source encoder output with additive attention.
#[derive(Debug, Clone)]
pub struct EncodedSequence {
    name: String,
    hidden_states: Tensor,
    input_mask: Tensor,
    encoded: Tensor,
    attentive: bool,
}

impl EncodedSequence {
    /// Wraps encoder outputs after validating their shapes.
    pub fn new(
        name: impl Into<String>,
        hidden_states: Tensor,
        input_mask: Tensor,
        encoded: Tensor,
    ) -> Result<Self, AttentionError> {
        let name = name.into();
        let (batch, time, _) = hidden_states.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!("{name}.hidden_states must be [batch, time, state]"),
        })?;
        if input_mask.dims() != [batch, time] {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "{name}.input_mask expected [{batch}, {time}] got {:?}",
                    input_mask.dims()
                ),
            });
        }
        match encoded.dims() {
            [b, _] if *b == batch => {}
            dims => {
                return Err(AttentionError::InvalidShape {
                    context: format!("{name}.encoded expected [{batch}, size] got {dims:?}"),
                })
            }
        }
        Ok(Self {
            name,
            hidden_states,
            input_mask,
            encoded,
            attentive: true,
        })
    }

    /// Disables the attention capability, leaving only the pooled output.
    pub fn without_attention(mut self) -> Self {
        self.attentive = false;
        self
    }

    pub fn state_size(&self) -> usize {
        self.hidden_states.dims()[2]
    }

    pub fn batch_size(&self) -> usize {
        self.hidden_states.dims()[0]
    }
}

impl Encoder for EncodedSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn encoded(&self) -> &Tensor {
        &self.encoded
    }

    fn hidden_states(&self) -> Option<&Tensor> {
        Some(&self.hidden_states)
    }

    fn input_mask(&self) -> Option<&Tensor> {
        Some(&self.input_mask)
    }

    fn as_attentive(&self) -> Option<&dyn Attentive> {
        if self.attentive {
            Some(self)
        } else {
            None
        }
    }
}

impl Attentive for EncodedSequence {
    fn create_attention_object(
        &self,
        dims: AttentionDims,
        vb: VarBuilder,
    ) -> Result<Box<dyn Attention>, AttentionError> {
        let attention = AdditiveAttention::new(
            format!("attention_{}", self.name),
            &self.hidden_states,
            &self.input_mask,
            dims,
            vb,
        )?;
        Ok(Box::new(attention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn rejects_mask_of_wrong_length() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let states = Tensor::zeros((2, 4, 3), DType::F32, &device)?;
        let mask = Tensor::ones((2, 5), DType::F32, &device)?;
        let encoded = Tensor::zeros((2, 3), DType::F32, &device)?;
        let err = EncodedSequence::new("src", states, mask, encoded).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn attention_capability_can_be_disabled() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let encoder = EncodedSequence::new(
            "src",
            Tensor::zeros((1, 2, 3), DType::F32, &device)?,
            Tensor::ones((1, 2), DType::F32, &device)?,
            Tensor::zeros((1, 3), DType::F32, &device)?,
        )
        .unwrap();
        assert!(encoder.as_attentive().is_some());
        assert!(encoder.without_attention().as_attentive().is_none());
        Ok(())
    }
}
