//! Encoder wrapper performing attention combination.
//!
//! To a decoder the wrapper looks like a single attentive encoder: its pooled
//! output is the concatenation of the wrapped encoders' pooled outputs and its
//! attention object is the configured combination strategy. It has no
//! per-position states of its own.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::core::{
    Attention, AttentionDims, AttentionError, CombinationConfig, CombinationStrategy,
};
use crate::encoder::{Attentive, Encoder};
use crate::flat::FlatAttention;
use crate::hierarchical::HierarchicalAttention;

pub struct EncoderWrapper {
    name: String,
    encoders: Vec<Arc<dyn Encoder>>,
    config: CombinationConfig,
    encoded: Tensor,
}

impl std::fmt::Debug for EncoderWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderWrapper")
            .field("name", &self.name)
            .field(
                "encoders",
                &self.encoders.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl EncoderWrapper {
    pub fn new(
        name: impl Into<String>,
        encoders: Vec<Arc<dyn Encoder>>,
        config: CombinationConfig,
    ) -> Result<Self, AttentionError> {
        let name = name.into();
        if encoders.is_empty() {
            return Err(AttentionError::InvalidShape {
                context: format!("encoder wrapper '{name}' needs at least one encoder"),
            });
        }
        let pooled: Vec<&Tensor> = encoders.iter().map(|e| e.encoded()).collect();
        let encoded = Tensor::cat(&pooled, 1)?;
        Ok(Self {
            name,
            encoders,
            config,
            encoded,
        })
    }

    pub fn encoders(&self) -> &[Arc<dyn Encoder>] {
        &self.encoders
    }

    pub fn config(&self) -> &CombinationConfig {
        &self.config
    }
}

impl Encoder for EncoderWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn encoded(&self) -> &Tensor {
        &self.encoded
    }

    fn hidden_states(&self) -> Option<&Tensor> {
        None
    }

    fn input_mask(&self) -> Option<&Tensor> {
        None
    }

    fn as_attentive(&self) -> Option<&dyn Attentive> {
        Some(self)
    }
}

impl Attentive for EncoderWrapper {
    fn create_attention_object(
        &self,
        dims: AttentionDims,
        vb: VarBuilder,
    ) -> Result<Box<dyn Attention>, AttentionError> {
        let name = format!("attention_{}", self.name);
        Ok(match self.config.strategy {
            CombinationStrategy::Flat => Box::new(FlatAttention::new(
                name,
                &self.encoders,
                &self.config,
                dims,
                vb,
            )?),
            CombinationStrategy::Hierarchical => Box::new(HierarchicalAttention::new(
                name,
                &self.encoders,
                &self.config,
                dims,
                vb,
            )?),
        })
    }
}
