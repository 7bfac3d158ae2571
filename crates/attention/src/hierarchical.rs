//! Hierarchical attention combination.
//!
//! Every wrapped encoder first computes its own context vector with its own
//! attention object. A second attention then scores each of those contexts
//! (and the optional sentinel) against the decoder state, applies a plain
//! softmax across them and mixes their projections into the final context.
//! Child attentions already respect their masks, so the top level does not
//! renormalize.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;
use candle_nn::VarBuilder;
use layers::{Linear, LinearConfig, LinearInit};

use crate::core::state::expect_step;
use crate::core::{
    Attention, AttentionDims, AttentionError, AttentionHistories, AttentionHistory,
    AttentionLoopState, AttentionQuery, CombinationConfig, HierarchicalLoopState,
};
use crate::encoder::Encoder;
use crate::scoring::{attention_vector, VectorScorer};
use crate::sentinel::Sentinel;

#[derive(Debug)]
struct Child {
    attention: Box<dyn Attention>,
    scorer: VectorScorer,
    output_projection: Option<Linear>,
}

#[derive(Debug)]
struct SentinelScoring {
    sentinel: Sentinel,
    scorer: VectorScorer,
    output_projection: Option<Linear>,
}

#[derive(Debug)]
pub struct HierarchicalAttention {
    name: String,
    attention_size: usize,
    children: Vec<Child>,
    state_projection: Linear,
    attn_v: Tensor,
    sentinel: Option<SentinelScoring>,
}

fn output_projection(
    shared: bool,
    input_size: usize,
    attention_size: usize,
    vb: VarBuilder,
) -> Result<Option<Linear>, AttentionError> {
    if shared {
        return Ok(None);
    }
    Ok(Some(Linear::build(
        LinearConfig::new(input_size, attention_size),
        &LinearInit::XavierUniform,
        vb,
    )?))
}

impl HierarchicalAttention {
    /// Builds the combination under `vb.pp(name)`; child attention objects
    /// are created by the encoders themselves inside the same scope.
    pub fn new(
        name: impl Into<String>,
        encoders: &[Arc<dyn Encoder>],
        config: &CombinationConfig,
        dims: AttentionDims,
        vb: VarBuilder,
    ) -> Result<Self, AttentionError> {
        let name = name.into();
        if encoders.is_empty() {
            return Err(AttentionError::InvalidShape {
                context: format!("{name} needs at least one encoder"),
            });
        }
        let vb = vb.pp(&name);
        let attention_size = config.state_size;
        let shared = config.share_projections;

        let mut children = Vec::with_capacity(encoders.len());
        for encoder in encoders {
            let attentive = encoder
                .as_attentive()
                .ok_or_else(|| AttentionError::NotAttentive {
                    encoder: encoder.name().to_string(),
                })?;
            let attention = attentive.create_attention_object(dims, vb.clone())?;
            let context_size = attention.context_size();
            let scorer = VectorScorer::new(
                context_size,
                attention_size,
                false,
                vb.pp(format!("{}_logit", encoder.name())),
            )?;
            let output_projection = output_projection(
                shared,
                context_size,
                attention_size,
                vb.pp(format!("proj_attn_{}", encoder.name())),
            )?;
            children.push(Child {
                attention,
                scorer,
                output_projection,
            });
        }

        let state_projection = Linear::build(
            LinearConfig::new(dims.decoder_state, attention_size),
            &LinearInit::XavierUniform,
            vb.pp("state_projection"),
        )?;
        let attn_v = attention_vector(attention_size, &vb)?;

        let sentinel = if config.use_sentinels {
            Some(SentinelScoring {
                sentinel: Sentinel::new(dims, &vb)?,
                scorer: VectorScorer::new(
                    dims.decoder_state,
                    attention_size,
                    false,
                    vb.pp("sentinel_logit"),
                )?,
                output_projection: output_projection(
                    shared,
                    dims.decoder_state,
                    attention_size,
                    vb.pp("proj_sentinel"),
                )?,
            })
        } else {
            None
        };

        log::debug!(
            "attention::hierarchical init name={} children={} state_size={} sentinel={} shared={}",
            name,
            children.len(),
            attention_size,
            config.use_sentinels,
            shared
        );

        Ok(Self {
            name,
            attention_size,
            children,
            state_projection,
            attn_v,
            sentinel,
        })
    }

    /// Names of the child attention objects, in encoder order.
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.attention.name()).collect()
    }
}

impl Attention for HierarchicalAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_size(&self) -> usize {
        self.attention_size
    }

    fn initial_loop_state(&self) -> AttentionLoopState {
        AttentionLoopState::Hierarchical(HierarchicalLoopState {
            children: self
                .children
                .iter()
                .map(|child| child.attention.initial_loop_state())
                .collect(),
            combination: AttentionHistory::new(),
        })
    }

    fn attend(
        &self,
        query: &AttentionQuery<'_>,
        loop_state: AttentionLoopState,
        step: usize,
    ) -> Result<(Tensor, AttentionLoopState), AttentionError> {
        let state = loop_state.into_hierarchical(&self.name)?;
        expect_step(&self.name, state.combination.len(), step)?;
        if state.children.len() != self.children.len() {
            return Err(AttentionError::LoopState {
                context: format!(
                    "{} has {} children but received {} child states",
                    self.name,
                    self.children.len(),
                    state.children.len()
                ),
            });
        }

        let projected_state = self.state_projection.forward(query.decoder_state)?.unsqueeze(1)?;

        let mut child_states = Vec::with_capacity(self.children.len());
        let mut logits = Vec::with_capacity(self.children.len() + 1);
        let mut outputs = Vec::with_capacity(self.children.len() + 1);
        for (child, child_state) in self.children.iter().zip(state.children) {
            let (context, next_state) = child.attention.attend(query, child_state, step)?;
            let (projected, logit) = child.scorer.score(&projected_state, &self.attn_v, &context)?;
            let output = match &child.output_projection {
                Some(projection) => projection.forward(&context)?.unsqueeze(1)?,
                None => projected,
            };
            child_states.push(next_state);
            logits.push(logit);
            outputs.push(output);
        }

        if let Some(scoring) = &self.sentinel {
            let value = scoring.sentinel.value(query)?;
            let (projected, logit) = scoring.scorer.score(&projected_state, &self.attn_v, &value)?;
            let output = match &scoring.output_projection {
                Some(projection) => projection.forward(&value)?.unsqueeze(1)?,
                None => projected,
            };
            logits.push(logit);
            outputs.push(output);
        }

        let distribution = softmax_last_dim(&Tensor::cat(&logits, 1)?)?;
        let context = distribution
            .unsqueeze(2)?
            .broadcast_mul(&Tensor::cat(&outputs, 1)?)?
            .sum(1)?;

        let next = HierarchicalLoopState {
            children: child_states,
            combination: state.combination.push(context.clone(), distribution),
        };
        Ok((context, AttentionLoopState::Hierarchical(next)))
    }

    fn finalize(
        &self,
        key: &str,
        loop_state: AttentionLoopState,
        histories: &mut AttentionHistories,
    ) -> Result<(), AttentionError> {
        let state = loop_state.into_hierarchical(&self.name)?;
        for (child, child_state) in self.children.iter().zip(state.children) {
            child.attention.finalize(key, child_state, histories)?;
        }
        if let Some(weights) = state.combination.stacked_weights()? {
            histories.insert(&self.name, key, weights);
        }
        Ok(())
    }
}
