//! Flat attention combination.
//!
//! The states of every encoder are projected into one shared space (one
//! projection per encoder) and a single distribution is computed over the
//! concatenation of all their positions, optionally extended by the sentinel.
//! The context vector is the weighted sum of a second projection of the same
//! states, or of the logit projection when projections are shared.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{checks, Linear, LinearConfig, LinearInit};

use crate::core::state::expect_step;
use crate::core::{
    Attention, AttentionDims, AttentionError, AttentionHistories, AttentionHistory,
    AttentionLoopState, AttentionQuery, CombinationConfig,
};
use crate::encoder::{attention_tensors, Encoder};
use crate::masks::{beam_factor, ones_column, renorm_softmax, tile_batch};
use crate::scoring::{
    additive_logits, attention_vector, scalar_bias, VectorScorer, ATTENTION_INIT_STDEV,
};
use crate::sentinel::Sentinel;

#[derive(Debug)]
struct SentinelScoring {
    sentinel: Sentinel,
    scorer: VectorScorer,
}

#[derive(Debug)]
pub struct FlatAttention {
    name: String,
    attention_size: usize,
    encoder_batch: usize,
    logit_projections: Vec<Tensor>,
    logit_biases: Vec<Tensor>,
    ctx_projections: Tensor,
    masks: Tensor,
    state_projection: Linear,
    attn_v: Tensor,
    sentinel: Option<SentinelScoring>,
}

fn project_encoders(
    encoders: &[Arc<dyn Encoder>],
    attention_size: usize,
    vb: VarBuilder,
) -> Result<Vec<Tensor>, AttentionError> {
    encoders
        .iter()
        .enumerate()
        .map(|(i, encoder)| {
            let (states, _) = attention_tensors(encoder.as_ref())?;
            let state_size = states.dims().last().copied().unwrap_or(0);
            let projection = Linear::build(
                LinearConfig::new(state_size, attention_size),
                &LinearInit::Normal {
                    stdev: ATTENTION_INIT_STDEV,
                },
                vb.pp(format!("proj_{i}")),
            )?;
            Ok(projection.forward(states)?)
        })
        .collect()
}

impl FlatAttention {
    /// Builds the combination over `encoders` under `vb.pp(name)`.
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

        let mut masks = Vec::with_capacity(encoders.len());
        let mut encoder_batch = None;
        for encoder in encoders {
            let (states, mask) = attention_tensors(encoder.as_ref())?;
            if states.rank() != 3 || mask.rank() != 2 {
                return Err(AttentionError::InvalidShape {
                    context: format!(
                        "{}: states {:?} / mask {:?}",
                        encoder.name(),
                        states.dims(),
                        mask.dims()
                    ),
                });
            }
            let batch = states.dims()[0];
            if *encoder_batch.get_or_insert(batch) != batch {
                return Err(AttentionError::InvalidShape {
                    context: format!("{name}: encoders disagree on batch size"),
                });
            }
            masks.push(mask.clone());
        }
        let encoder_batch = encoder_batch.unwrap_or(0);

        let logit_projections =
            project_encoders(encoders, attention_size, vb.pp("logits_projections"))?;
        let logit_biases = (0..encoders.len())
            .map(|i| scalar_bias(&format!("attn_bias_{i}"), &vb))
            .collect::<Result<Vec<_>, _>>()?;
        let ctx_projections = if config.share_projections {
            logit_projections.clone()
        } else {
            project_encoders(encoders, attention_size, vb.pp("context_projections"))?
        };

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
                    !config.share_projections,
                    vb.pp("sentinel_logit"),
                )?,
            })
        } else {
            None
        };

        log::debug!(
            "attention::flat init name={} encoders={} state_size={} sentinel={} shared={}",
            name,
            encoders.len(),
            attention_size,
            config.use_sentinels,
            config.share_projections
        );

        Ok(Self {
            name,
            attention_size,
            encoder_batch,
            logit_projections,
            logit_biases,
            ctx_projections: Tensor::cat(&ctx_projections, 1)?,
            masks: Tensor::cat(&masks, 1)?,
            state_projection,
            attn_v,
            sentinel,
        })
    }

    /// Number of attention candidates: all encoder positions plus the sentinel.
    pub fn candidates(&self) -> usize {
        self.masks.dims()[1] + usize::from(self.sentinel.is_some())
    }
}

impl Attention for FlatAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_size(&self) -> usize {
        self.attention_size
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

        let projected_state = self.state_projection.forward(query.decoder_state)?.unsqueeze(1)?;
        let query_batch = projected_state.dims()[0];
        let factor = if self.sentinel.is_some() {
            beam_factor(query_batch, self.encoder_batch)?
        } else {
            checks::expect_same_batch(&self.name, query.decoder_state, &self.masks)?;
            1
        };

        let mut logits = Vec::with_capacity(self.logit_projections.len() + 1);
        for (projection, bias) in self.logit_projections.iter().zip(self.logit_biases.iter()) {
            let keys = tile_batch(projection, factor)?;
            logits.push(additive_logits(&projected_state, &keys, &self.attn_v)?.broadcast_add(bias)?);
        }

        let mut masks = vec![tile_batch(&self.masks, factor)?];
        let mut projections = vec![tile_batch(&self.ctx_projections, factor)?];
        if let Some(SentinelScoring { sentinel, scorer }) = &self.sentinel {
            let value = sentinel.value(query)?;
            let (projected_sentinel, sentinel_logit) =
                scorer.score(&projected_state, &self.attn_v, &value)?;
            logits.push(sentinel_logit);
            masks.push(ones_column(query_batch, projected_state.device())?);
            projections.push(projected_sentinel);
        }

        let weights = renorm_softmax(&Tensor::cat(&logits, 1)?, &Tensor::cat(&masks, 1)?)?;
        let context = weights
            .unsqueeze(2)?
            .broadcast_mul(&Tensor::cat(&projections, 1)?)?
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
