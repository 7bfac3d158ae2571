//! Additive (tanh) scoring shared by the attention variants.

use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};
use layers::{Linear, LinearConfig, LinearInit};

use crate::core::AttentionError;

/// Standard deviation of the normal initialiser used for attention parameters.
pub const ATTENTION_INIT_STDEV: f64 = 0.001;

/// Requests the attention vector `v`, shaped `(1, 1, attention_size)`.
pub fn attention_vector(attention_size: usize, vb: &VarBuilder) -> Result<Tensor, AttentionError> {
    Ok(vb.get_with_hints(
        (1, 1, attention_size),
        "attn_v",
        Init::Randn {
            mean: 0.0,
            stdev: ATTENTION_INIT_STDEV,
        },
    )?)
}

/// Requests a scalar bias initialised to zero.
pub fn scalar_bias(name: &str, vb: &VarBuilder) -> Result<Tensor, AttentionError> {
    Ok(vb.get_with_hints((), name, Init::Const(0.0))?)
}

/// `sum(v * tanh(state + keys), -1)` for keys shaped `(batch, positions, attention)`.
///
/// `projected_state` must be `(batch, 1, attention)` and `attn_v`
/// `(1, 1, attention)`; the result is `(batch, positions)`.
pub fn additive_logits(
    projected_state: &Tensor,
    keys: &Tensor,
    attn_v: &Tensor,
) -> Result<Tensor, AttentionError> {
    let (batch, one, size) = projected_state
        .dims3()
        .map_err(|_| AttentionError::InvalidShape {
            context: format!(
                "projected decoder state must be [batch, 1, attention], got {:?}",
                projected_state.dims()
            ),
        })?;
    let (key_batch, _, key_size) = keys.dims3().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "attention keys must be [batch, positions, attention], got {:?}",
            keys.dims()
        ),
    })?;
    if one != 1 || key_batch != batch || key_size != size {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "scoring expects state [{key_batch}, 1, {key_size}] got {:?}",
                projected_state.dims()
            ),
        });
    }
    let energies = keys.broadcast_add(projected_state)?.tanh()?;
    Ok(energies.broadcast_mul(attn_v)?.sum(D::Minus1)?)
}

/// Scores a single vector (a child context or the sentinel) against the
/// projected decoder state.
#[derive(Debug, Clone)]
pub struct VectorScorer {
    projection: Linear,
    ctx_projection: Option<Linear>,
    bias: Tensor,
}

impl VectorScorer {
    /// Builds the scorer under `vb`, which should already carry the `<scope>_logit` prefix.
    ///
    /// With `separate_ctx` the context contribution uses its own projection
    /// instead of the logit projection.
    pub fn new(
        value_size: usize,
        attention_size: usize,
        separate_ctx: bool,
        vb: VarBuilder,
    ) -> Result<Self, AttentionError> {
        let config = LinearConfig::new(value_size, attention_size);
        let projection = Linear::build(
            config.clone(),
            &LinearInit::XavierUniform,
            vb.pp("vector_projection"),
        )?;
        let ctx_projection = if separate_ctx {
            Some(Linear::build(
                config,
                &LinearInit::XavierUniform,
                vb.pp("vector_ctx_proj"),
            )?)
        } else {
            None
        };
        let bias = scalar_bias("vector_bias", &vb)?;
        Ok(Self {
            projection,
            ctx_projection,
            bias,
        })
    }

    /// Returns the context contribution `(batch, 1, attention)` and the logit `(batch, 1)`.
    pub fn score(
        &self,
        projected_state: &Tensor,
        attn_v: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        if value.rank() != 2 {
            return Err(AttentionError::InvalidShape {
                context: format!("scored vector must be [batch, size], got {:?}", value.dims()),
            });
        }
        let for_logit = self.projection.forward(value)?.unsqueeze(1)?;
        let for_ctx = match &self.ctx_projection {
            Some(projection) => projection.forward(value)?.unsqueeze(1)?,
            None => for_logit.clone(),
        };
        let logit = additive_logits(projected_state, &for_logit, attn_v)?.broadcast_add(&self.bias)?;
        Ok((for_ctx, logit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn additive_logits_rejects_rank_mismatch() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let state = Tensor::zeros((2, 4), DType::F32, &device)?;
        let keys = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
        let attn_v = Tensor::ones((1, 1, 4), DType::F32, &device)?;
        assert!(matches!(
            additive_logits(&state, &keys, &attn_v),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn additive_logits_match_manual_computation() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let state = Tensor::new(&[[[0.5f32, -0.5]]], &device)?;
        let keys = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0], [0.0, 0.0]]], &device)?;
        let attn_v = Tensor::new(&[[[2f32, 1.0]]], &device)?;
        let logits = additive_logits(&state, &keys, &attn_v).unwrap().to_vec2::<f32>()?;
        let expected = [
            2.0 * 1.5f32.tanh() + (-0.5f32).tanh(),
            2.0 * 0.5f32.tanh() + 0.5f32.tanh(),
            2.0 * 0.5f32.tanh() + (-0.5f32).tanh(),
        ];
        for (actual, expected) in logits[0].iter().zip(expected.iter()) {
            assert!((actual - expected).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn shared_scorer_reuses_logit_projection_for_context() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let scorer = VectorScorer::new(3, 4, false, vb.pp("sentinel_logit")).unwrap();
        let state = Tensor::randn(0f32, 1.0, (2, 1, 4), &device)?;
        let attn_v = Tensor::ones((1, 1, 4), DType::F32, &device)?;
        let value = Tensor::randn(0f32, 1.0, (2, 3), &device)?;
        let (ctx, logit) = scorer.score(&state, &attn_v, &value).unwrap();
        assert_eq!(ctx.dims(), &[2, 1, 4]);
        assert_eq!(logit.dims(), &[2, 1]);
        // weight + bias of the single projection, plus the scalar bias
        assert_eq!(varmap.all_vars().len(), 3);
        Ok(())
    }
}
