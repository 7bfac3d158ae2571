//! Linear and affine projection helpers.
//!
//! Linear layers accept inputs shaped `(batch, in_dim)` or
//! `(batch, seq, in_dim)` and return the same leading layout with `out_dim`
//! features. The decoder frequently projects a *list* of tensors at once
//! (the embedded input together with the previous attention contexts, or a
//! cell output together with the new contexts); [`Linear::forward_concat`]
//! concatenates them along the feature axis before the projection so a single
//! weight matrix covers the whole list.
//!
//! Parameters are requested from a [`VarBuilder`] under the names `weight`
//! (`(out_dim, in_dim)`) and `bias` (`(out_dim,)`), so rebuilding a layer under
//! the same prefix ties it to the existing variables.

use candle_core::{Error, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::checks;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Disables the bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Uniform in `[-bound, bound]`.
    Uniform { bound: f64 },
    /// Zero-mean normal with the given standard deviation.
    Normal { stdev: f64 },
}

impl LinearInit {
    fn to_init(&self, fan_in: usize, fan_out: usize) -> Init {
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out) as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            LinearInit::Uniform { bound } => Init::Uniform {
                lo: -bound,
                up: *bound,
            },
            LinearInit::Normal { stdev } => Init::Randn {
                mean: 0.0,
                stdev: *stdev,
            },
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_shape("linear.weight", &weight, &[config.output_dim, config.input_dim])?;
        match (config.bias, bias.as_ref()) {
            (true, Some(tensor)) => checks::expect_shape("linear.bias", tensor, &[config.output_dim])?,
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Requests (or reuses) the parameters under `vb` with a zero-initialised bias.
    pub fn build(config: LinearConfig, init: &LinearInit, vb: VarBuilder) -> Result<Self> {
        Self::build_with_bias(config, init, 0.0, vb)
    }

    /// Like [`Linear::build`] but with a constant bias initialiser.
    pub fn build_with_bias(
        config: LinearConfig,
        init: &LinearInit,
        bias_value: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.output_dim, config.input_dim),
            "weight",
            init.to_init(config.input_dim, config.output_dim),
        )?;
        let bias = if config.bias {
            Some(vb.get_with_hints(config.output_dim, "bias", Init::Const(bias_value))?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor, shaped `(out_dim, in_dim)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Applies the projection to a rank-2 or rank-3 input.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let weight_t = self.weight.t()?;
        let output = match hidden.dims() {
            [batch, seq, _] => {
                let flat = hidden.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *seq, self.config.output_dim))?
            }
            [_, _] => hidden.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, H_in] or [B, H_in], got {:?}",
                    dims
                )))
            }
        };
        match &self.bias {
            Some(bias) => output.broadcast_add(bias),
            None => Ok(output),
        }
    }

    /// Concatenates `inputs` along the last axis and projects the result.
    pub fn forward_concat(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        match inputs {
            [] => Err(Error::Msg("linear.forward_concat requires at least one input".into())),
            [single] => self.forward(single),
            many => {
                let rank = many[0].rank();
                let joined = Tensor::cat(many, rank - 1)?;
                self.forward(&joined)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn forward_matches_reference_for_both_ranks() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 0.5, (4, 3), &device)?;
        let bias = Tensor::randn(0f32, 0.1, 4, &device)?;
        let linear = Linear::new(LinearConfig::new(3, 4), weight.clone(), Some(bias.clone()))?;

        let input = Tensor::randn(0f32, 1.0, (2, 3), &device)?;
        let expected = input.matmul(&weight.t()?)?.broadcast_add(&bias)?;
        assert!(max_abs_diff(&linear.forward(&input)?, &expected)? < 1e-5);

        let seq_input = Tensor::randn(0f32, 1.0, (2, 5, 3), &device)?;
        let output = linear.forward(&seq_input)?;
        assert_eq!(output.dims(), &[2, 5, 4]);
        let row = seq_input.narrow(1, 2, 1)?.squeeze(1)?;
        let expected_row = row.matmul(&weight.t()?)?.broadcast_add(&bias)?;
        let actual_row = output.narrow(1, 2, 1)?.squeeze(1)?;
        assert!(max_abs_diff(&actual_row, &expected_row)? < 1e-5);
        Ok(())
    }

    #[test]
    fn forward_concat_equals_projection_of_joined_input() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let linear = Linear::build(LinearConfig::new(5, 2), &LinearInit::XavierUniform, vb)?;

        let a = Tensor::randn(0f32, 1.0, (3, 2), &device)?;
        let b = Tensor::randn(0f32, 1.0, (3, 3), &device)?;
        let joined = Tensor::cat(&[&a, &b], 1)?;
        let diff = max_abs_diff(&linear.forward_concat(&[&a, &b])?, &linear.forward(&joined)?)?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn rebuilding_under_same_prefix_ties_parameters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let first = Linear::build(
            LinearConfig::new(4, 4),
            &LinearInit::Normal { stdev: 1.0 },
            vb.pp("proj"),
        )?;
        let second = Linear::build(
            LinearConfig::new(4, 4),
            &LinearInit::Normal { stdev: 1.0 },
            vb.pp("proj"),
        )?;
        assert_eq!(max_abs_diff(first.weight(), second.weight())?, 0.0);
        assert_eq!(varmap.all_vars().len(), 2);
        Ok(())
    }

    #[test]
    fn constant_bias_initialiser_is_applied() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let linear = Linear::build_with_bias(
            LinearConfig::new(2, 8),
            &LinearInit::Uniform { bound: 0.5 },
            -(8f64).ln(),
            vb,
        )?;
        let bias = linear.bias().expect("bias").to_vec1::<f32>()?;
        assert!(bias.iter().all(|b| (b + 8f32.ln()).abs() < 1e-6));
        let weights = linear.weight().flatten_all()?.to_vec1::<f32>()?;
        assert!(weights.iter().all(|w| w.abs() <= 0.5));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_input_width() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::new(
            LinearConfig::new(3, 2).without_bias(),
            Tensor::zeros((2, 3), DType::F32, &device)?,
            None,
        )?;
        let input = Tensor::zeros((4, 5), DType::F32, &device)?;
        assert!(linear.forward(&input).is_err());
        Ok(())
    }
}
