use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        }
    }
}

/// AdamW over named variables with optional global gradient-norm clipping.
///
/// Bias vectors are excluded from weight decay.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        clip_global_norm: Option<f64>,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters but '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like()?;
            let second_moment = tensor.zeros_like()?;
            let apply_weight_decay = !name.ends_with(".bias");
            params.push(ParameterSlot {
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Applies one update from `grads` and returns the gradient norm before clipping.
    ///
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        let mut sum_squares = 0.0f64;
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            sum_squares += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            processed.push(ProcessedGradient { index, grad });
        }

        let total_norm = sum_squares.sqrt();
        if processed.is_empty() {
            return Ok(total_norm);
        }

        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0)?;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)?;
        Ok(total_norm)
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(self.step as i32)).max(EPS);
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(self.step as i32)).max(EPS);

        for item in processed {
            let slot = &mut self.params[item.index];

            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + item.grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + item.grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };
            slot.param.set(&decayed.sub(&update)?)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(learning_rate: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn first_step_moves_each_weight_by_the_learning_rate() -> anyhow::Result<()> {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu)?;
        let mut optimizer =
            TrainerOptimizer::new(vec![("w.weight".into(), var.clone())], config(0.1), None)?;
        let loss = var.as_tensor().sqr()?.sum_all()?;
        let mut grads = loss.backward()?;
        let norm = optimizer.step(&mut grads)?;
        assert!((norm - 20f64.sqrt()).abs() < 1e-5);

        let values = var.as_tensor().to_vec1::<f32>()?;
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] + 1.9).abs() < 1e-5);
        assert_eq!(optimizer.steps(), 1);
        Ok(())
    }

    #[test]
    fn minimizes_a_quadratic() -> anyhow::Result<()> {
        let var = Var::new(&[3.0f32], &Device::Cpu)?;
        let mut optimizer =
            TrainerOptimizer::new(vec![("x.weight".into(), var.clone())], config(0.1), Some(1.0))?;
        for _ in 0..200 {
            let loss = var.as_tensor().sqr()?.sum_all()?;
            let mut grads = loss.backward()?;
            optimizer.step(&mut grads)?;
        }
        let value = var.as_tensor().to_vec1::<f32>()?[0];
        assert!(value.abs() < 0.3, "{value}");
        Ok(())
    }

    #[test]
    fn bias_vectors_skip_weight_decay() -> anyhow::Result<()> {
        let weight = Var::new(&[1.0f32], &Device::Cpu)?;
        let bias = Var::new(&[1.0f32], &Device::Cpu)?;
        let mut config = config(0.1);
        config.weight_decay = 0.5;
        let mut optimizer = TrainerOptimizer::new(
            vec![
                ("proj.weight".into(), weight.clone()),
                ("proj.bias".into(), bias.clone()),
            ],
            config,
            None,
        )?;
        let loss = (weight.as_tensor().sum_all()? + bias.as_tensor().sum_all()?)?.affine(0.0, 0.0)?;
        let mut grads = loss.backward()?;
        optimizer.step(&mut grads)?;

        assert!((weight.as_tensor().to_vec1::<f32>()?[0] - 0.95).abs() < 1e-6);
        assert_eq!(bias.as_tensor().to_vec1::<f32>()?[0], 1.0);
        Ok(())
    }

    #[test]
    fn requires_parameters() {
        assert!(TrainerOptimizer::new(Vec::new(), config(0.1), None).is_err());
    }
}
