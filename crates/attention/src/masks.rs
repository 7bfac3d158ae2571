//! Mask helpers shared by attention implementations.
//!
//! Validity masks are multiplicative `f32` tensors shaped `(batch, positions)`
//! holding `1.0` for real positions and `0.0` for padding.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::AttentionError;

/// Dtype shared by all validity masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Added to the row sum before renormalizing so empty masks stay finite.
pub const RENORM_EPSILON: f64 = 1e-8;

/// Softmax over the last axis, re-weighted by `mask` and renormalized.
///
/// Masked positions receive exactly zero weight. A row whose mask is all
/// zeros yields an all-zero distribution instead of dividing by zero.
pub fn renorm_softmax(logits: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let weights = softmax_last_dim(logits)?.mul(mask)?;
    let norm = weights.sum_keepdim(1)?.affine(1.0, RENORM_EPSILON)?;
    weights.broadcast_div(&norm)
}

/// All-ones mask for a single extra candidate such as the sentinel.
pub fn ones_column(batch: usize, device: &Device) -> Result<Tensor> {
    Tensor::ones((batch, 1), MASK_DTYPE, device)
}

/// Builds a validity mask from per-sequence lengths.
pub fn mask_from_lengths(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; lengths.len() * max_len];
    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(max_len);
        for slot in &mut data[b * max_len..b * max_len + valid] {
            *slot = 1.0;
        }
    }
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// Ratio between a (possibly beam-expanded) query batch and the encoder batch.
pub fn beam_factor(query_batch: usize, encoder_batch: usize) -> std::result::Result<usize, AttentionError> {
    if encoder_batch == 0 || query_batch % encoder_batch != 0 {
        return Err(AttentionError::BeamTiling {
            query_batch,
            encoder_batch,
        });
    }
    Ok(query_batch / encoder_batch)
}

/// Repeats the whole batch `factor` times along the first axis.
pub fn tile_batch(tensor: &Tensor, factor: usize) -> Result<Tensor> {
    if factor == 1 {
        return Ok(tensor.clone());
    }
    let mut repeats = vec![1usize; tensor.rank()];
    repeats[0] = factor;
    tensor.repeat(repeats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renorm_sums_to_one_over_valid_positions() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.3f32, -1.2, 2.0, 0.5], [1.0, 1.0, 1.0, 1.0]], &device)?;
        let mask = mask_from_lengths(&[2, 4], 4, &device)?;
        let weights = renorm_softmax(&logits, &mask)?.to_vec2::<f32>()?;
        for row in &weights {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        assert_eq!(weights[0][2], 0.0);
        assert_eq!(weights[0][3], 0.0);
        Ok(())
    }

    #[test]
    fn renorm_handles_all_zero_mask() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.3f32, -1.2, 2.0]], &device)?;
        let mask = Tensor::zeros((1, 3), MASK_DTYPE, &device)?;
        let weights = renorm_softmax(&logits, &mask)?.to_vec2::<f32>()?;
        assert!(weights[0].iter().all(|w| w.is_finite() && *w == 0.0));
        Ok(())
    }

    #[test]
    fn beam_factor_requires_integral_ratio() {
        assert_eq!(beam_factor(6, 2).unwrap(), 3);
        assert_eq!(beam_factor(2, 2).unwrap(), 1);
        assert!(matches!(
            beam_factor(5, 2),
            Err(AttentionError::BeamTiling { query_batch: 5, encoder_batch: 2 })
        ));
    }

    #[test]
    fn tile_batch_repeats_whole_batch() -> Result<()> {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[1f32], [2.0]], &device)?;
        let tiled = tile_batch(&tensor, 2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(tiled, vec![1.0, 2.0, 1.0, 2.0]);
        Ok(())
    }
}
