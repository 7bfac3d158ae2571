//! Masked sequence cross-entropy over time-major logits.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::config::OutputAveraging;
use crate::error::{DecoderError, Result};

/// Added to every normalizer so fully masked sequences give a zero loss.
pub const LOSS_EPSILON: f64 = 1e-12;

fn check_shapes(logits: &Tensor, targets: &Tensor, weights: &Tensor) -> Result<(usize, usize)> {
    let (time, batch, _) = logits.dims3().map_err(|_| {
        DecoderError::InvalidConfig(format!(
            "logits must be [time, batch, vocabulary], got {:?}",
            logits.dims()
        ))
    })?;
    for (label, tensor) in [("targets", targets), ("weights", weights)] {
        if tensor.dims() != [time, batch] {
            return Err(DecoderError::InvalidConfig(format!(
                "{label} expected [{time}, {batch}] got {:?}",
                tensor.dims()
            )));
        }
    }
    Ok((time, batch))
}

/// Negative log-likelihood of every target token, `[time, batch]`.
pub fn token_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let indices = targets.to_dtype(DType::U32)?.unsqueeze(2)?;
    Ok(log_probs.gather(&indices, 2)?.squeeze(2)?.neg()?)
}

/// Length-normalized cross-entropy of every sequence, `[batch]`.
pub fn sequence_xents(logits: &Tensor, targets: &Tensor, weights: &Tensor) -> Result<Tensor> {
    check_shapes(logits, targets, weights)?;
    let weights = weights.to_dtype(DType::F32)?;
    let weighted = (token_cross_entropy(logits, targets)? * &weights)?.sum(0)?;
    let lengths = weights.sum(0)?.affine(1.0, LOSS_EPSILON)?;
    Ok(weighted.div(&lengths)?)
}

/// Scalar loss reduced according to `averaging`.
pub fn sequence_loss(
    logits: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
    averaging: OutputAveraging,
) -> Result<Tensor> {
    match averaging {
        OutputAveraging::PerExample => Ok(sequence_xents(logits, targets, weights)?.mean_all()?),
        OutputAveraging::BatchMean => {
            check_shapes(logits, targets, weights)?;
            let weights = weights.to_dtype(DType::F32)?;
            let total = (token_cross_entropy(logits, targets)? * &weights)?.sum_all()?;
            let count = weights.sum_all()?.affine(1.0, LOSS_EPSILON)?;
            Ok(total.div(&count)?)
        }
    }
}

/// Cuts logits and references to their common time extent.
///
/// A free-running unroll may stop before or after the reference ends; the
/// comparison only covers the steps both have.
pub fn truncate_to_shorter(
    logits: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
) -> Result<(Tensor, Tensor, Tensor)> {
    let time = logits.dim(0)?.min(targets.dim(0)?);
    Ok((
        logits.narrow(0, 0, time)?,
        targets.narrow(0, 0, time)?,
        weights.narrow(0, 0, time)?,
    ))
}
