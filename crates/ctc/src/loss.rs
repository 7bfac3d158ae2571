//! CTC negative log-likelihood via the forward algorithm in log space.
//!
//! The recursion runs over the label sequence extended with blanks
//! (`b l1 b l2 ... b`), vectorized across the batch, so gradients flow
//! through ordinary tensor ops.

use candle_core::{DType, Device, Tensor};

use crate::error::{CtcError, Result};

/// Stand-in for `log(0)` that stays finite under addition.
pub const LOG_ZERO: f32 = -1e30;

/// Removes consecutive duplicates.
pub fn collapse_repeated(labels: &[u32]) -> Vec<u32> {
    let mut collapsed = labels.to_vec();
    collapsed.dedup();
    collapsed
}

/// Input steps needed to emit `labels`: one per label, plus a blank between
/// repeats when repeated emissions are merged.
pub fn required_steps(labels: &[u32], merge_repeated: bool) -> usize {
    if !merge_repeated {
        return labels.len();
    }
    labels.len() + labels.windows(2).filter(|pair| pair[0] == pair[1]).count()
}

/// `log(sum(exp(x)))` along `dim`, which is removed.
pub fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let shifted = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok((shifted + max)?.squeeze(dim)?)
}

fn penalty(allowed: impl Iterator<Item = bool>) -> Vec<f32> {
    allowed.map(|ok| if ok { 0.0 } else { LOG_ZERO }).collect()
}

fn shift_states(alpha: &Tensor, by: usize) -> Result<Tensor> {
    let (batch, states) = alpha.dims2()?;
    if by >= states {
        return Ok(Tensor::full(LOG_ZERO, (batch, states), alpha.device())?);
    }
    let pad = Tensor::full(LOG_ZERO, (batch, by), alpha.device())?;
    Ok(Tensor::cat(&[&pad, &alpha.narrow(1, 0, states - by)?], 1)?)
}

/// Per-sequence CTC loss, `[batch]`.
///
/// `log_probs` is time-major `[time, batch, classes]` and already
/// normalized. With `merge_repeated` unset, a label cannot be held over
/// several steps and every emission counts as a separate output, so a
/// repeated label may follow its predecessor without a blank in between.
pub fn ctc_loss(
    log_probs: &Tensor,
    labels: &[Vec<u32>],
    input_lengths: &[usize],
    blank: u32,
    merge_repeated: bool,
) -> Result<Tensor> {
    let (time, batch, classes) = log_probs.dims3()?;
    if labels.len() != batch || input_lengths.len() != batch {
        return Err(CtcError::InvalidConfig(format!(
            "got {} label sequences and {} lengths for a batch of {batch}",
            labels.len(),
            input_lengths.len()
        )));
    }
    for (sequence, (sequence_labels, &length)) in labels.iter().zip(input_lengths).enumerate() {
        if let Some(&label) = sequence_labels
            .iter()
            .find(|&&label| label == blank || label as usize >= classes)
        {
            return Err(CtcError::InvalidLabel {
                sequence,
                label,
                classes,
            });
        }
        let required = required_steps(sequence_labels, merge_repeated).max(1);
        let available = length.min(time);
        if required > available {
            return Err(CtcError::LabelOverflow {
                sequence,
                required,
                available,
            });
        }
    }

    let device = log_probs.device();
    let states = 2 * labels.iter().map(Vec::len).max().unwrap_or(0) + 1;
    let mut extended = vec![blank; batch * states];
    for (b, sequence_labels) in labels.iter().enumerate() {
        for (i, &label) in sequence_labels.iter().enumerate() {
            extended[b * states + 2 * i + 1] = label;
        }
    }

    let cells = || (0..batch).flat_map(move |b| (0..states).map(move |u| (b, u)));
    let stay = penalty(cells().map(|(b, u)| merge_repeated || extended[b * states + u] == blank));
    let skip = penalty(cells().map(|(b, u)| {
        let label = extended[b * states + u];
        u >= 2 && label != blank && (!merge_repeated || label != extended[b * states + u - 2])
    }));
    let start = penalty(cells().map(|(_, u)| u <= 1));
    let finish = penalty(cells().map(|(b, u)| {
        let last = 2 * labels[b].len();
        u == last || (last > 0 && u == last - 1)
    }));

    let as_tensor = |values: Vec<f32>| Tensor::from_vec(values, (batch, states), device);
    let stay = as_tensor(stay)?;
    let skip = as_tensor(skip)?;
    let start = as_tensor(start)?;
    let finish = as_tensor(finish)?;
    let extended = Tensor::from_vec(extended, (batch, states), device)?;
    let emissions = |t: usize| -> Result<Tensor> {
        Ok(log_probs.get(t)?.to_dtype(DType::F32)?.gather(&extended, 1)?)
    };

    let mut alpha = (emissions(0)? + &start)?.maximum(LOG_ZERO)?;
    for t in 1..time {
        let candidates = Tensor::stack(
            &[
                (&alpha + &stay)?,
                shift_states(&alpha, 1)?,
                (shift_states(&alpha, 2)? + &skip)?,
            ],
            0,
        )?;
        let next = (log_sum_exp(&candidates, 0)? + emissions(t)?)?.maximum(LOG_ZERO)?;
        let active = active_rows(input_lengths, t, device)?;
        let inactive = active.affine(-1.0, 1.0)?;
        alpha = (next.broadcast_mul(&active)? + alpha.broadcast_mul(&inactive)?)?;
    }

    Ok(log_sum_exp(&(alpha + finish)?, 1)?.neg()?)
}

fn active_rows(input_lengths: &[usize], t: usize, device: &Device) -> Result<Tensor> {
    let active: Vec<f32> = input_lengths
        .iter()
        .map(|&length| if t < length { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(active, (input_lengths.len(), 1), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::ops::log_softmax;

    fn uniform(time: usize, batch: usize, classes: usize) -> Result<Tensor> {
        let logits = Tensor::zeros((time, batch, classes), DType::F32, &Device::Cpu)?;
        Ok(log_softmax(&logits, 2)?)
    }

    #[test]
    fn single_label_over_two_uniform_steps() -> Result<()> {
        // Paths for label `0` with blank `1` over two steps: 0b, b0, 00.
        let log_probs = uniform(2, 1, 2)?;
        let loss = ctc_loss(&log_probs, &[vec![0]], &[2], 1, true)?.to_vec1::<f32>()?;
        let expected = -(3.0f32 / 4.0).ln();
        assert!((loss[0] - expected).abs() < 1e-5, "{} vs {expected}", loss[0]);
        Ok(())
    }

    #[test]
    fn unmerged_repeats_drop_the_held_label_path() -> Result<()> {
        let log_probs = uniform(2, 1, 2)?;
        let loss = ctc_loss(&log_probs, &[vec![0]], &[2], 1, false)?.to_vec1::<f32>()?;
        let expected = -(2.0f32 / 4.0).ln();
        assert!((loss[0] - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn unmerged_repeats_need_no_separating_blank() -> Result<()> {
        // Only `00` emits the labels `0 0` in two steps without merging.
        let log_probs = uniform(2, 1, 2)?;
        let loss = ctc_loss(&log_probs, &[vec![0, 0]], &[2], 1, false)?.to_vec1::<f32>()?;
        assert!((loss[0] - 4f32.ln()).abs() < 1e-5, "{}", loss[0]);
        assert!(ctc_loss(&log_probs, &[vec![0, 0]], &[2], 1, true).is_err());
        Ok(())
    }

    #[test]
    fn empty_labels_need_all_blanks() -> Result<()> {
        let log_probs = uniform(3, 1, 4)?;
        let loss = ctc_loss(&log_probs, &[vec![]], &[3], 3, true)?.to_vec1::<f32>()?;
        assert!((loss[0] - 3.0 * 4f32.ln()).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn padded_steps_do_not_count() -> Result<()> {
        let log_probs = uniform(4, 2, 3)?;
        let loss = ctc_loss(&log_probs, &[vec![0], vec![0]], &[2, 4], 2, true)?;
        let single = ctc_loss(&log_probs.narrow(0, 0, 2)?, &[vec![0], vec![0]], &[2, 2], 2, true)?;
        let loss = loss.to_vec1::<f32>()?;
        let single = single.to_vec1::<f32>()?;
        assert!((loss[0] - single[0]).abs() < 1e-5);
        assert!(loss[1] > loss[0]);
        Ok(())
    }

    #[test]
    fn too_short_inputs_overflow() {
        let log_probs = uniform(2, 1, 3).unwrap();
        let err = ctc_loss(&log_probs, &[vec![0, 0]], &[2], 2, true).unwrap_err();
        assert!(matches!(
            err,
            CtcError::LabelOverflow {
                required: 3,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn blank_labels_are_rejected() {
        let log_probs = uniform(2, 1, 3).unwrap();
        assert!(matches!(
            ctc_loss(&log_probs, &[vec![2]], &[2], 2, true),
            Err(CtcError::InvalidLabel { label: 2, .. })
        ));
    }

    #[test]
    fn collapse_and_required_steps() {
        assert_eq!(collapse_repeated(&[4, 4, 5, 4, 4]), vec![4, 5, 4]);
        assert_eq!(required_steps(&[4, 4, 5], true), 4);
        assert_eq!(required_steps(&[4, 4, 5], false), 3);
    }
}
