use attention::AttentionHistories;
use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::error::{DecoderError, Result};
use crate::state::DecodingMode;

/// Dense results of one unroll.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub mode: DecodingMode,
    /// `[steps, batch, vocabulary]`.
    pub logits: Tensor,
    /// Initial state followed by every cell output, `[steps + 1, batch, rnn_size]`.
    pub rnn_outputs: Tensor,
    /// `[steps, batch]` `f32`; `1.0` while the sequence has not finished.
    pub mask: Tensor,
    /// Finished flags after the last step.
    pub finished: Vec<bool>,
    pub steps: usize,
    /// Attention weights keyed by `(attention name, "<decoder>_<mode>")`.
    pub attention_histories: AttentionHistories,
}

impl DecoderOutput {
    pub fn logprobs(&self) -> Result<Tensor> {
        Ok(ops::log_softmax(&self.logits, D::Minus1)?)
    }

    /// Argmax ids `[steps, batch]` with the padding id excluded.
    pub fn decoded(&self) -> Result<Tensor> {
        decode_without_padding(&self.logits)
    }
}

/// Argmax over every vocabulary entry except id 0.
pub fn decode_without_padding(logits: &Tensor) -> Result<Tensor> {
    let vocabulary = logits.dim(D::Minus1)?;
    if vocabulary < 2 {
        return Err(DecoderError::InvalidConfig(format!(
            "cannot decode with a vocabulary of {vocabulary} entries"
        )));
    }
    let best = logits.narrow(D::Minus1, 1, vocabulary - 1)?.argmax(D::Minus1)?;
    let offset = Tensor::ones(best.shape(), DType::U32, best.device())?;
    Ok((best + offset)?)
}

/// Results of feeding one batch through both unrolls.
#[derive(Debug, Clone)]
pub struct DecoderOutputs {
    /// Teacher-forced unroll, when references were fed.
    pub train: Option<DecoderOutput>,
    /// Per-example training cross-entropies, `[batch]`.
    pub train_xents: Option<Tensor>,
    pub train_loss: Option<Tensor>,
    pub runtime: DecoderOutput,
    /// Cross-entropy of the free-running logits against the references.
    pub runtime_loss: Option<Tensor>,
}
