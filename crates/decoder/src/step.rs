//! The recurrent step function.
//!
//! Parameters live under `<decoder>/attention_decoder` (cells and
//! projections) and `<decoder>/output_projection`; they are requested once at
//! construction, so every step of every unroll reuses the same variables.

use attention::{Attention, AttentionQuery};
use candle_core::{DType, Tensor, D};
use candle_nn::{Dropout, VarBuilder};
use embedding::TokenEmbedding;
use layers::{CellKind, CellStep, Linear, LinearConfig, LinearInit, RecurrentCell};
use vocabulary::END_TOKEN_INDEX;

use crate::error::{DecoderError, Result};
use crate::state::LoopState;

/// Range of the uniform initialiser of the output layer weights.
pub const OUTPUT_INIT_BOUND: f64 = 0.5;

/// Sizes fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDims {
    pub embedding_size: usize,
    pub rnn_size: usize,
    pub vocabulary_size: usize,
    /// Context width of each attention object, in order.
    pub context_sizes: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct StepFunction {
    dims: StepDims,
    embedding: TokenEmbedding,
    input_projection: Option<Linear>,
    cell: RecurrentCell,
    conditional_cell: Option<RecurrentCell>,
    attn_output_projection: Option<Linear>,
    output_projection: Linear,
    dropout: Dropout,
    dropout_p: f32,
}

impl StepFunction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dims: StepDims,
        cell_kind: CellKind,
        attention_on_input: bool,
        conditional_gru: bool,
        embedding: TokenEmbedding,
        dropout_p: f32,
        vb: &VarBuilder,
    ) -> Result<Self> {
        if embedding.embedding_size() != dims.embedding_size {
            return Err(DecoderError::InvalidConfig(format!(
                "embedding table has width {} but the step expects {}",
                embedding.embedding_size(),
                dims.embedding_size
            )));
        }
        if conditional_gru && dims.context_sizes.is_empty() {
            return Err(DecoderError::InvalidConfig(
                "conditional GRU needs at least one attention object".into(),
            ));
        }
        let scope = vb.pp("attention_decoder");
        let context_total: usize = dims.context_sizes.iter().sum();

        let input_projection = if attention_on_input {
            Some(Linear::build(
                LinearConfig::new(dims.embedding_size + context_total, dims.embedding_size),
                &LinearInit::XavierUniform,
                scope.pp("input_projection"),
            )?)
        } else {
            None
        };

        let cell = RecurrentCell::new(
            cell_kind,
            dims.embedding_size,
            dims.rnn_size,
            scope.pp("rnn_cell"),
        )?;

        let conditional_cell = if conditional_gru {
            Some(RecurrentCell::new(
                CellKind::Gru,
                context_total,
                dims.rnn_size,
                scope.pp("cond_gru_2_cell"),
            )?)
        } else {
            None
        };

        let attn_output_projection = if dims.context_sizes.is_empty() {
            None
        } else {
            Some(Linear::build(
                LinearConfig::new(dims.rnn_size + context_total, dims.rnn_size),
                &LinearInit::XavierUniform,
                scope.pp("attn_output_projection"),
            )?)
        };

        let output_projection = Linear::build_with_bias(
            LinearConfig::new(dims.rnn_size, dims.vocabulary_size),
            &LinearInit::Uniform {
                bound: OUTPUT_INIT_BOUND,
            },
            -(dims.vocabulary_size as f64).ln(),
            vb.pp("output_projection"),
        )?;

        Ok(Self {
            dims,
            embedding,
            input_projection,
            cell,
            conditional_cell,
            attn_output_projection,
            output_projection,
            dropout: Dropout::new(dropout_p),
            dropout_p,
        })
    }

    pub fn dims(&self) -> &StepDims {
        &self.dims
    }

    pub fn embedding(&self) -> &TokenEmbedding {
        &self.embedding
    }

    pub fn output_projection(&self) -> &Linear {
        &self.output_projection
    }

    pub(crate) fn dropout(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout_p > 0.0 {
            Ok(self.dropout.forward(xs, train)?)
        } else {
            Ok(xs.clone())
        }
    }

    /// Embeds the input ids, optionally merged with the previous contexts.
    pub fn rnn_input(&self, symbols: &Tensor, prev_contexts: &[Tensor], train: bool) -> Result<Tensor> {
        let embedded = self.dropout(&self.embedding.forward(symbols)?, train)?;
        match &self.input_projection {
            Some(projection) => {
                let mut inputs = Vec::with_capacity(prev_contexts.len() + 1);
                inputs.push(&embedded);
                inputs.extend(prev_contexts);
                Ok(projection.forward_concat(&inputs)?)
            }
            None => Ok(embedded),
        }
    }

    /// Vocabulary logits for a cell output (after the attention projection).
    pub fn logits(&self, output: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.output_projection.forward(&self.dropout(output, train)?)?)
    }

    /// Advances the unroll by one step.
    ///
    /// `attentions` must be the objects whose loop states `state` carries.
    pub fn step(
        &self,
        attentions: &[Box<dyn Attention>],
        state: LoopState,
        train: bool,
    ) -> Result<LoopState> {
        let LoopState {
            step,
            input_symbol,
            train_inputs,
            prev_rnn_state,
            prev_rnn_output,
            mut rnn_outputs,
            prev_logits: _,
            logits: mut logit_history,
            prev_contexts,
            mut mask,
            mut finished,
            attention_loop_states,
        } = state;

        if attention_loop_states.len() != attentions.len() {
            return Err(DecoderError::InvalidConfig(format!(
                "loop state carries {} attention states for {} attention objects",
                attention_loop_states.len(),
                attentions.len()
            )));
        }

        let rnn_input = self.rnn_input(&input_symbol, &prev_contexts, train)?;
        let cell = self.cell.step(&rnn_input, &prev_rnn_state, &prev_rnn_output)?;

        let mut contexts = Vec::with_capacity(attentions.len());
        let mut next_attention_states = Vec::with_capacity(attentions.len());
        {
            let query = AttentionQuery {
                decoder_state: &cell.output,
                prev_decoder_state: &prev_rnn_output,
                decoder_input: &rnn_input,
            };
            for (attention, loop_state) in attentions.iter().zip(attention_loop_states) {
                let (context, loop_state) = attention.attend(&query, loop_state, step)?;
                contexts.push(context);
                next_attention_states.push(loop_state);
            }
        }

        let CellStep {
            output: cell_output,
            state: next_state,
        } = match &self.conditional_cell {
            Some(conditional) => {
                let cond_input = Tensor::cat(&contexts, D::Minus1)?;
                conditional.step(&cond_input, &cell.state, &cell.state)?
            }
            None => cell,
        };

        let output = match &self.attn_output_projection {
            Some(projection) => {
                let mut inputs = Vec::with_capacity(contexts.len() + 1);
                inputs.push(&cell_output);
                inputs.extend(&contexts);
                projection.forward_concat(&inputs)?
            }
            None => cell_output.clone(),
        };
        let logits = self.logits(&output, train)?;

        let next_symbols = match &train_inputs {
            Some(inputs) => inputs.get(step)?.to_dtype(DType::U32)?,
            None => logits.argmax(D::Minus1)?,
        };
        for (done, id) in finished.iter_mut().zip(next_symbols.to_vec1::<u32>()?) {
            *done |= id == END_TOKEN_INDEX;
        }
        let valid: Vec<f32> = finished
            .iter()
            .map(|&done| if done { 0.0 } else { 1.0 })
            .collect();
        mask.push(Tensor::from_vec(valid, finished.len(), logits.device())?);

        rnn_outputs.push(cell_output.clone());
        logit_history.push(logits.clone());

        Ok(LoopState {
            step: step + 1,
            input_symbol: next_symbols,
            train_inputs,
            prev_rnn_state: next_state,
            prev_rnn_output: cell_output,
            rnn_outputs,
            prev_logits: logits,
            logits: logit_history,
            prev_contexts: contexts,
            mask,
            finished,
            attention_loop_states: next_attention_states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use embedding::TokenEmbeddingConfig;

    fn step_function(varmap: &VarMap, conditional: bool) -> Result<StepFunction> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let embedding = TokenEmbedding::new(
            TokenEmbeddingConfig {
                vocab_size: 7,
                embedding_size: 4,
            },
            vb.pp("word_embeddings"),
        )?;
        StepFunction::new(
            StepDims {
                embedding_size: 4,
                rnn_size: 5,
                vocabulary_size: 7,
                context_sizes: Vec::new(),
            },
            CellKind::Gru,
            true,
            conditional,
            embedding,
            0.0,
            &vb,
        )
    }

    #[test]
    fn output_bias_starts_at_negative_log_vocabulary() -> Result<()> {
        let varmap = VarMap::new();
        let step = step_function(&varmap, false)?;
        let bias = step
            .output_projection()
            .bias()
            .map(|b| b.to_vec1::<f32>())
            .transpose()?
            .unwrap_or_default();
        assert_eq!(bias.len(), 7);
        let expected = -(7f32).ln();
        assert!(bias.iter().all(|b| (b - expected).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn step_appends_one_entry_to_every_history() -> Result<()> {
        let varmap = VarMap::new();
        let step = step_function(&varmap, false)?;
        let device = Device::Cpu;
        let state = LoopState::initial(
            Tensor::new(&[1u32, 1, 1], &device)?,
            Some(Tensor::new(&[[4u32, 2, 5]], &device)?),
            Tensor::zeros((3, 5), DType::F32, &device)?,
            7,
            &[],
            Vec::new(),
            &device,
        )?;
        let next = step.step(&[], state, false)?;
        assert_eq!(next.step, 1);
        assert_eq!(next.rnn_outputs.len(), 2);
        assert_eq!(next.logits.len(), 1);
        assert_eq!(next.logits[0].dims(), &[3, 7]);
        assert_eq!(next.input_symbol.to_vec1::<u32>()?, vec![4, 2, 5]);
        assert_eq!(next.finished, vec![false, true, false]);
        assert_eq!(next.mask[0].to_vec1::<f32>()?, vec![1.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn conditional_gru_requires_contexts() {
        let varmap = VarMap::new();
        assert!(matches!(
            step_function(&varmap, true),
            Err(DecoderError::InvalidConfig(_))
        ));
    }
}
