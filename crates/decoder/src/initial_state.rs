//! Initial state strategies.
//!
//! The strategy is picked once when the decoder is built. Without encoders
//! the state is zero; without an explicit `rnn_size` the pooled encoder
//! outputs are concatenated (and define the hidden size); otherwise they are
//! linearly projected to `rnn_size`.

use std::sync::Arc;

use attention::Encoder;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, VarBuilder};
use layers::{checks, Linear, LinearConfig, LinearInit};

use crate::config::{DecoderConfig, InitialStateKind};
use crate::error::{DecoderError, Result};

#[derive(Debug, Clone)]
pub enum InitialState {
    Empty { size: usize },
    Concat { size: usize },
    Linear { projection: Linear },
}

fn encoded_size(encoders: &[Arc<dyn Encoder>]) -> Result<usize> {
    encoders
        .iter()
        .map(|encoder| match encoder.encoded().dims() {
            [_, size] => Ok(*size),
            dims => Err(DecoderError::InvalidConfig(format!(
                "encoder '{}' has pooled output of shape {:?}, expected [batch, size]",
                encoder.name(),
                dims
            ))),
        })
        .sum()
}

fn concat_encoded(encoders: &[Arc<dyn Encoder>]) -> Result<Tensor> {
    let pooled: Vec<&Tensor> = encoders.iter().map(|e| e.encoded()).collect();
    Ok(Tensor::cat(&pooled, 1)?)
}

impl InitialState {
    /// Chooses the strategy and returns it with the resulting hidden size.
    pub fn resolve(
        config: &DecoderConfig,
        encoders: &[Arc<dyn Encoder>],
        vb: &VarBuilder,
    ) -> Result<(Self, usize)> {
        let kind = match config.initial_state {
            Some(kind) => kind,
            None if encoders.is_empty() => {
                log::info!("No encoder - language model only.");
                InitialStateKind::Empty
            }
            None if config.rnn_size.is_none() => {
                log::info!("No rnn_size or initial state strategy: using concatenation of encoded states");
                InitialStateKind::Concat
            }
            None => {
                log::info!("Using linear projection of encoders as the initial state");
                InitialStateKind::Linear
            }
        };

        if kind != InitialStateKind::Empty && encoders.is_empty() {
            return Err(DecoderError::InvalidConfig(format!(
                "initial state '{}' needs at least one encoder",
                kind.as_str()
            )));
        }

        match kind {
            InitialStateKind::Empty => {
                let size = config.rnn_size.ok_or_else(|| {
                    DecoderError::InvalidConfig("an empty initial state requires rnn_size".into())
                })?;
                Ok((InitialState::Empty { size }, size))
            }
            InitialStateKind::Concat => {
                let size = encoded_size(encoders)?;
                match config.rnn_size {
                    Some(rnn_size) if rnn_size != size => {
                        Err(DecoderError::HiddenSizeMismatch(format!(
                            "rnn_size is {rnn_size} but the concatenated encoder states have size {size}"
                        )))
                    }
                    _ => Ok((InitialState::Concat { size }, size)),
                }
            }
            InitialStateKind::Linear => {
                let rnn_size = config.rnn_size.ok_or_else(|| {
                    DecoderError::InvalidConfig(
                        "a linear initial state projection requires rnn_size".into(),
                    )
                })?;
                let projection = Linear::build(
                    LinearConfig::new(encoded_size(encoders)?, rnn_size),
                    &LinearInit::XavierUniform,
                    vb.pp("initial_state").pp("encoders_projection"),
                )?;
                Ok((InitialState::Linear { projection }, rnn_size))
            }
        }
    }

    pub fn kind(&self) -> InitialStateKind {
        match self {
            InitialState::Empty { .. } => InitialStateKind::Empty,
            InitialState::Concat { .. } => InitialStateKind::Concat,
            InitialState::Linear { .. } => InitialStateKind::Linear,
        }
    }

    /// Computes the `(batch, rnn_size)` initial state, applying dropout when `train` is set.
    pub fn compute(
        &self,
        encoders: &[Arc<dyn Encoder>],
        batch_size: usize,
        dropout: &Dropout,
        train: bool,
        device: &Device,
    ) -> Result<Tensor> {
        let state = match self {
            InitialState::Empty { size } => Tensor::zeros((batch_size, *size), DType::F32, device)?,
            InitialState::Concat { .. } => concat_encoded(encoders)?,
            InitialState::Linear { projection } => {
                let encoded = dropout.forward(&concat_encoded(encoders)?, train)?;
                projection.forward(&encoded)?
            }
        };
        if state.dims()[0] != batch_size {
            return Err(DecoderError::InvalidConfig(format!(
                "encoders carry a batch of {} but the decoder was fed {} go symbols",
                state.dims()[0],
                batch_size
            )));
        }
        checks::expect_rank("initial_state", &state, 2)?;
        Ok(dropout.forward(&state, train)?)
    }
}
