//! Single-step recurrent cells.
//!
//! The decoder unrolls its cell one step at a time, so the cells here expose a
//! `step` entry point only. Both kinds share the same calling convention: the
//! caller threads a `(state, output)` pair between steps. For a GRU the two are
//! the same tensor; for an LSTM `state` is the cell memory and `output` is the
//! hidden output.

use std::fmt;
use std::str::FromStr;

use candle_core::{Result, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN};
use candle_nn::VarBuilder;

use crate::LayerError;

/// Supported recurrent cell kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Gru,
    Lstm,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Gru => "GRU",
            CellKind::Lstm => "LSTM",
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellKind {
    type Err = LayerError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "GRU" => Ok(CellKind::Gru),
            "LSTM" => Ok(CellKind::Lstm),
            _ => Err(LayerError::UnknownCellType(value.to_string())),
        }
    }
}

/// Result of a single recurrent step.
#[derive(Debug, Clone)]
pub struct CellStep {
    /// Hidden output, shaped `(batch, hidden)`.
    pub output: Tensor,
    /// Carried state, shaped `(batch, hidden)`. Equal to `output` for GRU cells.
    pub state: Tensor,
}

#[derive(Debug, Clone)]
enum CellImpl {
    Gru(GRU),
    Lstm(LSTM),
}

/// A GRU or LSTM cell stepped manually by the decoder.
#[derive(Debug, Clone)]
pub struct RecurrentCell {
    kind: CellKind,
    input_dim: usize,
    hidden_dim: usize,
    inner: CellImpl,
}

impl RecurrentCell {
    /// Creates (or reuses) the cell parameters under `vb`.
    pub fn new(kind: CellKind, input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let inner = match kind {
            CellKind::Gru => CellImpl::Gru(gru(input_dim, hidden_dim, GRUConfig::default(), vb)?),
            CellKind::Lstm => {
                CellImpl::Lstm(lstm(input_dim, hidden_dim, LSTMConfig::default(), vb)?)
            }
        };
        Ok(Self {
            kind,
            input_dim,
            hidden_dim,
            inner,
        })
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Advances the cell by one step.
    ///
    /// `prev_state` is ignored by GRU cells, which carry their state in
    /// `prev_output`.
    pub fn step(&self, input: &Tensor, prev_state: &Tensor, prev_output: &Tensor) -> Result<CellStep> {
        match &self.inner {
            CellImpl::Gru(cell) => {
                let next = cell.step(input, &GRUState { h: prev_output.clone() })?;
                Ok(CellStep {
                    output: next.h.clone(),
                    state: next.h,
                })
            }
            CellImpl::Lstm(cell) => {
                let next = cell.step(
                    input,
                    &LSTMState {
                        h: prev_output.clone(),
                        c: prev_state.clone(),
                    },
                )?;
                Ok(CellStep {
                    output: next.h,
                    state: next.c,
                })
            }
        }
    }
}
