//! Building blocks shared by the recurrent decoder and its attention objects.
//!
//! The crate hosts affine projections, recurrent cells, and the shape checks
//! that guard them. Everything is assembled from Candle primitives and
//! parameters are always requested through a [`candle_nn::VarBuilder`], so
//! building the same component twice under the same prefix yields tied
//! parameters.

pub mod checks;
pub mod linear;
pub mod rnn;

use thiserror::Error;

pub use linear::{Linear, LinearConfig, LinearInit};
pub use rnn::{CellKind, CellStep, RecurrentCell};

/// Errors raised while configuring layers.
#[derive(Debug, Error)]
pub enum LayerError {
    /// The requested recurrent cell name is not one of the supported kinds.
    #[error("RNN cell must be either 'GRU' or 'LSTM', got '{0}'")]
    UnknownCellType(String),
}
