use layers::CellKind;
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

/// How the initial decoder state is derived from the encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialStateKind {
    /// Zero state; the only option without encoders.
    Empty,
    /// Concatenation of the encoders' pooled outputs.
    Concat,
    /// Linear projection of the concatenated pooled outputs to `rnn_size`.
    Linear,
}

impl InitialStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitialStateKind::Empty => "empty",
            InitialStateKind::Concat => "concat",
            InitialStateKind::Linear => "linear",
        }
    }
}

/// How the training loss is reduced over the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAveraging {
    /// Mean of the per-sequence, length-normalized cross-entropies.
    #[default]
    PerExample,
    /// Sum of all token cross-entropies over the number of valid tokens.
    BatchMean,
}

/// Configuration of a recurrent decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Parameter scope; also prefixes the attention history keys.
    pub name: String,
    pub max_output_len: usize,
    /// Probability of dropping a value during training.
    #[serde(default)]
    pub dropout_p: f32,
    /// Hidden size; derived from the encoders when missing.
    #[serde(default)]
    pub rnn_size: Option<usize>,
    /// Embedding size; overridden by a shared embeddings source.
    #[serde(default)]
    pub embedding_size: Option<usize>,
    #[serde(default = "default_rnn_cell")]
    pub rnn_cell: String,
    /// Explicit initial state strategy; chosen from the encoders when missing.
    #[serde(default)]
    pub initial_state: Option<InitialStateKind>,
    #[serde(default)]
    pub use_attention: bool,
    /// Re-projects the embedded input together with the previous contexts.
    #[serde(default = "default_true")]
    pub attention_on_input: bool,
    /// Adds a second GRU consuming the attention contexts (GRU cells only).
    #[serde(default)]
    pub conditional_gru: bool,
    #[serde(default)]
    pub output_averaging: OutputAveraging,
}

impl DecoderConfig {
    pub fn new(name: impl Into<String>, max_output_len: usize) -> Self {
        Self {
            name: name.into(),
            max_output_len,
            dropout_p: 0.0,
            rnn_size: None,
            embedding_size: None,
            rnn_cell: default_rnn_cell(),
            initial_state: None,
            use_attention: false,
            attention_on_input: true,
            conditional_gru: false,
            output_averaging: OutputAveraging::default(),
        }
    }

    /// Parses the configured cell name.
    pub fn cell_kind(&self) -> Result<CellKind> {
        Ok(self.rnn_cell.parse::<CellKind>()?)
    }

    /// Validate structural invariants; all problems are reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.max_output_len == 0 {
            errors.push("max_output_len must be greater than zero".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            errors.push("dropout_p must be in [0, 1)".to_string());
        }
        if self.rnn_size == Some(0) {
            errors.push("rnn_size must be greater than zero".to_string());
        }
        if self.embedding_size == Some(0) {
            errors.push("embedding_size must be greater than zero".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::InvalidConfig(errors.join("; ")))
        }
    }
}

fn default_rnn_cell() -> String {
    "GRU".to_string()
}

fn default_true() -> bool {
    true
}
