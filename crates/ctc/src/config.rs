use serde::{Deserialize, Serialize};

use crate::error::{CtcError, Result};

/// Configuration of a CTC head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtcConfig {
    /// Parameter scope.
    pub name: String,
    /// Collapses repeated reference labels before computing the loss.
    #[serde(default)]
    pub merge_repeated_targets: bool,
    /// Merges repeated outputs. In the loss it allows a label to be held over
    /// several steps; unset, repeated labels need no blank between them.
    #[serde(default = "default_true")]
    pub merge_repeated_outputs: bool,
    /// `1` selects greedy decoding, anything larger prefix beam search.
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
}

impl CtcConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merge_repeated_targets: false,
            merge_repeated_outputs: true,
            beam_width: default_beam_width(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CtcError::InvalidConfig("name must not be empty".into()));
        }
        if self.beam_width == 0 {
            return Err(CtcError::InvalidConfig("beam_width must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_beam_width() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_uses_greedy_merging_defaults() {
        let config: CtcConfig = serde_json::from_str(r#"{"name": "ctc"}"#).unwrap();
        assert_eq!(config, CtcConfig::new("ctc"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_beam_width_is_rejected() {
        let mut config = CtcConfig::new("ctc");
        config.beam_width = 0;
        assert!(config.validate().is_err());
    }
}
