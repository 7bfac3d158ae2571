//! Configuration for multi-source attention combination.
//!
//! [`CombinationConfig`] is deserialized from the encoder wrapper section of a
//! training configuration and decides which strategy an
//! [`EncoderWrapper`](crate::wrapper::EncoderWrapper) builds.

use serde::{Deserialize, Serialize};

/// How the contexts of several encoders are merged into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationStrategy {
    /// One joint distribution over every position of every encoder.
    Flat,
    /// Per-encoder attention followed by attention over the resulting contexts.
    Hierarchical,
}

/// Configuration driving an attention combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationConfig {
    pub strategy: CombinationStrategy,
    /// Size of the shared space encoder states and the decoder state are projected to.
    pub state_size: usize,
    /// Adds the sentinel as one extra attention candidate.
    #[serde(default)]
    pub use_sentinels: bool,
    /// Reuses the logit projections when building the context vector.
    #[serde(default)]
    pub share_projections: bool,
}

impl CombinationConfig {
    pub fn new(strategy: CombinationStrategy, state_size: usize) -> Self {
        Self {
            strategy,
            state_size,
            use_sentinels: false,
            share_projections: false,
        }
    }

    pub fn with_sentinels(mut self, enabled: bool) -> Self {
        self.use_sentinels = enabled;
        self
    }

    pub fn with_shared_projections(mut self, enabled: bool) -> Self {
        self.share_projections = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: CombinationConfig =
            serde_json::from_str(r#"{"strategy": "hierarchical", "state_size": 16}"#).unwrap();
        assert_eq!(config.strategy, CombinationStrategy::Hierarchical);
        assert_eq!(config.state_size, 16);
        assert!(!config.use_sentinels);
        assert!(!config.share_projections);
    }
}
