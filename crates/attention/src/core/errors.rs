//! Error types emitted by attention objects and encoder collaborators.

/// Attention-specific error category.
#[derive(Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// A beam-expanded query batch is not an integral multiple of the encoder batch.
    BeamTiling { query_batch: usize, encoder_batch: usize },
    /// The encoder does not expose the tensor an attention object needs.
    MissingEncoderTensor { encoder: String, tensor: &'static str },
    /// The encoder cannot produce an attention object.
    NotAttentive { encoder: String },
    /// The loop state handed to an attention object has the wrong variant or length.
    LoopState { context: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape for {context}")
            }
            AttentionError::BeamTiling {
                query_batch,
                encoder_batch,
            } => write!(
                f,
                "decoder batch {query_batch} is not a multiple of encoder batch {encoder_batch}"
            ),
            AttentionError::MissingEncoderTensor { encoder, tensor } => {
                write!(f, "encoder '{encoder}' does not contain the {tensor}")
            }
            AttentionError::NotAttentive { encoder } => {
                write!(f, "encoder '{encoder}' cannot create an attention object")
            }
            AttentionError::LoopState { context } => {
                write!(f, "invalid attention loop state: {context}")
            }
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}
