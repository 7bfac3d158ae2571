use attention::AttentionError;
use layers::LayerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecoderError>;

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error(
        "you must specify either embedding_size or the embedded sequence from which to reuse \
         the embeddings"
    )]
    MissingEmbeddingSize,

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error("hidden size mismatch: {0}")]
    HiddenSizeMismatch(String),

    #[error("invalid decoder configuration: {0}")]
    InvalidConfig(String),

    #[error("when training, you must feed reference sentences")]
    MissingTargets,

    #[error("attention error: {0}")]
    Attention(#[from] AttentionError),

    #[error("vocabulary error: {0}")]
    Vocabulary(#[from] vocabulary::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}
