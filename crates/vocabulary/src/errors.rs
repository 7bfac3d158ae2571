use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid vocabulary file: {0}")]
    InvalidFile(String),
}
