use thiserror::Error;

pub type Result<T> = std::result::Result<T, CtcError>;

#[derive(Error, Debug)]
pub enum CtcError {
    #[error("encoder '{encoder}' does not provide {tensor}")]
    MissingEncoderTensor {
        encoder: String,
        tensor: &'static str,
    },

    #[error(
        "sequence {sequence} needs at least {required} input steps for its labels but has \
         {available}"
    )]
    LabelOverflow {
        sequence: usize,
        required: usize,
        available: usize,
    },

    #[error("label {label} of sequence {sequence} is outside [0, {classes})")]
    InvalidLabel {
        sequence: usize,
        label: u32,
        classes: usize,
    },

    #[error("invalid CTC configuration: {0}")]
    InvalidConfig(String),

    #[error("when training, you must feed reference sentences")]
    MissingTargets,

    #[error("vocabulary error: {0}")]
    Vocabulary(#[from] vocabulary::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}
