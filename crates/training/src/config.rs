use decoder::DecoderConfig;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.decoder.validate() {
            errors.push(format!("decoder: {}", err));
        }

        if self.encoder.name.trim().is_empty() {
            errors.push("encoder.name must not be empty".to_string());
        }
        if self.encoder.name == self.decoder.name {
            errors.push("encoder.name and decoder.name must differ".to_string());
        }
        if self.encoder.embedding_size == 0 {
            errors.push("encoder.embedding_size must be greater than 0".to_string());
        }
        if self.encoder.state_size == 0 {
            errors.push("encoder.state_size must be greater than 0".to_string());
        }
        if let Some(0) = self.encoder.max_input_len {
            errors.push("encoder.max_input_len must be greater than 0".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.min_count == 0 {
            errors.push("data.min_count must be greater than 0".to_string());
        }
        if self.data.validation_source.is_some() != self.data.validation_target.is_some() {
            errors.push(
                "data.validation_source and data.validation_target must be given together"
                    .to_string(),
            );
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if let Some(max_norm) = self.optimizer.max_grad_norm {
            if max_norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.max_steps {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.evaluation.every_n_steps {
            errors.push("runtime.evaluation.every_n_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.evaluation.max_batches {
            errors.push("runtime.evaluation.max_batches must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

/// Bag-of-embeddings source encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_name")]
    pub name: String,
    #[serde(default = "default_embedding_size")]
    pub embedding_size: usize,
    #[serde(default = "default_state_size")]
    pub state_size: usize,
    #[serde(default)]
    pub max_input_len: Option<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            name: default_encoder_name(),
            embedding_size: default_embedding_size(),
            state_size: default_state_size(),
            max_input_len: None,
        }
    }
}

/// Parallel corpus files hold one whitespace-tokenized sentence per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_source: PathBuf,
    pub train_target: PathBuf,
    #[serde(default)]
    pub validation_source: Option<PathBuf>,
    #[serde(default)]
    pub validation_target: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_count")]
    pub min_count: usize,
    #[serde(default)]
    pub max_vocabulary_size: Option<usize>,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Where the source and target vocabularies are written, if anywhere.
    #[serde(default)]
    pub vocabulary_dir: Option<PathBuf>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_source, base);
        absolutize_in_place(&mut self.train_target, base);
        for path in [
            self.validation_source.as_mut(),
            self.validation_target.as_mut(),
            self.vocabulary_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    #[serde(default)]
    pub max_grad_norm: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            epochs: default_epochs(),
            max_steps: None,
            log_every_n_steps: default_log_every_n_steps(),
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.logging.jsonl.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    #[serde(default)]
    pub max_batches: Option<usize>,
    /// Decoded sentences printed with every evaluation.
    #[serde(default = "default_samples")]
    pub samples: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: None,
            max_batches: None,
            samples: default_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    /// Appends one JSON object per training step and evaluation.
    #[serde(default)]
    pub jsonl: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            jsonl: None,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_encoder_name() -> String {
    "encoder".to_string()
}

fn default_embedding_size() -> usize {
    32
}

fn default_state_size() -> usize {
    32
}

fn default_batch_size() -> usize {
    16
}

fn default_min_count() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f32 {
    1e-3
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    10
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_samples() -> usize {
    3
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read input: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<decoder::DecoderError> for TrainingError {
    fn from(value: decoder::DecoderError) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<attention::AttentionError> for TrainingError {
    fn from(value: attention::AttentionError) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<vocabulary::Error> for TrainingError {
    fn from(value: vocabulary::Error) -> Self {
        match value {
            vocabulary::Error::Io(err) => TrainingError::Io(err),
            other => TrainingError::Runtime(other.to_string()),
        }
    }
}
