//! Token embedding table.

use candle_core::{DType, Error, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Range of the uniform initialiser used for fresh tables.
pub const EMBEDDING_INIT_BOUND: f64 = 0.5;

/// Configuration for building a token embedding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub embedding_size: usize,
}

/// Learnable token embedding table.
///
/// The table is requested from a [`VarBuilder`] under the name
/// `embedding_matrix`, so two components built against the same prefix read
/// the same parameters. Cloning the value shares the underlying variable as
/// well, which is how a decoder reuses an encoder's embeddings.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
}

impl TokenEmbedding {
    /// Builds (or reuses) a table initialised uniformly in `[-0.5, 0.5]`.
    pub fn new(config: TokenEmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        if config.vocab_size == 0 {
            return Err(Error::Msg("token embedding requires vocab_size > 0".into()));
        }
        if config.embedding_size == 0 {
            return Err(Error::Msg("token embedding requires embedding_size > 0".into()));
        }

        let weight = vb.get_with_hints(
            (config.vocab_size, config.embedding_size),
            "embedding_matrix",
            Init::Uniform {
                lo: -EMBEDDING_INIT_BOUND,
                up: EMBEDDING_INIT_BOUND,
            },
        )?;
        Ok(Self { config, weight })
    }

    /// Returns the embedding configuration.
    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn embedding_size(&self) -> usize {
        self.config.embedding_size
    }

    /// Returns the underlying weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs are shaped `(batch,)` or `(batch, seq)` with an integer dtype and
    /// the output appends an `embedding_size` axis.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.validate_token_ids(token_ids)?;
        let dims = token_ids.dims().to_vec();

        let flat = token_ids.flatten_all()?.to_dtype(DType::U32)?;
        let gathered = self.weight.index_select(&flat, 0)?;
        let mut output_dims = dims;
        output_dims.push(self.config.embedding_size);
        gathered.reshape(output_dims)
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<()> {
        match token_ids.dims() {
            [batch] | [batch, _] if *batch > 0 => {}
            dims => {
                return Err(Error::Msg(format!(
                    "token_ids must be shaped [batch] or [batch, seq] with batch > 0, got {:?}",
                    dims
                )))
            }
        }

        if !token_ids.dtype().is_int() {
            return Err(Error::Msg(format!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            )));
        }
        self.ensure_id_range(token_ids)
    }

    fn ensure_id_range(&self, token_ids: &Tensor) -> Result<()> {
        let flat = token_ids.flatten_all()?.to_dtype(DType::I64)?;
        if flat.elem_count() == 0 {
            return Ok(());
        }

        let min_id = flat.min(0)?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "encountered negative token id {} (minimum)",
                min_id
            )));
        }

        let max_id = flat.max(0)?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            return Err(Error::Msg(format!(
                "token id {} exceeds vocab size {}",
                max_id, vocab
            )));
        }
        Ok(())
    }
}
