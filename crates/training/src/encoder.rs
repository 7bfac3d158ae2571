//! Minimal source encoder used to drive the decoder during training.
//!
//! Every source position is embedded and passed through a `tanh` projection
//! to `state_size`; the pooled `encoded` vector is the mean over valid
//! positions. The result is an attentive [`EncodedSequence`].

use std::sync::Arc;

use attention::EncodedSequence;
use candle_core::Device;
use candle_nn::VarBuilder;
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{Linear, LinearConfig, LinearInit};
use vocabulary::{BatchingOptions, Vocabulary};

use crate::{config::EncoderConfig, TrainingError};

pub struct BagOfEmbeddingsEncoder {
    config: EncoderConfig,
    vocabulary: Arc<Vocabulary>,
    embedding: TokenEmbedding,
    projection: Linear,
}

impl std::fmt::Debug for BagOfEmbeddingsEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BagOfEmbeddingsEncoder")
            .field("name", &self.config.name)
            .field("vocabulary", &self.vocabulary.len())
            .field("state_size", &self.config.state_size)
            .finish()
    }
}

impl BagOfEmbeddingsEncoder {
    /// Parameters live under `vb.pp(config.name)`.
    pub fn new(
        config: EncoderConfig,
        vocabulary: Arc<Vocabulary>,
        vb: VarBuilder,
    ) -> Result<Self, TrainingError> {
        let vb = vb.pp(config.name.as_str());
        let embedding = TokenEmbedding::new(
            TokenEmbeddingConfig {
                vocab_size: vocabulary.len(),
                embedding_size: config.embedding_size,
            },
            vb.pp("word_embeddings"),
        )?;
        let projection = Linear::build(
            LinearConfig::new(config.embedding_size, config.state_size),
            &LinearInit::XavierUniform,
            vb.pp("projection"),
        )?;
        Ok(Self {
            config,
            vocabulary,
            embedding,
            projection,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Encodes a batch of tokenized sentences, each followed by an end symbol.
    pub fn encode<S: AsRef<str>>(
        &self,
        sentences: &[Vec<S>],
        device: &Device,
    ) -> Result<EncodedSequence, TrainingError> {
        let options = BatchingOptions {
            max_len: self.config.max_input_len,
            pad_to_max_len: false,
            add_start_symbol: false,
            add_end_symbol: true,
        };
        let batch = self
            .vocabulary
            .sentences_to_tensor(sentences, &options, device)?;
        let ids = batch.ids.t()?.contiguous()?;
        let mask = batch.mask.t()?.contiguous()?;

        let embedded = self.embedding.forward(&ids)?;
        let states = self
            .projection
            .forward(&embedded)?
            .tanh()?
            .broadcast_mul(&mask.unsqueeze(2)?)?;
        let lengths = mask.sum_keepdim(1)?.maximum(1.0)?;
        let encoded = states.sum(1)?.broadcast_div(&lengths)?;

        Ok(EncodedSequence::new(
            self.config.name.clone(),
            states,
            mask,
            encoded,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attention::Encoder;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn padded_positions_are_zero_and_pooling_ignores_them() -> anyhow::Result<()> {
        let vocabulary = Arc::new(Vocabulary::from_sentences(&[vec!["a", "b", "c"]], 1, None));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = BagOfEmbeddingsEncoder::new(EncoderConfig::default(), vocabulary, vb)?;

        let encoded = encoder.encode(&[vec!["a", "b", "c"], vec!["a"]], &Device::Cpu)?;
        let states = encoded
            .hidden_states()
            .ok_or_else(|| anyhow::anyhow!("missing hidden states"))?;
        assert_eq!(states.dims(), &[2, 4, 32]);
        assert_eq!(encoded.input_mask().map(|m| m.dims().to_vec()), Some(vec![2, 4]));

        let padded = states.get(1)?.narrow(0, 2, 2)?.abs()?.sum_all()?;
        assert_eq!(padded.to_scalar::<f32>()?, 0.0);

        let alone = encoder.encode(&[vec!["a"]], &Device::Cpu)?;
        let pooled = alone.encoded().to_vec2::<f32>()?;
        let batched = encoded.encoded().get(1)?.to_vec1::<f32>()?;
        for (x, y) in pooled[0].iter().zip(batched) {
            assert!((x - y).abs() < 1e-5);
        }
        Ok(())
    }
}
