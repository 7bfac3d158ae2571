//! Conversion of token sequences into time-major id tensors.

use candle_core::{Device, Tensor};

use crate::errors::{Error, Result};
use crate::vocab::{Vocabulary, END_TOKEN_INDEX, PAD_TOKEN_INDEX, START_TOKEN_INDEX};

/// Options controlling [`Vocabulary::sentences_to_tensor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingOptions {
    /// Upper bound on the time axis, special symbols included.
    pub max_len: Option<usize>,
    /// Pads the time axis to `max_len` instead of the longest sequence.
    pub pad_to_max_len: bool,
    pub add_start_symbol: bool,
    pub add_end_symbol: bool,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            max_len: None,
            pad_to_max_len: false,
            add_start_symbol: false,
            add_end_symbol: true,
        }
    }
}

/// Time-major ids `[time, batch]` (`u32`) with a parallel `f32` validity mask.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    pub ids: Tensor,
    pub mask: Tensor,
    /// Number of valid positions per sequence.
    pub lengths: Vec<usize>,
}

impl SequenceBatch {
    pub fn time_steps(&self) -> usize {
        self.ids.dims()[0]
    }

    pub fn batch_size(&self) -> usize {
        self.ids.dims()[1]
    }
}

impl Vocabulary {
    /// Batches `sentences` into a [`SequenceBatch`].
    ///
    /// Each column holds the optional start symbol, the word ids and the
    /// optional end symbol, followed by padding. Sequences longer than the
    /// time axis are cut, in which case the end symbol is dropped. The mask is
    /// `1.0` up to and including the end symbol.
    pub fn sentences_to_tensor<S: AsRef<str>>(
        &self,
        sentences: &[Vec<S>],
        options: &BatchingOptions,
        device: &Device,
    ) -> Result<SequenceBatch> {
        if sentences.is_empty() {
            return Err(Error::InvalidBatch("cannot batch an empty list of sentences".into()));
        }
        if options.pad_to_max_len && options.max_len.is_none() {
            return Err(Error::InvalidBatch("pad_to_max_len requires max_len".into()));
        }
        if options.max_len == Some(0) {
            return Err(Error::InvalidBatch("max_len must be positive".into()));
        }

        let extra = usize::from(options.add_start_symbol) + usize::from(options.add_end_symbol);
        let longest = sentences.iter().map(Vec::len).max().unwrap_or(0) + extra;
        let time = match (options.max_len, options.pad_to_max_len) {
            (Some(limit), true) => limit,
            (Some(limit), false) => longest.min(limit),
            (None, _) => longest,
        }
        .max(1);
        let batch = sentences.len();

        let mut ids = vec![PAD_TOKEN_INDEX; time * batch];
        let mut mask = vec![0f32; time * batch];
        let mut lengths = Vec::with_capacity(batch);
        for (b, sentence) in sentences.iter().enumerate() {
            let mut column = Vec::with_capacity(sentence.len() + extra);
            if options.add_start_symbol {
                column.push(START_TOKEN_INDEX);
            }
            column.extend(sentence.iter().map(|word| self.get_word_index(word.as_ref())));
            if options.add_end_symbol {
                column.push(END_TOKEN_INDEX);
            }
            column.truncate(time);

            for (t, id) in column.iter().enumerate() {
                ids[t * batch + b] = *id;
                mask[t * batch + b] = 1.0;
            }
            lengths.push(column.len());
        }

        Ok(SequenceBatch {
            ids: Tensor::from_vec(ids, (time, batch), device)?,
            mask: Tensor::from_vec(mask, (time, batch), device)?,
            lengths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocabulary() -> Vocabulary {
        Vocabulary::from_sentences(&[vec!["a", "b", "c"]], 1, None)
    }

    #[test]
    fn batches_time_major_with_end_symbol() -> Result<()> {
        let vocabulary = vocabulary();
        let batch = vocabulary.sentences_to_tensor(
            &[vec!["a", "b"], vec!["c"]],
            &BatchingOptions::default(),
            &Device::Cpu,
        )?;
        assert_eq!(batch.ids.dims(), &[3, 2]);
        let a = vocabulary.get_word_index("a");
        let b = vocabulary.get_word_index("b");
        let c = vocabulary.get_word_index("c");
        assert_eq!(
            batch.ids.to_vec2::<u32>()?,
            vec![vec![a, c], vec![b, END_TOKEN_INDEX], vec![END_TOKEN_INDEX, PAD_TOKEN_INDEX]]
        );
        assert_eq!(
            batch.mask.to_vec2::<f32>()?,
            vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![1.0, 0.0]]
        );
        assert_eq!(batch.lengths, vec![3, 2]);
        Ok(())
    }

    #[test]
    fn truncation_drops_end_symbol() -> Result<()> {
        let vocabulary = vocabulary();
        let options = BatchingOptions {
            max_len: Some(2),
            add_start_symbol: true,
            ..BatchingOptions::default()
        };
        let batch = vocabulary.sentences_to_tensor(&[vec!["a", "b", "c"]], &options, &Device::Cpu)?;
        assert_eq!(
            batch.ids.to_vec2::<u32>()?,
            vec![vec![START_TOKEN_INDEX], vec![vocabulary.get_word_index("a")]]
        );
        Ok(())
    }

    #[test]
    fn pads_to_max_len_when_requested() -> Result<()> {
        let vocabulary = vocabulary();
        let options = BatchingOptions {
            max_len: Some(6),
            pad_to_max_len: true,
            ..BatchingOptions::default()
        };
        let batch = vocabulary.sentences_to_tensor(&[vec!["a"]], &options, &Device::Cpu)?;
        assert_eq!(batch.time_steps(), 6);
        assert_eq!(batch.lengths, vec![2]);
        Ok(())
    }
}
