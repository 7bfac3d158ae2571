use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub const PAD_TOKEN: &str = "<pad>";
pub const START_TOKEN: &str = "<s>";
pub const END_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

pub const PAD_TOKEN_INDEX: u32 = 0;
pub const START_TOKEN_INDEX: u32 = 1;
pub const END_TOKEN_INDEX: u32 = 2;
pub const UNK_TOKEN_INDEX: u32 = 3;

const SPECIAL_TOKENS: [&str; 4] = [PAD_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN];

#[derive(Serialize, Deserialize)]
struct VocabularyFile {
    words: Vec<String>,
}

/// Bidirectional word <-> id mapping with reserved special tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    /// Vocabulary holding only the special tokens.
    pub fn new() -> Self {
        let mut vocabulary = Self {
            words: Vec::new(),
            index: HashMap::new(),
        };
        for token in SPECIAL_TOKENS {
            vocabulary.add_word(token);
        }
        vocabulary
    }

    /// Builds a vocabulary from tokenized sentences.
    ///
    /// Words occurring fewer than `min_count` times are left out. Remaining
    /// words are ordered by decreasing frequency (ties by first occurrence)
    /// and cut to `max_size` entries including the special tokens.
    pub fn from_sentences<S: AsRef<str>>(
        sentences: &[Vec<S>],
        min_count: usize,
        max_size: Option<usize>,
    ) -> Self {
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for word in sentences.iter().flatten() {
            let next = counts.len();
            counts.entry(word.as_ref()).or_insert((0, next)).0 += 1;
        }

        let mut ranked: Vec<(&str, usize, usize)> = counts
            .into_iter()
            .filter(|(_, (count, _))| *count >= min_count)
            .map(|(word, (count, first))| (word, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut vocabulary = Self::new();
        for (word, _, _) in ranked {
            if max_size.is_some_and(|limit| vocabulary.len() >= limit) {
                break;
            }
            vocabulary.add_word(word);
        }
        vocabulary
    }

    /// Adds `word` if missing and returns its id.
    pub fn add_word(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.index.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.index.contains_key(word)
    }

    /// Id of `word`, falling back to the unknown token.
    pub fn get_word_index(&self, word: &str) -> u32 {
        self.index.get(word).copied().unwrap_or(UNK_TOKEN_INDEX)
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Converts ids to words, stopping before the first end token.
    pub fn ids_to_words(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .take_while(|&&id| id != END_TOKEN_INDEX)
            .map(|&id| self.word(id).unwrap_or(UNK_TOKEN).to_string())
            .collect()
    }

    /// Converts a time-major `[time, batch]` id tensor into one sentence per batch element.
    pub fn vectors_to_sentences(&self, ids: &Tensor) -> Result<Vec<Vec<String>>> {
        ids.dims2()?;
        let per_sequence = ids.t()?.contiguous()?.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        Ok(per_sequence
            .iter()
            .map(|sequence| self.ids_to_words(sequence))
            .collect())
    }

    /// Writes the vocabulary as `{"words": [...]}`.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let payload = VocabularyFile {
            words: self.words.clone(),
        };
        serde_json::to_writer_pretty(&mut writer, &payload)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a vocabulary written by [`Vocabulary::save_json`].
    pub fn from_json(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let payload: VocabularyFile = serde_json::from_reader(BufReader::new(file))?;
        for (expected, found) in SPECIAL_TOKENS.iter().zip(payload.words.iter()) {
            if expected != found {
                return Err(Error::InvalidFile(format!(
                    "expected special token {expected} but found {found}"
                )));
            }
        }
        if payload.words.len() < SPECIAL_TOKENS.len() {
            return Err(Error::InvalidFile(format!(
                "{} does not contain the special tokens",
                path.display()
            )));
        }

        let mut vocabulary = Self {
            words: Vec::with_capacity(payload.words.len()),
            index: HashMap::with_capacity(payload.words.len()),
        };
        for word in &payload.words {
            vocabulary.add_word(word);
        }
        Ok(vocabulary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_tokens_have_reserved_ids() {
        let vocabulary = Vocabulary::new();
        assert_eq!(vocabulary.get_word_index(PAD_TOKEN), PAD_TOKEN_INDEX);
        assert_eq!(vocabulary.get_word_index(START_TOKEN), START_TOKEN_INDEX);
        assert_eq!(vocabulary.get_word_index(END_TOKEN), END_TOKEN_INDEX);
        assert_eq!(vocabulary.get_word_index(UNK_TOKEN), UNK_TOKEN_INDEX);
        assert_eq!(vocabulary.get_word_index("missing"), UNK_TOKEN_INDEX);
    }

    #[test]
    fn from_sentences_orders_by_frequency_and_applies_min_count() {
        let sentences = vec![
            vec!["b", "a", "c"],
            vec!["a", "b", "a"],
            vec!["d"],
        ];
        let vocabulary = Vocabulary::from_sentences(&sentences, 2, None);
        assert_eq!(vocabulary.len(), 6);
        assert_eq!(vocabulary.word(4), Some("a"));
        assert_eq!(vocabulary.word(5), Some("b"));
        assert!(!vocabulary.contains("c"));

        let capped = Vocabulary::from_sentences(&sentences, 1, Some(5));
        assert_eq!(capped.len(), 5);
    }

    #[test]
    fn ids_to_words_stops_at_end_token() {
        let mut vocabulary = Vocabulary::new();
        let hello = vocabulary.add_word("hello");
        let world = vocabulary.add_word("world");
        let words = vocabulary.ids_to_words(&[hello, world, END_TOKEN_INDEX, hello]);
        assert_eq!(words, vec!["hello", "world"]);
    }
}
