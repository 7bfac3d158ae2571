use std::{fs, path::Path};

use rand::{rngs::StdRng, seq::SliceRandom};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Aligned source and target sentences of one minibatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Minibatch {
    pub sources: Vec<Vec<String>>,
    pub targets: Vec<Vec<String>>,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Target tokens plus one end symbol per sentence.
    pub fn target_tokens(&self) -> usize {
        self.targets.iter().map(|sentence| sentence.len() + 1).sum()
    }
}

/// Whitespace-tokenized sentence pairs held in memory.
#[derive(Debug, Clone, Default)]
pub struct ParallelCorpus {
    sources: Vec<Vec<String>>,
    targets: Vec<Vec<String>>,
}

impl ParallelCorpus {
    pub fn new(sources: Vec<Vec<String>>, targets: Vec<Vec<String>>) -> Result<Self> {
        if sources.len() != targets.len() {
            return Err(TrainingError::initialization(format!(
                "parallel corpus has {} source and {} target sentences",
                sources.len(),
                targets.len()
            )));
        }
        Ok(Self { sources, targets })
    }

    /// Reads two line-aligned files; blank lines are kept as empty sentences.
    pub fn from_files(source: &Path, target: &Path) -> Result<Self> {
        let sources = read_sentences(source)?;
        let targets = read_sentences(target)?;
        Self::new(sources, targets).map_err(|err| match err {
            TrainingError::Initialization(message) => TrainingError::initialization(format!(
                "{} and {}: {}",
                source.display(),
                target.display(),
                message
            )),
            other => other,
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[Vec<String>] {
        &self.sources
    }

    pub fn targets(&self) -> &[Vec<String>] {
        &self.targets
    }

    /// Splits the corpus into minibatches of at most `batch_size` pairs.
    ///
    /// With an rng the pair order is shuffled first; the last batch may be short.
    pub fn batches(&self, batch_size: usize, rng: Option<&mut StdRng>) -> Vec<Minibatch> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(|indices| Minibatch {
                sources: indices.iter().map(|&i| self.sources[i].clone()).collect(),
                targets: indices.iter().map(|&i| self.targets[i].clone()).collect(),
            })
            .collect()
    }
}

fn read_sentences(path: &Path) -> Result<Vec<Vec<String>>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {}", path.display(), err))
    })?;
    Ok(contents
        .lines()
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sentences(lines: &[&str]) -> Vec<Vec<String>> {
        lines
            .iter()
            .map(|line| line.split_whitespace().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn misaligned_corpora_are_rejected() {
        let err = ParallelCorpus::new(sentences(&["a b"]), sentences(&[])).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }

    #[test]
    fn batches_keep_pairs_aligned() {
        let corpus = ParallelCorpus::new(
            sentences(&["1", "2", "3", "4", "5"]),
            sentences(&["one", "two", "three", "four", "five"]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let batches = corpus.batches(2, Some(&mut rng));
        assert_eq!(batches.iter().map(Minibatch::len).collect::<Vec<_>>(), vec![2, 2, 1]);

        let words = ["one", "two", "three", "four", "five"];
        for batch in &batches {
            for (source, target) in batch.sources.iter().zip(&batch.targets) {
                let index: usize = source[0].parse().unwrap();
                assert_eq!(target[0], words[index - 1]);
            }
        }
    }

    #[test]
    fn unshuffled_batches_follow_file_order() {
        let corpus =
            ParallelCorpus::new(sentences(&["a", "b", "c"]), sentences(&["x", "y", "z"])).unwrap();
        let batches = corpus.batches(2, None);
        assert_eq!(batches[0].targets, sentences(&["x", "y"]));
        assert_eq!(batches[1].target_tokens(), 2);
    }

    #[test]
    fn files_are_read_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("train.src");
        let target = dir.path().join("train.tgt");
        fs::write(&source, "a  b\n\nc\n").unwrap();
        fs::write(&target, "x\ny\nz w\n").unwrap();
        let corpus = ParallelCorpus::from_files(&source, &target).unwrap();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.sources()[0], vec!["a", "b"]);
        assert!(corpus.sources()[1].is_empty());
        assert_eq!(corpus.targets()[2], vec!["z", "w"]);
    }
}
