use std::{fs, path::Path};

use tempfile::tempdir;
use training::{Trainer, TrainingConfig, TrainingError};
use vocabulary::Vocabulary;

fn write_copy_corpus(dir: &Path) {
    let words = ["red", "green", "blue", "cyan", "gray"];
    let lines: Vec<String> = (0..24)
        .map(|i| {
            (0..1 + i % 3)
                .map(|j| words[(i + j) % words.len()])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    let text = lines.join("\n");
    fs::write(dir.join("train.src"), &text).unwrap();
    fs::write(dir.join("train.tgt"), &text).unwrap();
}

fn config_toml(extra: &str) -> String {
    format!(
        r#"
[encoder]
embedding_size = 16
state_size = 16

[decoder]
name = "decoder"
max_output_len = 6
embedding_size = 16
rnn_size = 16
use_attention = true

[data]
train_source = "train.src"
train_target = "train.tgt"
batch_size = 6
vocabulary_dir = "vocab"

[optimizer]
learning_rate = 0.03
max_grad_norm = 5.0

[runtime]
seed = 3
epochs = 6
log_every_n_steps = 4

[runtime.evaluation]
samples = 2

[runtime.logging]
enable_stdout = false
jsonl = "logs/train.jsonl"
{extra}
"#
    )
}

#[test]
fn smoke_training_reduces_the_teacher_forced_loss() {
    let tmp = tempdir().expect("tempdir");
    let base = tmp.path();
    write_copy_corpus(base);
    let config_path = base.join("config.toml");
    fs::write(&config_path, config_toml("")).unwrap();

    let mut trainer = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    let initial = trainer.evaluate(None).unwrap();
    trainer.train().unwrap();
    let after = trainer.evaluate(None).unwrap();

    assert_eq!(trainer.epochs_completed(), 6);
    assert_eq!(trainer.optimizer_steps(), 24);
    assert!(
        after.train_loss < initial.train_loss,
        "loss did not decrease: {} -> {}",
        initial.train_loss,
        after.train_loss
    );
    assert!(after.runtime_loss.is_finite());
    assert_eq!(after.sentences, 24);
    assert_eq!(after.samples.len(), 2);

    let vocabulary = Vocabulary::from_json(&base.join("vocab").join("target_vocabulary.json")).unwrap();
    assert_eq!(vocabulary.len(), 4 + 5);

    let log = fs::read_to_string(base.join("logs").join("train.jsonl")).unwrap();
    let kinds: Vec<String> = log
        .lines()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            record["kind"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert!(kinds.iter().any(|kind| kind == "train"));
    assert_eq!(kinds.last().map(String::as_str), Some("eval"));
}

#[test]
fn max_steps_stops_training_early() {
    let tmp = tempdir().expect("tempdir");
    let base = tmp.path();
    write_copy_corpus(base);
    let config_path = base.join("config.json");
    let mut config: TrainingConfig = toml::from_str(&config_toml("")).unwrap();
    config.runtime.max_steps = Some(5);
    config.runtime.logging.jsonl = None;
    config.decoder.rnn_cell = "LSTM".to_string();
    fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

    let mut trainer = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.optimizer_steps(), 5);
    assert_eq!(trainer.epochs_completed(), 1);
}

#[test]
fn missing_corpus_fails_initialization() {
    let tmp = tempdir().expect("tempdir");
    let config_path = tmp.path().join("config.toml");
    fs::write(&config_path, config_toml("")).unwrap();

    let config = TrainingConfig::load(&config_path).unwrap();
    assert!(matches!(
        Trainer::new(config),
        Err(TrainingError::Initialization(_))
    ));
}
