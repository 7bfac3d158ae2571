use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value};

use crate::{
    metrics::{EvaluationSummary, StepSnapshot},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub jsonl: Option<PathBuf>,
}

impl LoggingSettings {
    pub fn from_config(config: &crate::config::LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            jsonl: config.jsonl.clone(),
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    jsonl: Option<JsonLinesWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let jsonl = match settings.jsonl.as_ref() {
            Some(path) => Some(JsonLinesWriter::create(path)?),
            None => None,
        };
        Ok(Self { settings, jsonl })
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            println!(
                "train step={} loss={:.4} loss_ema={:.4} sentences={} tok/s={:.1} grad_norm={:.3} lr={:.5e}",
                step,
                snapshot.step_loss,
                snapshot.loss,
                snapshot.sentences,
                snapshot.tokens_per_sec,
                snapshot.grad_norm,
                lr
            );
        }

        self.write(json!({
            "kind": "train",
            "step": step,
            "loss": snapshot.step_loss,
            "loss_ema": snapshot.loss,
            "sentences": snapshot.sentences,
            "tokens": snapshot.tokens,
            "tokens_per_sec": snapshot.tokens_per_sec,
            "grad_norm": snapshot.grad_norm,
            "learning_rate": lr,
            "wall_time_secs": snapshot.wall_time.as_secs_f64(),
        }));
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            println!(
                "eval step={} train_loss={:.4} runtime_loss={:.4} exact={:.2}% sentences={}",
                step,
                summary.train_loss,
                summary.runtime_loss,
                summary.exact_match * 100.0,
                summary.sentences
            );
            for sample in &summary.samples {
                println!("  src: {}", sample.source.join(" "));
                println!("  ref: {}", sample.reference.join(" "));
                println!("  out: {}", sample.hypothesis.join(" "));
            }
        }

        let samples: Vec<Value> = summary
            .samples
            .iter()
            .map(|sample| {
                json!({
                    "source": sample.source.join(" "),
                    "reference": sample.reference.join(" "),
                    "hypothesis": sample.hypothesis.join(" "),
                })
            })
            .collect();
        self.write(json!({
            "kind": "eval",
            "step": step,
            "train_loss": summary.train_loss,
            "runtime_loss": summary.runtime_loss,
            "exact_match": summary.exact_match,
            "sentences": summary.sentences,
            "samples": samples,
        }));
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.jsonl.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }

    fn write(&mut self, record: Value) {
        if let Some(writer) = self.jsonl.as_mut() {
            if let Err(err) = writer.write_record(record) {
                log::warn!("{err}");
            }
        }
    }
}

struct JsonLinesWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesWriter {
    fn create(path: &Path) -> Result<Self, TrainingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to create log directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to open log file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn write_record(&mut self, mut record: Value) -> Result<(), TrainingError> {
        if let Some(object) = record.as_object_mut() {
            object.insert("unix_time".to_string(), json!(current_wall_time()));
        }
        serde_json::to_writer(&mut self.writer, &record).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write log record to {}: {err}",
                self.path.display()
            ))
        })?;
        self.writer.write_all(b"\n").map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write log record to {}: {err}",
                self.path.display()
            ))
        })
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to flush log file {}: {err}",
                self.path.display()
            ))
        })
    }
}

impl Drop for JsonLinesWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TrainingMetrics;

    #[test]
    fn jsonl_records_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("train.jsonl");
        let mut logger = Logger::new(LoggingSettings {
            enable_stdout: false,
            jsonl: Some(path.clone()),
        })
        .unwrap();

        let mut metrics = TrainingMetrics::new();
        logger.log_training_step(1, 1e-3, &metrics.record_step(2, 10, 3.5, 0.7));
        logger.log_training_step(2, 1e-3, &metrics.record_step(2, 10, 2.5, 0.6));
        logger.flush();

        let contents = fs::read_to_string(&path).unwrap();
        let records: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["kind"], "train");
        assert_eq!(records[1]["step"], 2);
        assert_eq!(records[1]["loss"], 2.5);
        assert!(records[0]["unix_time"].is_number());
    }
}
