//! `key.path=value` overrides applied on top of a loaded configuration.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::{TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideArg {
    pub path: String,
    pub value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Round-trips the configuration through JSON, replacing every overridden
/// value, and validates the result.
pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    let config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("invalid config after overrides: {err}"))
    })?;
    config.validate()?;
    Ok(config)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{}' has an empty segment",
            path
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let mut current = target;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{}' points into a non-object value",
                segment
            )));
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), new_value);
            Ok(())
        }
        _ => Err(TrainingError::runtime(format!(
            "override path '{}' points into a non-object value",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainingConfig {
        toml::from_str(
            r#"
[decoder]
name = "decoder"
max_output_len = 8
embedding_size = 8

[data]
train_source = "train.src"
train_target = "train.tgt"
"#,
        )
        .unwrap()
    }

    fn arg(raw: &str) -> OverrideArg {
        raw.parse().unwrap()
    }

    #[test]
    fn parses_key_value_pairs() {
        assert_eq!(
            arg(" runtime.seed = 7 "),
            OverrideArg {
                path: "runtime.seed".into(),
                value: "7".into()
            }
        );
        assert!("runtime.seed".parse::<OverrideArg>().is_err());
        assert!("=3".parse::<OverrideArg>().is_err());
    }

    #[test]
    fn values_are_typed() {
        assert_eq!(parse_override_value("true"), Value::Bool(true));
        assert_eq!(parse_override_value("12"), Value::from(12));
        assert_eq!(parse_override_value("0.5"), Value::from(0.5));
        assert_eq!(parse_override_value("[1, 2]"), serde_json::json!([1, 2]));
        assert_eq!(parse_override_value("LSTM"), Value::from("LSTM"));
    }

    #[test]
    fn nested_values_are_replaced() {
        let updated = apply_overrides(
            config(),
            &[
                arg("decoder.rnn_cell=LSTM"),
                arg("optimizer.learning_rate=0.01"),
                arg("runtime.evaluation.every_n_steps=5"),
                arg("data.batch_size=4"),
            ],
        )
        .unwrap();
        assert_eq!(updated.decoder.rnn_cell, "LSTM");
        assert!((updated.optimizer.learning_rate - 0.01).abs() < 1e-9);
        assert_eq!(updated.runtime.evaluation.every_n_steps, Some(5));
        assert_eq!(updated.data.batch_size, 4);
    }

    #[test]
    fn invalid_results_are_rejected() {
        assert!(matches!(
            apply_overrides(config(), &[arg("data.batch_size=0")]),
            Err(TrainingError::Validation(_))
        ));
        assert!(apply_overrides(config(), &[arg("data.batch_size.inner=1")]).is_err());
        assert!(apply_overrides(config(), &[arg("data..batch_size=1")]).is_err());
    }
}
