//! Step-configuration parsing and coercion.
//!
//! Template documents arrive as loosely typed maps. Numeric fields may be
//! integers or floats, durations may be numbers of seconds or human-readable
//! strings, and string lists may be heterogeneous. The helpers here normalize
//! all of that; `LoopConfig` layers validation on top for the loop step.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::types::StepDefinition;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("option {key} must not be negative, got {value}")]
    Negative { key: String, value: i64 },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("unlimited loop requires an exit gate (until, until_signal, or exit_conditions)")]
    MissingExitGate,
    #[error("invalid inner steps: {0}")]
    InvalidSteps(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

type ConfigMap = serde_json::Map<String, Value>;

/// Read a boolean option; absent or non-boolean values read as `false`.
pub fn opt_bool(config: &ConfigMap, key: &str) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Read a string option.
pub fn opt_str<'a>(config: &'a ConfigMap, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

/// Read an integer option, accepting both integer and floating-point values.
pub fn opt_i64(config: &ConfigMap, key: &str) -> Option<i64> {
    coerce_i64(config.get(key)?)
}

/// Coerce a JSON number (integer or float) to `i64`.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// Read a duration option.
///
/// Accepts a number (seconds, integer or float), a humantime string
/// (`"30s"`, `"5m"`), or a bare numeric string.
pub fn opt_duration(config: &ConfigMap, key: &str) -> Result<Option<Duration>> {
    let Some(value) = config.get(key) else {
        return Ok(None);
    };
    coerce_duration(value)
        .map(Some)
        .map_err(|reason| ConfigError::Invalid {
            key: key.to_string(),
            reason,
        })
}

fn coerce_duration(value: &Value) -> std::result::Result<Duration, String> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .filter(|s| *s >= 0.0)
                .ok_or_else(|| format!("not a non-negative number: {n}"))?;
            Ok(Duration::from_secs_f64(secs))
        }
        Value::String(s) => {
            if let Ok(parsed) = humantime::parse_duration(s) {
                Ok(parsed)
            } else if let Ok(secs) = s.parse::<u64>() {
                Ok(Duration::from_secs(secs))
            } else {
                Err(format!("not a duration: {s:?}"))
            }
        }
        other => Err(format!("expected duration, got {other}")),
    }
}

/// Read a string-list option. Non-string entries in a heterogeneous list are
/// skipped rather than rejected.
pub fn opt_string_list(config: &ConfigMap, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Serde helper for optional durations in step definitions.
///
/// Accepts the same shapes as [`opt_duration`]; serializes as a humantime
/// string so templates round-trip legibly.
pub mod duration_opt {
    use super::{coerce_duration, Duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => coerce_duration(&v).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

// --- Loop configuration ---

/// Consecutive-error threshold applied when the config leaves it at 0.
pub const DEFAULT_CONSECUTIVE_ERRORS: u32 = 5;

/// Parsed and validated configuration for a loop step.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// 0 = unlimited (an exit gate must then be configured).
    pub max_iterations: u32,
    /// Named built-in condition over task state, checked before each iteration.
    pub until: Option<String>,
    /// Whether the AI `{"exit": true}` signal can terminate the loop.
    pub until_signal: bool,
    /// Substrings that must ALL appear in iteration output for a signal exit.
    pub exit_conditions: Vec<String>,
    /// Advisory only; the engine does not reset AI conversation state.
    pub fresh_context: bool,
    /// Relative filename for the cross-iteration memory document.
    pub scratchpad_file: Option<String>,
    /// Errors in a row before the circuit breaker trips.
    pub consecutive_errors: u32,
    /// Iterations without file changes before the breaker trips (0 disables).
    pub stagnation_iterations: u32,
    /// Inner program executed each iteration.
    pub steps: Vec<StepDefinition>,
}

impl LoopConfig {
    /// Parse the loop options from a step definition, failing fast on
    /// negative counters or a missing exit gate before any inner step runs.
    pub fn from_step(step: &StepDefinition) -> Result<Self> {
        let config = &step.config;

        let max_iterations = non_negative(config, "max_iterations")?;
        let until = opt_str(config, "until").map(str::to_string);
        let until_signal = opt_bool(config, "until_signal");
        let exit_conditions = opt_string_list(config, "exit_conditions");
        let fresh_context = opt_bool(config, "fresh_context");
        let scratchpad_file = opt_str(config, "scratchpad_file").map(str::to_string);

        let (mut consecutive_errors, stagnation_iterations) = match config.get("circuit_breaker") {
            Some(Value::Object(breaker)) => (
                non_negative(breaker, "consecutive_errors")?,
                non_negative(breaker, "stagnation_iterations")?,
            ),
            _ => (0, 0),
        };
        if consecutive_errors == 0 {
            consecutive_errors = DEFAULT_CONSECUTIVE_ERRORS;
        }

        if max_iterations == 0 && until.is_none() && !until_signal && exit_conditions.is_empty() {
            return Err(ConfigError::MissingExitGate);
        }

        let steps = match config.get("steps") {
            Some(value) => serde_json::from_value::<Vec<StepDefinition>>(value.clone())
                .map_err(|e| ConfigError::InvalidSteps(e.to_string()))?,
            None => Vec::new(),
        };

        Ok(Self {
            max_iterations,
            until,
            until_signal,
            exit_conditions,
            fresh_context,
            scratchpad_file,
            consecutive_errors,
            stagnation_iterations,
            steps,
        })
    }
}

fn non_negative(config: &ConfigMap, key: &str) -> Result<u32> {
    let Some(value) = config.get(key) else {
        return Ok(0);
    };
    let n = coerce_i64(value).ok_or_else(|| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("expected an integer, got {value}"),
    })?;
    if n < 0 {
        return Err(ConfigError::Negative {
            key: key.to_string(),
            value: n,
        });
    }
    Ok(n as u32)
}
