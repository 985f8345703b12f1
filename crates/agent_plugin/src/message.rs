use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::PluginError;

/// One step of a command document, as handed to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfiguration {
    /// Unique step name inside the document.
    pub plugin_name: String,
    /// Capability (action) the registry resolves to a handler.
    pub capability: String,
    /// Step inputs after parameter substitution.
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl PluginConfiguration {
    pub fn new(plugin_name: impl Into<String>, capability: impl Into<String>, inputs: Value) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            capability: capability.into(),
            inputs,
            timeout_seconds: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Reads a string input, if present.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }

    pub fn input_bool(&self, key: &str) -> Option<bool> {
        self.inputs.get(key).and_then(Value::as_bool)
    }

    pub fn input_u64(&self, key: &str) -> Option<u64> {
        self.inputs.get(key).and_then(Value::as_u64)
    }
}

/// What a handler hands back on success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginOutput {
    pub exit_code: i32,
    pub output: Value,
}

impl PluginOutput {
    pub fn new(output: Value) -> Self {
        Self { exit_code: 0, output }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResultStatus {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl ResultStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Success)
    }
}

/// The outcome of running one plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginResult {
    pub plugin_name: String,
    pub capability: String,
    pub status: ResultStatus,
    pub code: i32,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PluginResult {
    /// Builds a result from a handler outcome.
    pub fn from_outcome(
        config: &PluginConfiguration,
        started_at: DateTime<Utc>,
        outcome: Result<PluginOutput, PluginError>,
    ) -> Self {
        let finished_at = Utc::now();
        match outcome {
            Ok(out) => Self {
                plugin_name: config.plugin_name.clone(),
                capability: config.capability.clone(),
                status: if out.exit_code == 0 { ResultStatus::Success } else { ResultStatus::Failed },
                code: out.exit_code,
                output: out.output,
                error: None,
                started_at,
                finished_at,
            },
            Err(err) => {
                let status = match err {
                    PluginError::Timeout(_) => ResultStatus::TimedOut,
                    PluginError::Cancelled => ResultStatus::Cancelled,
                    _ => ResultStatus::Failed,
                };
                Self {
                    plugin_name: config.plugin_name.clone(),
                    capability: config.capability.clone(),
                    status,
                    code: 1,
                    output: Value::Null,
                    error: Some(err.to_string()),
                    started_at,
                    finished_at,
                }
            }
        }
    }

    /// Result for a plugin whose capability has no registered handler.
    pub fn unresolved(config: &PluginConfiguration) -> Self {
        let now = Utc::now();
        Self {
            plugin_name: config.plugin_name.clone(),
            capability: config.capability.clone(),
            status: ResultStatus::Failed,
            code: 1,
            output: Value::Null,
            error: Some(format!("no plugin registered for capability `{}`", config.capability)),
            started_at: now,
            finished_at: now,
        }
    }
}
