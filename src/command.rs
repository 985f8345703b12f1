//! Durable per-command records: identity, document status and per-plugin state.
use std::collections::HashMap;
use std::fmt;

use agent_plugin::{PluginConfiguration, PluginResult, ResultStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a persisted command record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandKey {
    pub instance_id: String,
    pub command_id: String,
}

impl CommandKey {
    pub fn new(instance_id: impl Into<String>, command_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            command_id: command_id.into(),
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.command_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Success | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Pending => "Pending",
            DocumentStatus::InProgress => "InProgress",
            DocumentStatus::Success => "Success",
            DocumentStatus::Failed => "Failed",
            DocumentStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// The lightweight sub-record used for status polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub command_id: String,
    pub instance_id: String,
    pub association_id: String,
    pub association_name: String,
    pub document_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_version: Option<String>,
    pub status: DocumentStatus,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the terminal status reached the control plane.
    #[serde(default)]
    pub reported: bool,
}

impl DocumentInfo {
    pub fn key(&self) -> CommandKey {
        CommandKey::new(&self.instance_id, &self.command_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginState {
    pub name: String,
    pub configuration: PluginConfiguration,
    pub has_executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PluginResult>,
}

impl PluginState {
    pub fn new(configuration: PluginConfiguration) -> Self {
        Self {
            name: configuration.plugin_name.clone(),
            configuration,
            has_executed: false,
            result: None,
        }
    }

    /// Stores a result; a plugin with a result counts as executed.
    pub fn record(&mut self, result: PluginResult) {
        self.result = Some(result);
        self.has_executed = true;
    }
}

/// Everything the agent knows about one command run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandState {
    pub document_info: DocumentInfo,
    /// Plugin states in document declaration order, names unique.
    pub plugins: Vec<PluginState>,
}

impl CommandState {
    pub fn key(&self) -> CommandKey {
        self.document_info.key()
    }

    pub fn command_id(&self) -> &str {
        &self.document_info.command_id
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginState> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn plugin_mut(&mut self, name: &str) -> Option<&mut PluginState> {
        self.plugins.iter_mut().find(|p| p.name == name)
    }

    /// Applies one plugin result. Returns false when the plugin is unknown.
    pub fn apply_result(&mut self, result: PluginResult) -> bool {
        match self.plugin_mut(&result.plugin_name) {
            Some(state) => {
                state.record(result);
                true
            }
            None => false,
        }
    }

    pub fn apply_results(&mut self, results: HashMap<String, PluginResult>) {
        for (_, result) in results {
            self.apply_result(result);
        }
    }

    pub fn all_executed(&self) -> bool {
        self.plugins.iter().all(|p| p.has_executed)
    }

    pub fn executed_count(&self) -> usize {
        self.plugins.iter().filter(|p| p.has_executed).count()
    }

    /// Aggregates plugin outcomes into a document status.
    pub fn compute_status(&self, cancelled: bool) -> DocumentStatus {
        if cancelled && !self.all_executed() {
            return DocumentStatus::Cancelled;
        }
        let any_failed = self.plugins.iter().any(|p| {
            p.result
                .as_ref()
                .map_or(false, |r| r.status != ResultStatus::Success)
        });
        if any_failed || !self.all_executed() {
            DocumentStatus::Failed
        } else {
            DocumentStatus::Success
        }
    }

    /// Sets the document status and a human readable summary.
    pub fn finish(&mut self, cancelled: bool) -> DocumentStatus {
        let status = self.compute_status(cancelled);
        self.document_info.status = status;
        self.document_info.message = self.summary(status);
        if status.is_terminal() {
            self.document_info.finished_at = Some(Utc::now());
        }
        status
    }

    fn summary(&self, status: DocumentStatus) -> String {
        let total = self.plugins.len();
        let executed = self.executed_count();
        match status {
            DocumentStatus::Success => format!("{executed} of {total} plugins succeeded"),
            DocumentStatus::Cancelled => {
                format!("cancelled after {executed} of {total} plugins")
            }
            _ => {
                let failures: Vec<String> = self
                    .plugins
                    .iter()
                    .filter_map(|p| {
                        let r = p.result.as_ref()?;
                        if r.status.is_success() {
                            return None;
                        }
                        Some(format!(
                            "{} {:?}: {}",
                            p.name,
                            r.status,
                            r.error.as_deref().unwrap_or("non-zero exit code")
                        ))
                    })
                    .collect();
                let not_run: Vec<&str> = self
                    .plugins
                    .iter()
                    .filter(|p| !p.has_executed)
                    .map(|p| p.name.as_str())
                    .collect();
                let mut parts = Vec::new();
                if !failures.is_empty() {
                    parts.push(failures.join("; "));
                }
                if !not_run.is_empty() {
                    parts.push(format!("not executed: {}", not_run.join(", ")));
                }
                parts.join("; ")
            }
        }
    }
}
