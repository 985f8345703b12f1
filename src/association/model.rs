use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::DocumentStatus;

/// One association assigned to an instance, as listed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssociationRawData {
    pub association_id: String,
    pub name: String,
    pub instance_id: String,
    pub document_name: String,
    #[serde(default)]
    pub document_version: Option<String>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Raw document text, absent until the detail was loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_date: Option<DateTime<Utc>>,
}

impl AssociationRawData {
    pub fn is_loaded(&self) -> bool {
        self.document.is_some()
    }

    /// Stable id of the command this revision of the association produces.
    ///
    /// Built from the association id and the document checksum, falling back
    /// to the document version, so repeated ticks address the same record.
    pub fn command_id(&self) -> String {
        let revision = if !self.checksum.is_empty() {
            self.checksum.as_str()
        } else {
            self.document_version.as_deref().unwrap_or("latest")
        };
        format!("{}.{}", self.association_id, revision)
    }
}

/// Status values the control plane accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AssociationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl AssociationStatus {
    /// Maps a document status to what is reported. Cancelled runs are
    /// resumed later, so they still read as in progress.
    pub fn from_document(status: DocumentStatus) -> Self {
        match status {
            DocumentStatus::Pending => AssociationStatus::Pending,
            DocumentStatus::InProgress | DocumentStatus::Cancelled => AssociationStatus::InProgress,
            DocumentStatus::Success => AssociationStatus::Success,
            DocumentStatus::Failed => AssociationStatus::Failed,
        }
    }
}

impl fmt::Display for AssociationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssociationStatus::Pending => "Pending",
            AssociationStatus::InProgress => "InProgress",
            AssociationStatus::Success => "Success",
            AssociationStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Describes the reporting agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusOutput {
    #[serde(default)]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssociationPage {
    #[serde(default)]
    pub associations: Vec<AssociationRawData>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_id_prefers_checksum() {
        let mut raw = AssociationRawData {
            association_id: "a-1".into(),
            checksum: "c0ffee".into(),
            document_version: Some("3".into()),
            ..Default::default()
        };
        assert_eq!(raw.command_id(), "a-1.c0ffee");

        raw.checksum.clear();
        assert_eq!(raw.command_id(), "a-1.3");

        raw.document_version = None;
        assert_eq!(raw.command_id(), "a-1.latest");
    }

    #[test]
    fn test_raw_data_decodes_sparse_listing() {
        let raw: AssociationRawData = serde_json::from_value(json!({
            "associationId": "a-1",
            "name": "configure",
            "instanceId": "i-1",
            "documentName": "doc",
            "parameters": {"message": "hi"}
        }))
        .unwrap();
        assert!(!raw.is_loaded());
        assert_eq!(raw.parameters["message"], json!("hi"));
    }

    #[test]
    fn test_cancelled_reports_in_progress() {
        assert_eq!(
            AssociationStatus::from_document(DocumentStatus::Cancelled),
            AssociationStatus::InProgress
        );
        assert_eq!(AssociationStatus::Failed.to_string(), "Failed");
    }
}
