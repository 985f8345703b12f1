//! Turns raw association data into an executable command.
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use agent_plugin::PluginConfiguration;
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::model::AssociationRawData;
use crate::command::{CommandState, DocumentInfo, DocumentStatus, PluginState};

pub mod document;
pub mod params;

pub use document::{RawDocument, document_schema};

/// Input key that bounds a plugin's run time.
pub const TIMEOUT_INPUT: &str = "timeoutSeconds";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("parameter resolution failed: {0}")]
    ParameterResolution(String),
}

/// Normalized, executable form of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub document_name: String,
    pub document_version: Option<String>,
    pub schema_version: String,
    pub description: Option<String>,
    /// Plugins in declaration order.
    pub plugins: Vec<PluginConfiguration>,
    pub parameters: BTreeMap<String, Value>,
}

pub trait DocumentParser: Send + Sync {
    /// Validates the document and applies the association's parameters.
    /// Never mutates `raw`.
    fn parse_document_with_params(&self, raw: &AssociationRawData) -> Result<CommandPayload, ParseError>;

    /// Builds the initial record: every plugin unexecuted, status pending.
    fn initialize_command_state(&self, payload: &CommandPayload, raw: &AssociationRawData) -> CommandState;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn DocumentParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentParser").field("impl", &self.name()).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssociationParser;

impl AssociationParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

/// Reads JSON, falling back to YAML.
fn decode_content(content: &str) -> Result<Value, ParseError> {
    if content.trim().is_empty() {
        return Err(ParseError::Malformed("document is empty".into()));
    }
    match serde_json::from_str::<Value>(content) {
        Ok(value) => Ok(value),
        Err(json_err) => serde_yaml_bw::from_str::<Value>(content).map_err(|yaml_err| {
            ParseError::Malformed(format!("neither JSON ({json_err}) nor YAML ({yaml_err})"))
        }),
    }
}

/// Compiled once from the generated schema.
static DOCUMENT_VALIDATOR: Lazy<Result<jsonschema::Validator, String>> = Lazy::new(|| {
    let schema = serde_json::to_value(document_schema()).map_err(|e| e.to_string())?;
    jsonschema::validator_for(&schema).map_err(|e| e.to_string())
});

/// Checks a decoded document against the generated schema.
pub fn validate_document(value: &Value) -> Result<(), ParseError> {
    let validator = DOCUMENT_VALIDATOR
        .as_ref()
        .map_err(|e| ParseError::Malformed(format!("document schema: {e}")))?;
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ParseError::Malformed(errors.join("; ")))
    }
}

/// Reads and structurally checks a document.
pub fn load_document(content: &str) -> Result<RawDocument, ParseError> {
    let mut value = decode_content(content)?;
    // YAML authors often leave the version unquoted.
    if let Some(obj) = value.as_object_mut() {
        if let Some(Value::Number(n)) = obj.get("schemaVersion") {
            let text = n.to_string();
            obj.insert("schemaVersion".into(), Value::String(text));
        }
    }
    validate_document(&value)?;
    let doc: RawDocument = serde_json::from_value(value).map_err(|e| ParseError::Malformed(e.to_string()))?;

    match doc.major_version() {
        Some(1) if doc.runtime_config.is_empty() => {
            Err(ParseError::Malformed("schema 1.x document without runtimeConfig".into()))
        }
        Some(2) if doc.main_steps.is_empty() => {
            Err(ParseError::Malformed("schema 2.x document without mainSteps".into()))
        }
        Some(1) | Some(2) => {
            let mut seen = HashSet::new();
            for step in &doc.main_steps {
                if step.name.trim().is_empty() {
                    return Err(ParseError::Malformed(format!("step for `{}` has no name", step.action)));
                }
                if !seen.insert(step.name.as_str()) {
                    return Err(ParseError::Malformed(format!("duplicate step name `{}`", step.name)));
                }
            }
            Ok(doc)
        }
        _ => Err(ParseError::Malformed(format!(
            "unsupported schemaVersion `{}`",
            doc.schema_version
        ))),
    }
}

/// Declared steps as (name, capability, inputs), before substitution.
fn declared_steps(doc: &RawDocument) -> Vec<(String, String, Value)> {
    if doc.major_version() == Some(1) {
        doc.runtime_config
            .iter()
            .map(|(capability, entry)| {
                let properties = entry.get("properties").cloned().unwrap_or(Value::Null);
                (capability.clone(), capability.clone(), properties)
            })
            .collect()
    } else {
        doc.main_steps
            .iter()
            .map(|s| (s.name.clone(), s.action.clone(), Value::Object(s.inputs.clone())))
            .collect()
    }
}

fn timeout_of(inputs: &Value) -> Result<Option<u64>, ParseError> {
    match inputs.get(TIMEOUT_INPUT) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ParseError::Malformed(format!("{TIMEOUT_INPUT} must be a positive integer, got {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ParseError::Malformed(format!("{TIMEOUT_INPUT} must be a positive integer, got `{s}`"))),
        Some(other) => Err(ParseError::Malformed(format!(
            "{TIMEOUT_INPUT} must be a positive integer, got {other}"
        ))),
    }
}

impl DocumentParser for AssociationParser {
    fn parse_document_with_params(&self, raw: &AssociationRawData) -> Result<CommandPayload, ParseError> {
        let content = raw
            .document
            .as_deref()
            .ok_or_else(|| ParseError::Malformed(format!("document `{}` was not loaded", raw.document_name)))?;
        let doc = load_document(content)?;
        let resolved = params::resolve_parameters(&doc.parameters, &raw.parameters)?;

        let mut plugins = Vec::new();
        for (name, capability, inputs) in declared_steps(&doc) {
            let inputs = params::substitute(&inputs, &resolved)?;
            let timeout = timeout_of(&inputs)?;
            let mut config = PluginConfiguration::new(name, capability, inputs);
            config.timeout_seconds = timeout;
            plugins.push(config);
        }

        Ok(CommandPayload {
            document_name: raw.document_name.clone(),
            document_version: raw.document_version.clone(),
            schema_version: doc.schema_version,
            description: doc.description,
            plugins,
            parameters: resolved.into_iter().map(|(k, p)| (k, p.value)).collect(),
        })
    }

    fn initialize_command_state(&self, payload: &CommandPayload, raw: &AssociationRawData) -> CommandState {
        CommandState {
            document_info: DocumentInfo {
                command_id: raw.command_id(),
                instance_id: raw.instance_id.clone(),
                association_id: raw.association_id.clone(),
                association_name: raw.name.clone(),
                document_name: payload.document_name.clone(),
                document_version: payload.document_version.clone(),
                status: DocumentStatus::Pending,
                message: String::new(),
                created_at: Utc::now(),
                finished_at: None,
                reported: false,
            },
            plugins: payload.plugins.iter().cloned().map(PluginState::new).collect(),
        }
    }

    fn name(&self) -> &'static str {
        "AssociationParser"
    }
}
