//! The command document model and its JSON schema.
use std::collections::BTreeMap;

use schemars::{JsonSchema, Schema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command document as authored, before parameters are applied.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawDocument {
    /// `1.x` documents use `runtimeConfig`, `2.x` documents use `mainSteps`.
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub main_steps: Vec<Step>,
    /// Capability name to its properties, in declaration order.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[schemars(with = "BTreeMap<String, RuntimeConfigEntry>")]
    pub runtime_config: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Capability the step invokes.
    pub action: String,
    /// Unique within the document.
    pub name: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RuntimeConfigEntry {
    #[serde(default)]
    pub properties: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDecl {
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ParameterType {
    #[default]
    String,
    StringList,
    Integer,
    Boolean,
    StringMap,
    MapList,
}

impl ParameterType {
    /// Whether a value of this type can be embedded inside a longer string.
    pub fn is_scalar(&self) -> bool {
        matches!(self, ParameterType::String | ParameterType::Integer | ParameterType::Boolean)
    }
}

impl RawDocument {
    /// Major part of `schemaVersion`, if it parses.
    pub fn major_version(&self) -> Option<u32> {
        self.schema_version.split('.').next()?.trim().parse().ok()
    }
}

pub fn document_schema() -> Schema {
    schema_for!(RawDocument)
}
