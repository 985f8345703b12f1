use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Args;
use serde_json::Value;

use super::CliContext;
use converge_agent::association::{AssociationParser, AssociationRawData, DocumentParser};
use converge_agent::logger::init_console;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Document file (JSON or YAML)
    pub file: PathBuf,

    /// Association parameter, `name=value`. Values that parse as JSON are
    /// passed as JSON, anything else as a string.
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,
}

fn parse_params(raw: &[String]) -> anyhow::Result<HashMap<String, Value>> {
    let mut params = HashMap::new();
    for pair in raw {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("parameter `{pair}` is not of the form NAME=VALUE");
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        params.insert(name.trim().to_string(), value);
    }
    Ok(params)
}

pub async fn execute(args: ValidateArgs, _context: &CliContext) -> anyhow::Result<()> {
    init_console("warn");
    let content = fs::read_to_string(&args.file)
        .with_context(|| format!("could not read {}", args.file.display()))?;
    let document_name = args
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());

    let raw = AssociationRawData {
        association_id: "local".into(),
        name: document_name.clone(),
        instance_id: "local".into(),
        document_name,
        parameters: parse_params(&args.params)?,
        document: Some(content),
        ..Default::default()
    };
    let payload = AssociationParser
        .parse_document_with_params(&raw)
        .with_context(|| format!("{} is not a valid document", args.file.display()))?;

    println!("✅ {} (schema {})", args.file.display(), payload.schema_version);
    for plugin in &payload.plugins {
        let timeout = plugin
            .timeout_seconds
            .map(|s| format!(" timeout={s}s"))
            .unwrap_or_default();
        println!("  - {} [{}]{timeout}", plugin.plugin_name, plugin.capability);
        println!("    {}", plugin.inputs);
    }
    Ok(())
}
