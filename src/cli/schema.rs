use std::fs;
use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use converge_agent::association::parser::document_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(&document_schema())?;
    match args.out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, rendered)?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
