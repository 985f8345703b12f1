use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod run;
pub mod schema;
pub mod state;
pub mod validate;

use run::RunArgs;
use schema::SchemaArgs;
use state::StateArgs;
use validate::ValidateArgs;

use converge_agent::config::{AgentConfig, ConfigManager};

#[derive(Parser, Debug)]
#[command(
    name = "converge",
    about = "Keeps this host converged with its assigned associations",
    version
)]
pub struct Cli {
    /// Dotenv file seeding the configuration
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the association poll loop
    Run(RunArgs),

    /// Parse a document locally and print the resolved plugins
    Validate(ValidateArgs),

    /// Emit the document JSON-Schema
    Schema(SchemaArgs),

    /// List persisted command records of an instance
    State(StateArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }

    /// Typed settings, read when a command first needs them.
    pub async fn config(&self) -> anyhow::Result<AgentConfig> {
        Ok(AgentConfig::load(&self.config_manager).await?)
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Validate(args) => validate::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::State(args) => state::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
