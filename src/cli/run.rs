use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::CliContext;
use converge_agent::association::http::HttpControlPlane;
use converge_agent::association::{AssociationParser, AssociationService, Processor};
use converge_agent::engine::{Engine, PluginRegistry};
use converge_agent::logger::init_tracing;
use converge_agent::store::FileStateStore;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Run a single tick and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            once: false,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = context.config().await?;
    let log_dir = config.state_dir.join("logs");
    init_tracing(&log_dir, &args.log_level)?;

    let endpoint = config.require_run_settings()?;
    info!(%endpoint, state_dir = %config.state_dir.display(), "converge agent starting up");
    debug!(source = ?context.config_manager, ?config, "configuration loaded");

    let control_plane = HttpControlPlane::new(endpoint, config.http_timeout)
        .context("could not build the control plane client")?;
    let processor = Processor::new(
        AssociationService::new(Arc::new(control_plane)),
        AssociationParser::new(),
        Engine::new(),
        FileStateStore::new(&config.state_dir),
        PluginRegistry::with_builtins(),
        Arc::new(config.stop_policy()),
        config.processor_settings(),
    );

    let shutdown = CancellationToken::new();
    if args.once {
        let report = processor.tick(&shutdown).await;
        let failed = report.count("failed");
        if failed > 0 {
            error!(failed, "tick finished with failed associations");
        }
        return Ok(());
    }

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("could not listen for Ctrl-C: {e}"),
        }
        ctrl_c.cancel();
    });

    processor.run(shutdown).await;
    info!("converge agent stopped");
    Ok(())
}
