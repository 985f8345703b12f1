//! Plugin execution engine: runs the pending plugins of a command.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agent_plugin::{CancellationToken, PluginConfiguration, PluginError, PluginHandler, PluginResult};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::PluginState;

pub mod debug;
pub mod registry;

pub use registry::PluginRegistry;

/// A single plugin result, streamed while the command is still running.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginReply {
    pub document_id: String,
    pub result: PluginResult,
}

pub type SendReply = mpsc::UnboundedSender<PluginReply>;

#[async_trait]
pub trait PluginExecution: Send + Sync {
    /// Runs the plugins of one command in order and returns the results of
    /// the plugins it ran, keyed by plugin name.
    ///
    /// Admission stops at the first plugin already marked executed, and when
    /// `cancel` is set; plugins not admitted get no result.
    async fn run_plugins(
        &self,
        document_id: &str,
        plugins: &[PluginState],
        registry: &PluginRegistry,
        send_reply: Option<SendReply>,
        cancel: &CancellationToken,
    ) -> HashMap<String, PluginResult>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn PluginExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginExecution").field("impl", &self.name()).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Engine;

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

async fn execute_one(
    handler: Arc<dyn PluginHandler>,
    config: &PluginConfiguration,
    cancel: &CancellationToken,
) -> PluginResult {
    let started_at = Utc::now();
    let outcome = match config.timeout_seconds {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), handler.execute(config, cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PluginError::Timeout(secs)),
        },
        None => handler.execute(config, cancel).await,
    };
    PluginResult::from_outcome(config, started_at, outcome)
}

#[async_trait]
impl PluginExecution for Engine {
    #[tracing::instrument(name = "run_plugins", skip(self, plugins, registry, send_reply, cancel))]
    async fn run_plugins(
        &self,
        document_id: &str,
        plugins: &[PluginState],
        registry: &PluginRegistry,
        send_reply: Option<SendReply>,
        cancel: &CancellationToken,
    ) -> HashMap<String, PluginResult> {
        let mut results = HashMap::new();
        for state in plugins {
            if state.has_executed {
                debug!(plugin = %state.name, "plugin already executed, not admitting further plugins");
                break;
            }
            if cancel.is_cancelled() {
                info!(plugin = %state.name, "cancelled before plugin start");
                break;
            }

            let config = &state.configuration;
            let result = match registry.get(&config.capability) {
                Some(handler) => execute_one(handler, config, cancel).await,
                None => {
                    warn!(plugin = %state.name, capability = %config.capability, "no handler registered");
                    PluginResult::unresolved(config)
                }
            };
            debug!(plugin = %state.name, status = ?result.status, "plugin finished");

            if let Some(tx) = &send_reply {
                let reply = PluginReply {
                    document_id: document_id.to_string(),
                    result: result.clone(),
                };
                if tx.send(reply).is_err() {
                    debug!("reply receiver dropped");
                }
            }
            results.insert(state.name.clone(), result);
        }
        results
    }

    fn name(&self) -> &'static str {
        "Engine"
    }
}
