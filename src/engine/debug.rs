use std::time::Duration;

use agent_plugin::{CancellationToken, PluginConfiguration, PluginError, PluginHandler, PluginOutput};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// A simple plugin for testing that echoes its inputs.
///
/// Inputs it understands:
/// * `fail: true` makes the step fail.
/// * `delayMs` sleeps before answering; cancellation cuts the sleep short.
/// * `exitCode` reports a non-zero exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugPlugin;

#[async_trait]
impl PluginHandler for DebugPlugin {
    fn capability(&self) -> &str {
        "debug"
    }

    #[tracing::instrument(name = "debug_plugin_execute", skip(self, config, cancel), fields(plugin = %config.plugin_name))]
    async fn execute(
        &self,
        config: &PluginConfiguration,
        cancel: &CancellationToken,
    ) -> Result<PluginOutput, PluginError> {
        info!("**** DEBUG ****: inputs {}", config.inputs);

        if let Some(ms) = config.input_u64("delayMs") {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = cancel.cancelled() => return Err(PluginError::Cancelled),
            }
        }

        if config.input_bool("fail") == Some(true) {
            return Err(PluginError::Other(format!("step `{}` asked to fail", config.plugin_name)));
        }

        let exit_code = config
            .inputs
            .get("exitCode")
            .and_then(|v| v.as_i64())
            .map(|c| c as i32)
            .unwrap_or(0);
        Ok(PluginOutput {
            exit_code,
            output: json!({ "plugin": config.plugin_name, "inputs": config.inputs }),
        })
    }
}
