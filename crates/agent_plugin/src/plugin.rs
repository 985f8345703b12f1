use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::{PluginConfiguration, PluginOutput};

/// A unit of work that a command document step can invoke by capability name.
///
/// Handlers should watch `cancel` for long running work; the agent will not
/// interrupt a handler that ignores it, it only stops starting new ones.
#[async_trait]
pub trait PluginHandler: Send + Sync + 'static {
    /// The capability name documents use to address this handler.
    fn capability(&self) -> &str;

    async fn execute(
        &self,
        config: &PluginConfiguration,
        cancel: &CancellationToken,
    ) -> Result<PluginOutput, PluginError>;
}

/// Errors that a plugin handler can return.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// The step inputs were not what the handler expects.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The step ran longer than its timeout.
    #[error("operation timed out after {0} s")]
    Timeout(u64),

    /// The handler observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,

    /// The handler returned an unspecified failure.
    #[error("plugin error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::InvalidInput(err.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Other(err.to_string())
    }
}
