pub mod message;
pub mod plugin;

pub use message::{PluginConfiguration, PluginOutput, PluginResult, ResultStatus};
pub use plugin::{PluginError, PluginHandler};
pub use tokio_util::sync::CancellationToken;
