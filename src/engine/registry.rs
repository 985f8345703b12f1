//! PluginRegistry: maps capability names to plugin handlers.
use std::fmt;
use std::sync::Arc;

use agent_plugin::PluginHandler;
use dashmap::DashMap;
use tracing::debug;

use super::debug::DebugPlugin;

/// Thread-safe registry of plugin handlers, keyed by `capability()`.
#[derive(Default)]
pub struct PluginRegistry {
    handlers: DashMap<String, Arc<dyn PluginHandler>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry").field("capabilities", &self.list()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A registry holding the built-in plugins.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::default();
        registry.register(Arc::new(DebugPlugin));
        Arc::new(registry)
    }

    /// Registers a handler under its capability. An existing handler with the
    /// same capability is replaced and returned.
    pub fn register(&self, handler: Arc<dyn PluginHandler>) -> Option<Arc<dyn PluginHandler>> {
        let capability = handler.capability().to_string();
        debug!(%capability, "registering plugin");
        self.handlers.insert(capability, handler)
    }

    /// Removes a handler. Unknown names are ignored.
    pub fn unregister(&self, capability: &str) -> Option<Arc<dyn PluginHandler>> {
        self.handlers.remove(capability).map(|(_, handler)| handler)
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn PluginHandler>> {
        self.handlers.get(capability).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered capability names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_plugin::{CancellationToken, PluginConfiguration, PluginError, PluginOutput};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct Named(&'static str, Value);

    #[async_trait]
    impl PluginHandler for Named {
        fn capability(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _config: &PluginConfiguration,
            _cancel: &CancellationToken,
        ) -> Result<PluginOutput, PluginError> {
            Ok(PluginOutput::new(self.1.clone()))
        }
    }

    #[test]
    fn test_builtins_present() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["debug".to_string()]);
        assert!(registry.get("debug").is_some());
        assert!(registry.get("shell").is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_and_unregister() {
        let registry = PluginRegistry::new();
        assert!(registry.register(Arc::new(Named("x", json!(1)))).is_none());
        assert!(registry.register(Arc::new(Named("x", json!(2)))).is_some());

        let cfg = PluginConfiguration::new("s", "x", json!({}));
        let handler = registry.get("x").unwrap();
        let out = handler.execute(&cfg, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.output, json!(2));

        assert!(registry.unregister("x").is_some());
        assert!(registry.unregister("x").is_none());
        assert!(registry.list().is_empty());
    }
}
