use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::info;

use crate::association::{AgentInfo, ProcessorSettings, StopPolicy};
use crate::retry::RetryPolicy;

/// Source of raw settings. Read-only: the agent never writes its config back.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed settings, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self { map: DashMap::new() })
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let mgr = Self::new();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        mgr
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub const INSTANCE_IDS: &str = "CONVERGE_INSTANCE_IDS";
pub const ENDPOINT: &str = "CONVERGE_ENDPOINT";
pub const STATE_DIR: &str = "CONVERGE_STATE_DIR";
pub const POLL_INTERVAL_SECS: &str = "CONVERGE_POLL_INTERVAL_SECS";
pub const TICK_TIMEOUT_SECS: &str = "CONVERGE_TICK_TIMEOUT_SECS";
pub const SHUTDOWN_GRACE_SECS: &str = "CONVERGE_SHUTDOWN_GRACE_SECS";
pub const MAX_CONCURRENT_ASSOCIATIONS: &str = "CONVERGE_MAX_CONCURRENT_ASSOCIATIONS";
pub const STOP_POLICY_THRESHOLD: &str = "CONVERGE_STOP_POLICY_THRESHOLD";
pub const STOP_POLICY_COOLDOWN_SECS: &str = "CONVERGE_STOP_POLICY_COOLDOWN_SECS";
pub const PERSIST_RETRIES: &str = "CONVERGE_PERSIST_RETRIES";
pub const PERSIST_BACKOFF_MS: &str = "CONVERGE_PERSIST_BACKOFF_MS";
pub const COMPLETED_RETENTION_HOURS: &str = "CONVERGE_COMPLETED_RETENTION_HOURS";
pub const HTTP_TIMEOUT_SECS: &str = "CONVERGE_HTTP_TIMEOUT_SECS";

/// Typed agent settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub instance_ids: Vec<String>,
    pub endpoint: Option<String>,
    pub state_dir: PathBuf,
    pub poll_interval: Duration,
    pub tick_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_associations: usize,
    pub stop_policy_threshold: u32,
    /// Zero disables the half-open trial call.
    pub stop_policy_cooldown: Duration,
    pub persist_retries: u32,
    pub persist_backoff: Duration,
    pub completed_retention: Duration,
    pub http_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_ids: Vec::new(),
            endpoint: None,
            state_dir: PathBuf::from("./converge/state"),
            poll_interval: Duration::from_secs(300),
            tick_timeout: Duration::from_secs(900),
            shutdown_grace: Duration::from_secs(10),
            max_concurrent_associations: 4,
            stop_policy_threshold: 10,
            stop_policy_cooldown: Duration::from_secs(600),
            persist_retries: 3,
            persist_backoff: Duration::from_millis(200),
            completed_retention: Duration::from_secs(72 * 3600),
            http_timeout: Duration::from_secs(30),
        }
    }
}

async fn parsed<T>(config: &ConfigManager, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match config.get(key).await {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

async fn positive(config: &ConfigManager, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = parsed(config, key, default).await?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

impl AgentConfig {
    /// Reads every setting, falling back to defaults for absent keys.
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let instance_ids = config
            .get(INSTANCE_IDS)
            .await
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let endpoint = config.get(ENDPOINT).await.filter(|s| !s.trim().is_empty());
        let state_dir = config
            .get(STATE_DIR)
            .await
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        Ok(Self {
            instance_ids,
            endpoint,
            state_dir,
            poll_interval: Duration::from_secs(positive(config, POLL_INTERVAL_SECS, 300).await?),
            tick_timeout: Duration::from_secs(positive(config, TICK_TIMEOUT_SECS, 900).await?),
            shutdown_grace: Duration::from_secs(parsed(config, SHUTDOWN_GRACE_SECS, 10).await?),
            max_concurrent_associations: positive(config, MAX_CONCURRENT_ASSOCIATIONS, 4).await? as usize,
            stop_policy_threshold: positive(config, STOP_POLICY_THRESHOLD, 10).await? as u32,
            stop_policy_cooldown: Duration::from_secs(parsed(config, STOP_POLICY_COOLDOWN_SECS, 600).await?),
            persist_retries: positive(config, PERSIST_RETRIES, 3).await? as u32,
            persist_backoff: Duration::from_millis(parsed(config, PERSIST_BACKOFF_MS, 200).await?),
            completed_retention: Duration::from_secs(parsed(config, COMPLETED_RETENTION_HOURS, 72u64).await? * 3600),
            http_timeout: Duration::from_secs(positive(config, HTTP_TIMEOUT_SECS, 30).await?),
        })
    }

    /// Settings the `run` command cannot do without.
    pub fn require_run_settings(&self) -> Result<&str, ConfigError> {
        if self.instance_ids.is_empty() {
            return Err(ConfigError::Missing(INSTANCE_IDS));
        }
        self.endpoint.as_deref().ok_or(ConfigError::Missing(ENDPOINT))
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            instance_ids: self.instance_ids.clone(),
            poll_interval: self.poll_interval,
            tick_timeout: self.tick_timeout,
            shutdown_grace: self.shutdown_grace,
            max_concurrent_associations: self.max_concurrent_associations,
            completed_retention: self.completed_retention,
            persist_retry: RetryPolicy::new(self.persist_retries, self.persist_backoff),
            agent_info: AgentInfo::default(),
        }
    }

    /// The breaker guarding status reports to the configured endpoint.
    pub fn stop_policy(&self) -> StopPolicy {
        let name = self.endpoint.clone().unwrap_or_else(|| "control-plane".into());
        let policy = StopPolicy::new(name, self.stop_policy_threshold);
        if self.stop_policy_cooldown.is_zero() {
            policy
        } else {
            policy.with_cooldown(self.stop_policy_cooldown)
        }
    }
}
