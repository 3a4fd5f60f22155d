use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;
use crate::{
    DEFAULT_BASE_BACKOFF_SECS, DEFAULT_CANCEL_GRACE_SECS, DEFAULT_MAX_BACKOFF_SECS,
    DEFAULT_STALE_AFTER_SECS,
};

/// Which queue backend a worker/reaper/deployer talks to (`queue.backend`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Sql,
    Kv,
    Amqp,
    Pubsub,
}

/// `queue.<backend>` connection details. Only the section matching
/// `queue.backend` is required to be populated; the others are simply
/// unused if present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct SqlBackendConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct KvBackendConfig {
    pub host: String,
    pub port: u16,
    pub keyspace: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct AmqpBackendConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct PubsubBackendConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub backend: QueueBackendKind,
    #[serde(default)]
    pub sql: SqlBackendConfig,
    #[serde(default)]
    pub kv: KvBackendConfig,
    #[serde(default)]
    pub amqp: AmqpBackendConfig,
    #[serde(default)]
    pub pubsub: PubsubBackendConfig,
}

/// `worker.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub kinds: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace: u64,
}

fn default_max_concurrent() -> u32 {
    4
}
fn default_poll_interval() -> u64 {
    2
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_job_timeout() -> u64 {
    300
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_progress_interval() -> u64 {
    crate::DEFAULT_PROGRESS_INTERVAL_SECS
}
fn default_cancel_grace() -> u64 {
    DEFAULT_CANCEL_GRACE_SECS
}

/// `retry.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_base_backoff")]
    pub base_backoff: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_base_backoff() -> u64 {
    DEFAULT_BASE_BACKOFF_SECS
}
fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}
fn default_jitter_fraction() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

/// `reaper.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReaperConfig {
    #[serde(default = "default_stale_after")]
    pub stale_after: u64,
    #[serde(default = "default_reaper_interval")]
    pub interval: u64,
    #[serde(default)]
    pub embedded: bool,
}

fn default_stale_after() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}
fn default_reaper_interval() -> u64 {
    60
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            interval: default_reaper_interval(),
            embedded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// `logging.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: LoggingLevel,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
}

fn default_log_level() -> LoggingLevel {
    LoggingLevel::Info
}
fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}

/// A deployer host entry (`hosts:`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HostConfig {
    pub host: String,
    pub user: String,
    pub key_path: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// The single top-level configuration document. Unknown
/// top-level keys are rejected via `deny_unknown_fields`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub queue: BackendConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl Config {
    /// Parses and validates a YAML configuration document from disk.
    /// Unknown keys anywhere in the document are rejected (`serde`'s
    /// `deny_unknown_fields` surfaces them as `ConfigError::Parse`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.kinds.is_empty() {
            return Err(ConfigError::Invalid(
                "worker.kinds must declare at least one job kind".to_string(),
            ));
        }
        if self.worker.max_concurrent < 1 {
            return Err(ConfigError::Invalid(
                "worker.maxConcurrent must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
queue:
  backend: sql
  sql:
    host: localhost
    port: 5432
    database: fintask
    user: fintask
    password: secret
worker:
  kinds: [price_update]
logging:
  file: /var/log/fintask/worker.log
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse(MINIMAL_YAML).expect("parses");
        assert_eq!(config.queue.backend, QueueBackendKind::Sql);
        assert_eq!(config.worker.max_concurrent, 4);
        assert_eq!(config.retry.base_backoff, DEFAULT_BASE_BACKOFF_SECS);
        assert_eq!(config.reaper.stale_after, DEFAULT_STALE_AFTER_SECS);
        assert_eq!(config.logging.level, LoggingLevel::Info);
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let yaml = format!("{MINIMAL_YAML}\nbogus_section: {{}}\n");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_empty_worker_kinds() {
        let yaml = MINIMAL_YAML.replace("kinds: [price_update]", "kinds: []");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
