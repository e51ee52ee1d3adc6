use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "scheduler.toml";
pub const DEFAULT_NAMESPACE: &str = "scheduler";
/// Env vars consulted (in order) when `store.url` is not set.
pub const STORE_URL_ENV_FALLBACKS: [&str; 2] = ["REDISCLOUD_URL", "REDIS_URL"];

/// Top-level config (scheduler.toml + SCHEDULER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `redis://` or `rediss://` connection URL.
    pub url: Option<String>,
    /// Prefix for every key; also the Redis Cluster hash tag.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// How long per-job result records are kept.
    #[serde(default = "default_result_retention")]
    pub result_retention_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: default_namespace(),
            result_retention_seconds: default_result_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_interval", alias = "pollIntervalSeconds")]
    pub poll_interval_seconds: u64,
    /// Upper bound on concurrently executing handlers in this instance.
    #[serde(default = "default_max_workers", alias = "maxWorkers")]
    pub max_workers: usize,
    #[serde(default = "default_lease", alias = "defaultLeaseSeconds")]
    pub default_lease_seconds: u64,
    #[serde(default = "default_max_retries", alias = "defaultMaxRetries")]
    pub default_max_retries: u32,
    /// Handler timeout for jobs that do not set their own.
    #[serde(default = "default_timeout")]
    pub default_timeout_seconds: u64,
    /// Added on top of a job's timeout when sizing its lease (~2x store RTT).
    #[serde(default = "default_lease_margin")]
    pub lease_margin_ms: u64,
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_seconds: u64,
    #[serde(default = "default_backoff_cap")]
    pub retry_backoff_cap_seconds: u64,
    /// Max due jobs fetched per poll.
    #[serde(default = "default_poll_batch")]
    pub poll_batch_size: usize,
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_seconds: u64,
    /// Stable identity of this process; generated when unset.
    pub instance_id: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            max_workers: default_max_workers(),
            default_lease_seconds: default_lease(),
            default_max_retries: default_max_retries(),
            default_timeout_seconds: default_timeout(),
            lease_margin_ms: default_lease_margin(),
            retry_backoff_base_seconds: default_backoff_base(),
            retry_backoff_cap_seconds: default_backoff_cap(),
            poll_batch_size: default_poll_batch(),
            recovery_interval_seconds: default_recovery_interval(),
            instance_id: None,
        }
    }
}

impl DispatchConfig {
    /// Configured instance id, or a fresh `sched-<uuid>`.
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("sched-{}", uuid::Uuid::new_v4()))
    }
}

/// Built-in liveness job run by the service binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_heartbeat_interval(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_result_retention() -> u64 {
    7 * 24 * 3600
}
fn default_poll_interval() -> u64 {
    1
}
fn default_max_workers() -> usize {
    16
}
fn default_lease() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout() -> u64 {
    20
}
fn default_lease_margin() -> u64 {
    2_000
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_cap() -> u64 {
    300
}
fn default_poll_batch() -> usize {
    100
}
fn default_recovery_interval() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    60
}

impl SchedulerConfig {
    /// Load config from a TOML file with SCHEDULER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. SCHEDULER_CONFIG
    ///   3. ./scheduler.toml
    ///
    /// A missing file just yields defaults. The store URL falls back to the
    /// REDISCLOUD_URL / REDIS_URL secrets when the file and env leave it unset.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("SCHEDULER_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        debug!(path = %path, "loading scheduler config");

        let mut config = Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("SCHEDULER_").split("__")),
        )?;

        if config.store.url.is_none() {
            config.store.url = STORE_URL_ENV_FALLBACKS.iter().find_map(|name| {
                let url = std::env::var(name).ok().filter(|url| !url.trim().is_empty())?;
                debug!(source = *name, "store url taken from environment");
                Some(url)
            });
        }

        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Reject values the dispatcher cannot run with. Called before the store
    /// is touched so a bad config never reaches the loop.
    pub fn validate(&self) -> Result<()> {
        let url = self.store.url.as_deref().ok_or(ConfigError::MissingStoreUrl)?;
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            return Err(ConfigError::Invalid {
                field: "store.url",
                reason: "expected a redis:// or rediss:// URL".to_string(),
            });
        }
        if self.store.namespace.is_empty() {
            return Err(invalid("store.namespace", "must not be empty"));
        }

        let d = &self.dispatch;
        if d.poll_interval_seconds == 0 {
            return Err(invalid("dispatch.poll_interval_seconds", "must be at least 1"));
        }
        if d.max_workers == 0 {
            return Err(invalid("dispatch.max_workers", "must be at least 1"));
        }
        if d.default_lease_seconds == 0 {
            return Err(invalid("dispatch.default_lease_seconds", "must be at least 1"));
        }
        if d.default_timeout_seconds == 0 {
            return Err(invalid("dispatch.default_timeout_seconds", "must be at least 1"));
        }
        if d.poll_batch_size == 0 {
            return Err(invalid("dispatch.poll_batch_size", "must be at least 1"));
        }
        if d.retry_backoff_cap_seconds < d.retry_backoff_base_seconds {
            return Err(invalid(
                "dispatch.retry_backoff_cap_seconds",
                "must not be below retry_backoff_base_seconds",
            ));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_seconds == 0 {
            return Err(invalid("heartbeat.interval_seconds", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> SchedulerConfig {
        SchedulerConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = from_toml("");
        assert_eq!(config.store.namespace, "scheduler");
        assert_eq!(config.dispatch.poll_interval_seconds, 1);
        assert_eq!(config.dispatch.max_workers, 16);
        assert_eq!(config.dispatch.default_lease_seconds, 30);
        assert_eq!(config.dispatch.default_max_retries, 3);
        assert!(config.heartbeat.enabled);
    }

    #[test]
    fn camel_case_option_names_are_recognised() {
        let config = from_toml(
            r#"
            [dispatch]
            pollIntervalSeconds = 5
            maxWorkers = 2
            defaultLeaseSeconds = 45
            defaultMaxRetries = 0
            "#,
        );
        assert_eq!(config.dispatch.poll_interval_seconds, 5);
        assert_eq!(config.dispatch.max_workers, 2);
        assert_eq!(config.dispatch.default_lease_seconds, 45);
        assert_eq!(config.dispatch.default_max_retries, 0);
    }

    #[test]
    fn missing_url_is_fatal() {
        let config = from_toml("");
        assert!(matches!(config.validate(), Err(ConfigError::MissingStoreUrl)));
    }

    #[test]
    fn non_redis_url_is_rejected() {
        let config = from_toml(
            r#"
            [store]
            url = "postgres://localhost/db"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "store.url", .. })
        ));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = from_toml(
            r#"
            [store]
            url = "redis://localhost:6379"
            [dispatch]
            max_workers = 0
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "dispatch.max_workers", .. })
        ));
    }

    #[test]
    fn valid_config_passes() {
        let config = from_toml(
            r#"
            [store]
            url = "rediss://user:pw@cache.example.com:6380"
            namespace = "prod"
            "#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.store.namespace, "prod");
    }

    #[test]
    fn explicit_instance_id_wins() {
        let mut config = SchedulerConfig::default();
        assert!(config.dispatch.resolve_instance_id().starts_with("sched-"));
        config.dispatch.instance_id = Some("worker-a".to_string());
        assert_eq!(config.dispatch.resolve_instance_id(), "worker-a");
    }
}
