//! Control-plane configuration.
//!
//! Values come from `NIMBUS_*` environment variables with defaults suitable
//! for local development. When `NIMBUS_CP_CONFIG` points at a YAML file, the
//! fields present in that file override the environment.
use crate::retry::BackoffPolicy;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CHANGES_LIMIT: u64 = 1000;
pub const DEFAULT_WATCH_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_SCHEDULER_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_INSTANCE_QUOTA: i64 = 20;
const DEFAULT_PG_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_PG_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_PG_ACQUIRE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => bail!("unknown storage backend {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_pg_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_pg_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pg_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuotaConfig {
    /// Limit for instance types without an explicit entry.
    #[serde(default = "default_instance_quota")]
    pub default_limit: i64,
    #[serde(default)]
    pub per_instance_type: HashMap<String, i64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_INSTANCE_QUOTA,
            per_instance_type: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub bind_addr: SocketAddr,
    /// Listener for the private API. `None` leaves it unserved.
    pub private_bind: Option<SocketAddr>,
    pub metrics_bind: SocketAddr,
    pub region_id: String,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    /// Maximum rows returned by one change-feed poll.
    pub changes_limit: u64,
    pub watch_poll_interval_ms: u64,
    pub cas_retry: BackoffPolicy,
    pub scheduling_retry: BackoffPolicy,
    /// Without a URL instances must be created with explicit placement.
    pub scheduler_url: Option<String>,
    pub scheduler_timeout_ms: u64,
    pub quota: QuotaConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ControlPlaneConfigOverride {
    bind_addr: Option<String>,
    private_bind: Option<String>,
    metrics_bind: Option<String>,
    region_id: Option<String>,
    storage: Option<StorageBackend>,
    postgres: Option<PostgresConfig>,
    changes_limit: Option<u64>,
    watch_poll_interval_ms: Option<u64>,
    cas_retry: Option<BackoffPolicy>,
    scheduling_retry: Option<BackoffPolicy>,
    scheduler_url: Option<String>,
    scheduler_timeout_ms: Option<u64>,
    quota: Option<QuotaConfig>,
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = env_or("NIMBUS_CP_METRICS_BIND", "0.0.0.0:8080")
            .parse()
            .with_context(|| "parse NIMBUS_CP_METRICS_BIND")?;
        let bind_addr = env_or("NIMBUS_CP_BIND", "0.0.0.0:8443")
            .parse()
            .with_context(|| "parse NIMBUS_CP_BIND")?;
        let private_bind = parse_optional_addr(&env_or("NIMBUS_CP_PRIVATE_BIND", "127.0.0.1:8444"))
            .with_context(|| "parse NIMBUS_CP_PRIVATE_BIND")?;
        let region_id = env_or("NIMBUS_REGION_ID", "local");
        let storage = env_or("NIMBUS_CP_STORAGE", "memory").parse()?;
        let postgres = match std::env::var("NIMBUS_CP_DATABASE_URL") {
            Ok(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse(
                    "NIMBUS_CP_PG_MAX_CONNECTIONS",
                    DEFAULT_PG_MAX_CONNECTIONS,
                )?,
                connect_timeout_ms: env_parse(
                    "NIMBUS_CP_PG_CONNECT_TIMEOUT_MS",
                    DEFAULT_PG_CONNECT_TIMEOUT_MS,
                )?,
                acquire_timeout_ms: env_parse(
                    "NIMBUS_CP_PG_ACQUIRE_TIMEOUT_MS",
                    DEFAULT_PG_ACQUIRE_TIMEOUT_MS,
                )?,
            }),
            Err(_) => None,
        };
        let quota = QuotaConfig {
            default_limit: env_parse("NIMBUS_CP_DEFAULT_INSTANCE_QUOTA", DEFAULT_INSTANCE_QUOTA)?,
            per_instance_type: HashMap::new(),
        };
        Ok(Self {
            bind_addr,
            private_bind,
            metrics_bind,
            region_id,
            storage,
            postgres,
            changes_limit: env_parse("NIMBUS_CP_CHANGES_LIMIT", DEFAULT_CHANGES_LIMIT)?,
            watch_poll_interval_ms: env_parse(
                "NIMBUS_CP_WATCH_POLL_INTERVAL_MS",
                DEFAULT_WATCH_POLL_INTERVAL_MS,
            )?,
            cas_retry: BackoffPolicy::cas_default(),
            scheduling_retry: BackoffPolicy::scheduling_default(),
            scheduler_url: std::env::var("NIMBUS_CP_SCHEDULER_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            scheduler_timeout_ms: env_parse(
                "NIMBUS_CP_SCHEDULER_TIMEOUT_MS",
                DEFAULT_SCHEDULER_TIMEOUT_MS,
            )?,
            quota,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("NIMBUS_CP_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read NIMBUS_CP_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ControlPlaneConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse control plane config yaml")?;
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.private_bind {
            self.private_bind = parse_optional_addr(&value).with_context(|| "parse private_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.region_id {
            self.region_id = value;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value;
        }
        if let Some(value) = override_cfg.postgres {
            self.postgres = Some(value);
        }
        if let Some(value) = override_cfg.changes_limit {
            self.changes_limit = value;
        }
        if let Some(value) = override_cfg.watch_poll_interval_ms {
            self.watch_poll_interval_ms = value;
        }
        if let Some(value) = override_cfg.cas_retry {
            self.cas_retry = value;
        }
        if let Some(value) = override_cfg.scheduling_retry {
            self.scheduling_retry = value;
        }
        if let Some(value) = override_cfg.scheduler_url {
            self.scheduler_url = Some(value).filter(|url| !url.is_empty());
        }
        if let Some(value) = override_cfg.scheduler_timeout_ms {
            self.scheduler_timeout_ms = value;
        }
        if let Some(value) = override_cfg.quota {
            self.quota = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.changes_limit == 0 {
            bail!("changes_limit must be greater than zero");
        }
        if self.storage == StorageBackend::Postgres && self.postgres.is_none() {
            bail!("postgres storage selected but NIMBUS_CP_DATABASE_URL is not set");
        }
        Ok(())
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }
}

/// An empty value disables the listener.
fn parse_optional_addr(value: &str) -> Result<Option<SocketAddr>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(value.parse()?))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|err| anyhow::anyhow!("parse {key}: {err}")),
        Err(_) => Ok(default),
    }
}

fn default_pg_max_connections() -> u32 {
    DEFAULT_PG_MAX_CONNECTIONS
}

fn default_pg_connect_timeout_ms() -> u64 {
    DEFAULT_PG_CONNECT_TIMEOUT_MS
}

fn default_pg_acquire_timeout_ms() -> u64 {
    DEFAULT_PG_ACQUIRE_TIMEOUT_MS
}

fn default_instance_quota() -> i64 {
    DEFAULT_INSTANCE_QUOTA
}
