//! TaskClaw configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskClawError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskClawConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl TaskClawConfig {
    /// Load config from `TASKCLAW_CONFIG` or the default path (~/.taskclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("TASKCLAW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskClawError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskClawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for container deployments.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TASKCLAW_DATABASE_URL") {
            if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                self.database.backend = "postgres".into();
            }
            self.database.url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.database.backend.as_str() {
            "sqlite" | "postgres" => {}
            other => {
                return Err(TaskClawError::Config(format!(
                    "Unknown database backend '{other}' (expected sqlite or postgres)"
                )));
            }
        }
        if self.scheduler.worker_pool_size == 0 {
            return Err(TaskClawError::Config("scheduler.worker_pool_size must be at least 1".into()));
        }
        if self.scheduler.claim_limit == 0 {
            return Err(TaskClawError::Config("scheduler.claim_limit must be at least 1".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskclaw")
    }
}

/// Persistence backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// "sqlite" (single scheduler) or "postgres" (multiple replicas).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_backend() -> String { "sqlite".into() }
fn default_database_url() -> String { "~/.taskclaw/taskclaw.db".into() }
fn default_max_connections() -> u32 { 10 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Scheduler loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Max definitions claimed per kind per tick.
    #[serde(default = "default_claim_limit")]
    pub claim_limit: u32,
    /// Concurrent local executions.
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Appears in logs to tell replicas apart.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

fn default_tick_interval() -> u64 { 5 }
fn default_claim_limit() -> u32 { 100 }
fn default_pool_size() -> usize { 16 }
fn default_sweep_interval() -> u64 { 30 }
fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "scheduler".into())
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            claim_limit: default_claim_limit(),
            worker_pool_size: default_pool_size(),
            sweep_interval_secs: default_sweep_interval(),
            instance_id: default_instance_id(),
        }
    }
}

/// Outbound probe client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Response bodies are truncated to this many bytes in execution records.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default = "default_ping_binary")]
    pub ping_binary: String,
}

fn default_user_agent() -> String { "TaskClaw/1.0".into() }
fn default_max_response_bytes() -> usize { 64 * 1024 }
fn default_ping_binary() -> String { "ping".into() }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_response_bytes: default_max_response_bytes(),
            ping_binary: default_ping_binary(),
        }
    }
}

/// Failure/recovery notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Empty = log-only notifications.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_headers: BTreeMap<String, String>,
    /// Consecutive failures before the failure alert fires.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_failure_threshold() -> u32 { 1 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            webhook_headers: BTreeMap::new(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Worker protocol gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required in `X-Worker-Token` when set.
    #[serde(default)]
    pub worker_token: Option<String>,
}

fn bool_true() -> bool { true }
fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3100 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            worker_token: None,
        }
    }
}
