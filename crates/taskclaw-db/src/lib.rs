//! # TaskClaw DB
//!
//! Persistence backends behind the core store traits.
//! - `sqlite`: one scheduler process (or tests), write-locked transactions
//! - `postgres`: several replicas, `SKIP LOCKED` claims and a durable worker queue

pub mod codec;
pub mod postgres;
pub mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use std::path::PathBuf;
use std::sync::Arc;

use taskclaw_core::config::DatabaseConfig;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::traits::{ExecutionLog, TaskStore, TenantGate, WorkerQueue};

/// One backend seen through each of the traits the scheduler consumes.
#[derive(Clone)]
pub struct StoreHandles {
    pub backend: &'static str,
    pub tasks: Arc<dyn TaskStore>,
    pub executions: Arc<dyn ExecutionLog>,
    pub tenants: Arc<dyn TenantGate>,
    /// Durable worker queue when the backend has one.
    pub workers: Option<Arc<dyn WorkerQueue>>,
}

impl StoreHandles {
    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        Self {
            backend: "sqlite",
            tasks: store.clone(),
            executions: store.clone(),
            tenants: store,
            workers: None,
        }
    }

    pub fn postgres(store: Arc<PgStore>) -> Self {
        Self {
            backend: "postgres",
            tasks: store.clone(),
            executions: store.clone(),
            tenants: store.clone(),
            workers: Some(store),
        }
    }
}

/// Open the configured backend and bring its schema up to date.
pub async fn connect(config: &DatabaseConfig) -> Result<StoreHandles> {
    match config.backend.as_str() {
        "sqlite" => {
            let path = PathBuf::from(shellexpand::tilde(&config.url).to_string());
            let store = SqliteStore::open(&path)?;
            tracing::info!("🗄️ SQLite store at {}", path.display());
            Ok(StoreHandles::sqlite(Arc::new(store)))
        }
        "postgres" => {
            let store = PgStore::connect(&config.url, config.max_connections).await?;
            store.migrate().await?;
            Ok(StoreHandles::postgres(Arc::new(store)))
        }
        other => Err(TaskClawError::Config(format!("Unknown database backend '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_sqlite_backend() {
        let dir = std::env::temp_dir().join(format!("taskclaw-connect-{}", uuid::Uuid::new_v4()));
        let config = DatabaseConfig {
            backend: "sqlite".into(),
            url: dir.join("t.db").to_string_lossy().to_string(),
            max_connections: 1,
        };
        let handles = connect(&config).await.unwrap();
        assert_eq!(handles.backend, "sqlite");
        assert!(handles.workers.is_none());
        assert!(!handles.tenants.is_blocked(uuid::Uuid::new_v4()).await.unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_backend() {
        let config = DatabaseConfig {
            backend: "redis".into(),
            ..Default::default()
        };
        assert!(matches!(connect(&config).await, Err(TaskClawError::Config(_))));
    }
}
