//! Failure / recovery notifications (fire-and-forget from the engine's side).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::TaskKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAlert {
    pub workspace_id: Uuid,
    pub task_name: String,
    pub task_type: TaskKind,
    pub error: Option<String>,
    pub consecutive_failures: u32,
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    fn name(&self) -> &str;

    async fn send_failure(&self, alert: &FailureAlert) -> Result<()>;

    async fn send_recovery(&self, alert: &FailureAlert) -> Result<()>;
}
