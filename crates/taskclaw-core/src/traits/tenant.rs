//! Tenant gate: blocked workspaces never get work claimed or promoted.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait TenantGate: Send + Sync {
    async fn is_blocked(&self, workspace_id: Uuid) -> Result<bool>;
}
