//! External worker pull queue: push on dispatch, pull on poll, take on report.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{TaskRef, WorkUnit};

#[async_trait]
pub trait WorkerQueue: Send + Sync {
    /// Push a unit onto the worker's pull queue.
    async fn enqueue(&self, worker_id: Uuid, unit: &WorkUnit) -> Result<()>;

    /// Hand out up to `max` pending units, oldest first. Polled units stay
    /// in flight until `take` removes them.
    async fn poll(&self, worker_id: Uuid, max: usize) -> Result<Vec<WorkUnit>>;

    /// Remove an in-flight (or still pending) unit when its result arrives.
    /// Only the worker the unit was handed to can take it; any other
    /// `worker_id` sees `None`.
    async fn take(&self, worker_id: Uuid, unit_id: Uuid) -> Result<Option<WorkUnit>>;

    /// Remove every unit of `target`, polled or not. Used when the stale
    /// sweep gives up on the target's running instances.
    async fn drain_target(&self, target: TaskRef) -> Result<Vec<WorkUnit>>;

    /// Units not yet polled by the worker.
    async fn pending(&self, worker_id: Uuid) -> Result<usize>;
}
