//! In-process worker pull queue for single-scheduler deployments.
//!
//! Units live in memory only; a restart forgets undelivered work, which the
//! stale sweep then recovers on the overlap counters.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use taskclaw_core::error::Result;
use taskclaw_core::traits::WorkerQueue;
use taskclaw_core::types::{TaskRef, WorkUnit};

#[derive(Default)]
struct QueueState {
    /// worker → units not yet polled, oldest first.
    pending: HashMap<Uuid, VecDeque<WorkUnit>>,
    /// Polled units awaiting a report.
    in_flight: HashMap<Uuid, WorkUnit>,
    total_enqueued: u64,
    total_reported: u64,
}

/// Queue stats snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerQueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub total_enqueued: u64,
    pub total_reported: u64,
}

#[derive(Default)]
pub struct MemoryWorkerQueue {
    state: Mutex<QueueState>,
}

impl MemoryWorkerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> WorkerQueueStats {
        let state = self.state.lock().await;
        WorkerQueueStats {
            pending: state.pending.values().map(VecDeque::len).sum(),
            in_flight: state.in_flight.len(),
            workers: state.pending.values().filter(|q| !q.is_empty()).count(),
            total_enqueued: state.total_enqueued,
            total_reported: state.total_reported,
        }
    }
}

#[async_trait]
impl WorkerQueue for MemoryWorkerQueue {
    async fn enqueue(&self, worker_id: Uuid, unit: &WorkUnit) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pending.entry(worker_id).or_default().push_back(unit.clone());
        state.total_enqueued += 1;
        tracing::debug!("📤 Unit {} queued for worker {}", unit.id, worker_id);
        Ok(())
    }

    async fn poll(&self, worker_id: Uuid, max: usize) -> Result<Vec<WorkUnit>> {
        let mut state = self.state.lock().await;
        let Some(queue) = state.pending.get_mut(&worker_id) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        let units: Vec<WorkUnit> = queue.drain(..take).collect();
        for unit in &units {
            state.in_flight.insert(unit.id, unit.clone());
        }
        Ok(units)
    }

    async fn take(&self, worker_id: Uuid, unit_id: Uuid) -> Result<Option<WorkUnit>> {
        let mut state = self.state.lock().await;
        let found = if state.in_flight.get(&unit_id).is_some_and(|u| u.worker_id == worker_id) {
            state.in_flight.remove(&unit_id)
        } else {
            state.pending.get_mut(&worker_id).and_then(|queue| {
                let idx = queue.iter().position(|u| u.id == unit_id)?;
                queue.remove(idx)
            })
        };
        if found.is_some() {
            state.total_reported += 1;
        }
        Ok(found)
    }

    async fn drain_target(&self, target: TaskRef) -> Result<Vec<WorkUnit>> {
        let mut state = self.state.lock().await;
        let mut drained: Vec<WorkUnit> = Vec::new();
        for queue in state.pending.values_mut() {
            let (dropped, kept): (VecDeque<WorkUnit>, VecDeque<WorkUnit>) =
                queue.drain(..).partition(|u| u.target == target);
            *queue = kept;
            drained.extend(dropped);
        }
        let expired: Vec<Uuid> = state
            .in_flight
            .values()
            .filter(|u| u.target == target)
            .map(|u| u.id)
            .collect();
        for id in expired {
            if let Some(unit) = state.in_flight.remove(&id) {
                drained.push(unit);
            }
        }
        Ok(drained)
    }

    async fn pending(&self, worker_id: Uuid) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.pending.get(&worker_id).map_or(0, VecDeque::len))
    }
}
