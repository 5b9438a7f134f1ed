//! # TaskClaw Scheduler
//!
//! The scheduling-and-execution engine.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval)
//!   ├── DueTaskSelector: claim due tasks + chains (claim-with-skip)
//!   ├── OverlapGuard: admit → ALLOW / SKIP / QUEUED(n) / QUEUE_FULL
//!   ├── Dispatcher
//!   │     ├── local pool → StepExecutor (task) | ChainExecutor (chain)
//!   │     └── worker_id → WorkerQueue → poll / report_result
//!   ├── on completion → record_outcome → OverlapGuard::release → promote queued
//!   └── stale sweep → reset leaked running_instances → promote queued
//! ```

pub mod chain;
pub mod condition;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod overlap;
pub mod recorder;
pub mod selector;
pub mod step;
pub mod variables;
pub mod worker_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{ChainExecutor, derive_status};
pub use dispatch::{Dispatcher, WorkItem};
pub use engine::{ChainRunOutcome, EngineServices, SchedulerEngine, SweepReport, TickReport};
pub use notify::{LogNotifier, WebhookNotifier, notifier_from_config};
pub use overlap::{Admission, OverlapGuard};
pub use recorder::{DEFAULT_BODY_LIMIT, ExecutionRecorder};
pub use selector::{DueBatch, DueTaskSelector};
pub use step::{StepExecutor, StepRunner};
pub use worker_queue::{MemoryWorkerQueue, WorkerQueueStats};
