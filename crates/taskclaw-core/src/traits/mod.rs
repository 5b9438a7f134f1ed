//! Boundary traits between the engine and its collaborators.

pub mod notify;
pub mod store;
pub mod tenant;
pub mod worker;

pub use notify::{FailureAlert, NotificationService};
pub use store::{
    ClaimedChain, ClaimedTask, Enqueued, ExecutionLog, OutcomeUpdate, SlotGrant, SlotRelease, StaleInstance,
    TaskStore,
};
pub use tenant::TenantGate;
pub use worker::WorkerQueue;
