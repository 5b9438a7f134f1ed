//! # TaskClaw Core
//!
//! Shared data model, boundary traits, configuration and error types for the
//! TaskClaw scheduler workspace.

pub mod config;
pub mod error;
pub mod schedule;
pub mod traits;
pub mod types;

pub use config::TaskClawConfig;
pub use error::{AdmissionDenial, Result, TaskClawError};
