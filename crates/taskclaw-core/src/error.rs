//! Error types for TaskClaw.

use crate::types::ProbeErrorKind;

/// Why an admission attempt did not produce a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenial {
    /// Overlap policy is SKIP and every instance slot is taken.
    Skip,
    /// Overlap policy is QUEUE and the bounded queue is full.
    QueueFull,
}

impl std::fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionDenial::Skip => write!(f, "skip"),
            AdmissionDenial::QueueFull => write!(f, "queue_full"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskClawError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Variable '{name}' is not defined")]
    VariableSubstitution { name: String },

    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    #[error("Step execution failed ({kind}): {message}")]
    StepExecution { kind: ProbeErrorKind, message: String },

    #[error("Admission denied: {0}")]
    AdmissionDenied(AdmissionDenial),

    #[error("Stale instance: {0}")]
    StaleInstance(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl TaskClawError {
    /// Short machine-readable tag stored in `error_type` columns.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskClawError::Database(_) => "database",
            TaskClawError::Config(_) => "config",
            TaskClawError::Io(_) => "io",
            TaskClawError::Serialization(_) => "serialization",
            TaskClawError::NotFound(_) => "not_found",
            TaskClawError::InvalidSchedule(_) => "invalid_schedule",
            TaskClawError::VariableSubstitution { .. } => "variable_substitution",
            TaskClawError::ConditionEvaluation(_) => "condition_evaluation",
            TaskClawError::StepExecution { kind, .. } => kind.as_str(),
            TaskClawError::AdmissionDenied(_) => "admission_denied",
            TaskClawError::StaleInstance(_) => "stale_instance",
            TaskClawError::Worker(_) => "worker",
            TaskClawError::Http(_) => "http",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskClawError>;
