//! Column codecs shared by the SQLite and PostgreSQL stores.

use chrono::{DateTime, SecondsFormat, Utc};
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::types::{ChainStatus, ExecutionStatus, OverlapPolicy, StepStatus, TaskKind, TaskRef};
use uuid::Uuid;

/// Fixed-width UTC timestamps so that TEXT comparison orders chronologically.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| TaskClawError::Database(format!("bad timestamp '{s}': {e}")))
}

pub fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| TaskClawError::Database(format!("bad uuid '{s}': {e}")))
}

pub fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>> {
    s.as_deref().map(parse_uuid).transpose()
}

pub fn policy(s: &str) -> Result<OverlapPolicy> {
    OverlapPolicy::parse(s).ok_or_else(|| TaskClawError::Database(format!("unknown overlap policy '{s}'")))
}

pub fn kind(s: &str) -> Result<TaskKind> {
    TaskKind::parse(s).ok_or_else(|| TaskClawError::Database(format!("unknown task kind '{s}'")))
}

pub fn chain_status(s: &str) -> Result<ChainStatus> {
    ChainStatus::parse(s).ok_or_else(|| TaskClawError::Database(format!("unknown chain status '{s}'")))
}

pub fn step_status(s: &str) -> Result<StepStatus> {
    StepStatus::parse(s).ok_or_else(|| TaskClawError::Database(format!("unknown step status '{s}'")))
}

pub fn execution_status(s: &str) -> Result<ExecutionStatus> {
    ExecutionStatus::parse(s).ok_or_else(|| TaskClawError::Database(format!("unknown execution status '{s}'")))
}

/// Table owning `running_instances` for a target.
pub fn owner_table(target: TaskRef) -> &'static str {
    if target.is_chain() { "chains" } else { "tasks" }
}

/// Counters are stored signed; negative values never leave the store.
pub fn to_u32(v: i64) -> u32 {
    v.clamp(0, u32::MAX as i64) as u32
}

pub fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

/// PostgreSQL has no unsigned integer columns.
pub fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

pub fn not_found(target: TaskRef) -> TaskClawError {
    TaskClawError::NotFound(format!("{target}"))
}
