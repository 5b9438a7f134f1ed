//! Cron expression handling and next-fire computation.
//! Accepts "MIN HOUR DOM MON DOW" (5-field) or 6-field expressions with seconds,
//! evaluated in the task's IANA timezone and returned in UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

use crate::error::{Result, TaskClawError};
use crate::types::Schedule;

/// The `cron` crate wants a leading seconds field; plain Unix cron fires at second 0.
fn normalize_expression(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

fn parse_timezone(timezone: &str) -> Result<Tz> {
    if timezone.trim().is_empty() {
        return Ok(Tz::UTC);
    }
    Tz::from_str(timezone.trim())
        .map_err(|_| TaskClawError::InvalidSchedule(format!("unknown timezone '{timezone}'")))
}

fn parse_expression(expression: &str) -> Result<::cron::Schedule> {
    let fields = expression.split_whitespace().count();
    if !(5..=7).contains(&fields) {
        return Err(TaskClawError::InvalidSchedule(format!(
            "'{expression}' needs 5 fields: MIN HOUR DOM MON DOW"
        )));
    }
    ::cron::Schedule::from_str(&normalize_expression(expression))
        .map_err(|e| TaskClawError::InvalidSchedule(format!("'{expression}': {e}")))
}

/// Next fire time strictly after `after`, computed in `timezone`.
pub fn next_run_from_cron(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_expression(expression)?;
    let tz = parse_timezone(timezone)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| TaskClawError::InvalidSchedule(format!("'{expression}' never fires again")))
}

/// Validate a cron expression + timezone pair.
pub fn validate_cron(expression: &str, timezone: &str) -> Result<()> {
    parse_expression(expression)?;
    parse_timezone(timezone)?;
    Ok(())
}

/// Where `next_run_at` goes after a run claimed at `now`.
/// `None` means the schedule is exhausted (one-shot) and the definition deactivates.
pub fn next_fire(schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Cron { expression, timezone } => {
            next_run_from_cron(expression, timezone, now).map(Some)
        }
        Schedule::At { .. } => Ok(None),
    }
}

/// Initial `next_run_at` for a freshly created definition.
pub fn first_fire(schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Cron { .. } => next_fire(schedule, now),
        Schedule::At { execute_at } => Ok(Some(*execute_at)),
    }
}
