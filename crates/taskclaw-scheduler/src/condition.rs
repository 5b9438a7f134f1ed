//! Step conditions, evaluated against the previous executed step's response.

use regex::Regex;
use serde_json::Value;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::types::{ConditionOperator, StepCondition, StepResult};

/// Whether a step should run. No condition means run; evaluation errors mean skip.
pub fn is_met(condition: Option<&StepCondition>, previous: Option<&StepResult>) -> bool {
    let Some(condition) = condition else {
        return true;
    };
    match evaluate(condition, previous) {
        Ok(met) => met,
        Err(e) => {
            tracing::warn!("⚠️ {e}, treating condition as not met");
            false
        }
    }
}

pub fn evaluate(condition: &StepCondition, previous: Option<&StepResult>) -> Result<bool> {
    let status = previous.and_then(|p| p.status_code);
    match condition.operator {
        ConditionOperator::StatusCodeIn => {
            let codes = status_codes(&condition.value)?;
            Ok(status.is_some_and(|s| codes.contains(&s)))
        }
        ConditionOperator::StatusCodeNotIn => {
            let codes = status_codes(&condition.value)?;
            Ok(status.is_none_or(|s| !codes.contains(&s)))
        }
        ConditionOperator::StatusCodeEquals => match status_codes(&condition.value)?.as_slice() {
            [code] => Ok(status == Some(*code)),
            _ => Err(TaskClawError::ConditionEvaluation(
                "status_code_equals expects a single status code".into(),
            )),
        },
        ConditionOperator::Equals => Ok(resolve(condition, previous)?.is_some_and(|v| loose_eq(&v, &condition.value))),
        ConditionOperator::NotEquals => Ok(!resolve(condition, previous)?.is_some_and(|v| loose_eq(&v, &condition.value))),
        ConditionOperator::Contains => Ok(contains(resolve(condition, previous)?.as_ref(), &condition.value)),
        ConditionOperator::NotContains => Ok(!contains(resolve(condition, previous)?.as_ref(), &condition.value)),
        ConditionOperator::Regex => {
            let pattern = condition.value.as_str().ok_or_else(|| {
                TaskClawError::ConditionEvaluation("regex condition needs a string pattern".into())
            })?;
            let re = Regex::new(pattern)
                .map_err(|e| TaskClawError::ConditionEvaluation(format!("invalid regex '{pattern}': {e}")))?;
            Ok(resolve(condition, previous)?.is_some_and(|v| re.is_match(&text(&v))))
        }
        ConditionOperator::Exists => Ok(resolve(condition, previous)?.is_some_and(|v| !v.is_null())),
        ConditionOperator::NotExists => Ok(!resolve(condition, previous)?.is_some_and(|v| !v.is_null())),
    }
}

fn status_codes(value: &Value) -> Result<Vec<u16>> {
    let one = |v: &Value| -> Result<u16> {
        let code = match v {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        code.ok_or_else(|| TaskClawError::ConditionEvaluation(format!("not a status code: {v}")))
    };
    match value {
        Value::Array(items) => items.iter().map(one).collect(),
        other => Ok(vec![one(other)?]),
    }
}

/// The value a field condition looks at: a JSONPath match in the body, or the
/// whole body when no field is given.
fn resolve(condition: &StepCondition, previous: Option<&StepResult>) -> Result<Option<Value>> {
    let Some(previous) = previous else {
        return Ok(None);
    };
    let Some(path) = condition.field.as_deref() else {
        return Ok(Some(Value::String(previous.body.clone())));
    };
    let Ok(json) = serde_json::from_str::<Value>(&previous.body) else {
        return Ok(None);
    };
    let matches = jsonpath_lib::select(&json, path)
        .map_err(|e| TaskClawError::ConditionEvaluation(format!("invalid JSONPath '{path}': {e:?}")))?;
    Ok(match matches.as_slice() {
        [] => None,
        [single] => Some((*single).clone()),
        many => Some(Value::Array(many.iter().map(|v| (*v).clone()).collect())),
    })
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON equality, or equal textual forms (`"200"` equals `200`).
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    actual == expected || text(actual) == text(expected)
}

fn contains(actual: Option<&Value>, needle: &Value) -> bool {
    match actual {
        None => false,
        Some(Value::Array(items)) => items.iter().any(|item| loose_eq(item, needle)),
        Some(other) => text(other).contains(&text(needle)),
    }
}
