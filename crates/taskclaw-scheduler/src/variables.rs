//! `{{name}}` substitution into request templates and JSONPath extraction
//! from response bodies.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::types::{HttpRequest, Variables};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern compiles"));

/// Replace every placeholder in `template`. Strings are inserted raw, other
/// values as compact JSON. An unknown name is an error.
pub fn substitute(template: &str, vars: &Variables) -> Result<String> {
    let mut missing: Option<String> = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(TaskClawError::VariableSubstitution { name }),
        None => Ok(rendered.into_owned()),
    }
}

/// Resolve URL, header values and body of a step request.
pub fn render_request(template: &HttpRequest, vars: &Variables) -> Result<HttpRequest> {
    let headers = template
        .headers
        .iter()
        .map(|(k, v)| Ok((k.clone(), substitute(v, vars)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(HttpRequest {
        method: template.method,
        url: substitute(&template.url, vars)?,
        headers,
        body: template.body.as_deref().map(|b| substitute(b, vars)).transpose()?,
    })
}

/// Pull named values out of a JSON body. Paths that match nothing are left
/// out; a body that is not JSON yields nothing.
pub fn extract(body: &str, paths: &BTreeMap<String, String>) -> Variables {
    let mut out = Variables::new();
    if paths.is_empty() {
        return out;
    }
    let json: Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(_) => {
            tracing::debug!("Response body is not JSON, nothing to extract");
            return out;
        }
    };
    for (name, path) in paths {
        match jsonpath_lib::select(&json, path) {
            Ok(matches) => match matches.as_slice() {
                [] => {}
                [single] => {
                    out.insert(name.clone(), (*single).clone());
                }
                many => {
                    out.insert(name.clone(), Value::Array(many.iter().map(|v| (*v).clone()).collect()));
                }
            },
            Err(e) => tracing::warn!("Invalid JSONPath '{}' for variable '{}': {:?}", path, name, e),
        }
    }
    out
}
