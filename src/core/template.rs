//! `{{placeholder}}` rendering for sources and product identifiers.
//!
//! Placeholders resolve against a [`Params`] mapping. Lookup supports one
//! level of dotted access (`{{upstream.extract}}`) into object values.
//! Rendering is strict both ways: a placeholder with no matching param is
//! an error, and a param that no placeholder consumed is an error unless
//! its key is listed as optional.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use super::params::Params;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)?)\s*\}\}").unwrap());

/// Errors raised while rendering a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A placeholder references a param that does not exist.
    #[error("missing value for placeholder '{{{{{0}}}}}'")]
    MissingPlaceholder(String),

    /// A dotted placeholder indexes into a value that is not an object.
    #[error("placeholder '{{{{{0}}}}}' indexes into a non-object value")]
    NotAnObject(String),

    /// Params were passed that the template never used.
    #[error("params passed but not used by the template: {}", .unused.join(", "))]
    UnusedParams { unused: Vec<String> },
}

/// Render `template` against `params`.
///
/// `optional` names params that are allowed to go unused (typically the
/// engine-injected `product` and `upstream` keys, which not every template
/// references).
pub fn render(template: &str, params: &Params, optional: &[&str]) -> Result<String, TemplateError> {
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut missing: Option<TemplateError> = None;

    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = &caps[1];
        match lookup(params, path) {
            Ok(value) => {
                let root = path.split('.').next().unwrap_or(path);
                used.insert(root.to_string());
                value_to_text(&value)
            }
            Err(err) => {
                if missing.is_none() {
                    missing = Some(err);
                }
                String::new()
            }
        }
    });

    if let Some(err) = missing {
        return Err(err);
    }

    let unused: Vec<String> = params
        .keys()
        .filter(|k| !used.contains(k.as_str()) && !optional.contains(&k.as_str()))
        .map(|k| k.to_string())
        .collect();
    if !unused.is_empty() {
        return Err(TemplateError::UnusedParams { unused });
    }

    Ok(rendered.into_owned())
}

/// Render without the unused-params check.
///
/// Product identifiers typically reference only a subset of the task's
/// params, so unlike sources they are not validated for full usage.
pub fn render_partial(template: &str, params: &Params) -> Result<String, TemplateError> {
    let mut missing: Option<TemplateError> = None;

    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = &caps[1];
        match lookup(params, path) {
            Ok(value) => value_to_text(&value),
            Err(err) => {
                if missing.is_none() {
                    missing = Some(err);
                }
                String::new()
            }
        }
    });

    match missing {
        Some(err) => Err(err),
        None => Ok(rendered.into_owned()),
    }
}

fn lookup(params: &Params, path: &str) -> Result<Value, TemplateError> {
    let mut parts = path.splitn(2, '.');
    let root = parts.next().unwrap_or(path);
    let rest = parts.next();

    let value = params
        .get(root)
        .ok_or_else(|| TemplateError::MissingPlaceholder(path.to_string()))?;

    match rest {
        None => Ok(value.clone()),
        Some(key) => match value {
            Value::Object(map) => map
                .get(key)
                .cloned()
                .ok_or_else(|| TemplateError::MissingPlaceholder(path.to_string())),
            _ => Err(TemplateError::NotAnObject(path.to_string())),
        },
    }
}

/// Strings render bare; everything else renders as its JSON text.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
