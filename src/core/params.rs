//! Task parameters.
//!
//! [`Params`] is a read-only-to-callers mapping from name to JSON value.
//! Callers assemble it up front with [`Params::with`]; after that, exactly
//! two keys may be injected, and only by the engine: `product` (the task's
//! own rendered product) and `upstream` (a map from upstream task name to
//! that task's product). Nothing else mutates once render has begun.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Key under which the task's own rendered product is injected.
pub const PRODUCT_KEY: &str = "product";

/// Key under which upstream products are injected.
pub const UPSTREAM_KEY: &str = "upstream";

/// Errors that can occur when assembling params.
#[derive(Debug, Error)]
pub enum ParamsError {
    /// The caller tried to pre-set an engine-reserved key.
    #[error("param key '{0}' is reserved for the engine")]
    ReservedKey(String),

    /// A restored snapshot payload was not a JSON object.
    #[error("params snapshot must be a JSON object, got: {0}")]
    InvalidSnapshot(Value),
}

/// Named values passed into a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    values: BTreeMap<String, Value>,
}

impl Params {
    /// Create an empty params mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user-supplied value, rejecting engine-reserved keys.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self, ParamsError> {
        let key = key.into();
        if key == PRODUCT_KEY || key == UPSTREAM_KEY {
            return Err(ParamsError::ReservedKey(key));
        }
        self.values.insert(key, value.into());
        Ok(self)
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Check whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate over the keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The full mapping as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Inject the task's own rendered product. Engine-only insertion point.
    pub(crate) fn set_product(&mut self, product: Value) {
        self.values.insert(PRODUCT_KEY.to_string(), product);
    }

    /// Inject the upstream product mapping. Engine-only insertion point.
    pub(crate) fn set_upstream(&mut self, upstream: Value) {
        self.values.insert(UPSTREAM_KEY.to_string(), upstream);
    }

    /// Replace the whole mapping from a captured snapshot payload.
    ///
    /// Reserved keys are allowed here: an injected `product`/`upstream` is
    /// part of the captured state.
    pub(crate) fn restore(&mut self, snapshot: Value) -> Result<(), ParamsError> {
        match snapshot {
            Value::Object(map) => {
                self.values = map.into_iter().collect();
                Ok(())
            }
            other => Err(ParamsError::InvalidSnapshot(other)),
        }
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}
