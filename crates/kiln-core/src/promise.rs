//! Promises: references to another job's result embedded in JSON values.
//!
//! A promise is encoded as `{"$promise": "<job id>"}`. Scanning descends into
//! arrays and objects, except for `{"$raw": ...}` wrappers, which are opaque and
//! are unwrapped when arguments are resolved.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::{JobId, Result};

pub const PROMISE_KEY: &str = "$promise";
pub const RAW_KEY: &str = "$raw";

/// A typed reference to the future result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Promise {
    #[serde(rename = "$promise")]
    job_id: JobId,
}

impl Promise {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Decode a promise if `value` is exactly a promise object.
    pub fn from_value(value: &Value) -> Option<JobId> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        obj.get(PROMISE_KEY)
            .and_then(Value::as_str)
            .map(JobId::from)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Value::from(&promise)
    }
}

impl From<&Promise> for Value {
    fn from(promise: &Promise) -> Self {
        let mut obj = Map::new();
        obj.insert(
            PROMISE_KEY.to_string(),
            Value::String(promise.job_id.to_string()),
        );
        Value::Object(obj)
    }
}

/// Wrap a value so it is never scanned for promises.
pub fn raw(value: Value) -> Value {
    let mut obj = Map::new();
    obj.insert(RAW_KEY.to_string(), value);
    Value::Object(obj)
}

fn raw_inner(value: &Value) -> Option<&Value> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(RAW_KEY)
}

/// Collect every job referenced by a promise inside `value`.
pub fn collect_promises(value: &Value) -> BTreeSet<JobId> {
    let mut found = BTreeSet::new();
    collect_into(value, &mut found);
    found
}

fn collect_into(value: &Value, found: &mut BTreeSet<JobId>) {
    if let Some(job_id) = Promise::from_value(value) {
        found.insert(job_id);
        return;
    }
    if raw_inner(value).is_some() {
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_into(v, found)),
        Value::Object(obj) => obj.values().for_each(|v| collect_into(v, found)),
        _ => {}
    }
}

/// Replace every promise in `value` by the value `resolve` returns for it.
///
/// `$raw` wrappers are unwrapped and their content is left untouched.
pub fn substitute_promises<F>(value: &Value, resolve: &mut F) -> Result<Value>
where
    F: FnMut(&JobId) -> Result<Value>,
{
    if let Some(job_id) = Promise::from_value(value) {
        return resolve(&job_id);
    }
    if let Some(inner) = raw_inner(value) {
        return Ok(inner.clone());
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_promises(v, resolve))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k.clone(), substitute_promises(v, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
