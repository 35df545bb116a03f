//! Coordinator-side keystore.
//!
//! A flat map from string keys to arbitrary JSON values, mutated only by the
//! coordinator's dispatch loop. Values carry no schema; each action decides
//! how to interpret what is stored:
//!
//! | action | absent key | wrong shape |
//! |--------|------------|-------------|
//! | `get`  | `null`     | -           |
//! | `set`  | created    | overwritten |
//! | `inc`  | starts at 0 | error, value kept |
//! | `push` | new list   | error, value kept |
//! | `pop`  | `null`     | error, value kept |
//! | `del`  | `null`     | -           |

use crate::protocol::{KeystoreAction, KeystoreResponse, Request};
use serde_json::Value;
use std::collections::HashMap;
use tracing::error;

/// Authoritative key/value state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Keystore {
    entries: HashMap<String, Value>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Apply one keystore request and build its reply.
    ///
    /// A missing `key` is checked before the action; any error leaves the
    /// stored state untouched.
    pub fn handle(&mut self, request: &Request) -> KeystoreResponse {
        let Some(key) = request.key.as_deref() else {
            let message = "key is not present in request";
            error!("{}", message);
            return KeystoreResponse::error(request, message);
        };

        let action = request.action.as_deref().and_then(KeystoreAction::from_str);
        let result = match action {
            Some(KeystoreAction::Get) => Ok(self.entries.get(key).cloned().unwrap_or(Value::Null)),
            Some(KeystoreAction::Set) => self.set(key, request.data.clone()),
            Some(KeystoreAction::Inc) => self.inc(key, request.data.as_ref()),
            Some(KeystoreAction::Push) => self.push(key, request.data.clone().unwrap_or(Value::Null)),
            Some(KeystoreAction::Pop) => self.pop(key),
            Some(KeystoreAction::Del) => {
                self.entries.remove(key);
                Ok(Value::Null)
            }
            None => Err(format!(
                "received unknown keystore action \"{}\"",
                request.action.as_deref().unwrap_or_default()
            )),
        };

        match result {
            Ok(data) => KeystoreResponse::success(request, data),
            Err(message) => {
                error!("{}", message);
                KeystoreResponse::error(request, message)
            }
        }
    }

    fn set(&mut self, key: &str, value: Option<Value>) -> Result<Value, String> {
        let value = value.ok_or_else(|| format!("no value to set for key \"{}\"", key))?;
        self.entries.insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn inc(&mut self, key: &str, step: Option<&Value>) -> Result<Value, String> {
        let step = match step {
            None | Some(Value::Null) => 1,
            Some(step) => step
                .as_i64()
                .ok_or_else(|| format!("step {} for key \"{}\" is not an integer", step, key))?,
        };

        let current = match self.entries.get(key) {
            None => 0,
            Some(value) => as_integer(value).ok_or_else(|| {
                format!("value {} for key \"{}\" cannot be incremented", value, key)
            })?,
        };

        let next = current
            .checked_add(step)
            .ok_or_else(|| format!("incrementing key \"{}\" by {} overflows", key, step))?;

        self.entries.insert(key.to_string(), Value::from(next));
        Ok(Value::from(next))
    }

    fn push(&mut self, key: &str, value: Value) -> Result<Value, String> {
        match self.entries.get_mut(key) {
            None => {
                self.entries
                    .insert(key.to_string(), Value::Array(vec![value.clone()]));
            }
            Some(Value::Array(list)) => list.push(value.clone()),
            Some(_) => return Err(format!("key \"{}\" is not a list, cannot push to it", key)),
        }
        Ok(value)
    }

    fn pop(&mut self, key: &str) -> Result<Value, String> {
        match self.entries.get_mut(key) {
            None => Ok(Value::Null),
            Some(Value::Array(list)) if list.is_empty() => Ok(Value::Null),
            Some(Value::Array(list)) => Ok(list.remove(0)),
            Some(_) => Err(format!(
                "key \"{}\" is not a list, it has not been pushed to",
                key
            )),
        }
    }
}

/// Integer view of a stored value: an integer number or a numeric string.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}
