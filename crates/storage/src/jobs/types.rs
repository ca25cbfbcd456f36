//! Job payload and read-model types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobvault_core::JobId;

use crate::error::StorageResult;
use crate::schema::StateRecord;

/// Invocation descriptor: the method a job will execute and its arguments.
///
/// The engine never interprets it; it only stores the encoded form and hands
/// it back. Resolution of `type_name`/`method` to code is the job framework's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub type_name: String,
    pub method: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<JsonValue>,
}

impl Invocation {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            parameter_types: Vec::new(),
            arguments: Vec::new(),
        }
    }

    /// Append an argument together with its declared parameter type.
    pub fn with_arg(mut self, parameter_type: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.parameter_types.push(parameter_type.into());
        self.arguments.push(value.into());
        self
    }

    /// Encode for storage.
    pub fn encode(&self) -> StorageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored payload.
    ///
    /// Besides malformed JSON this rejects descriptors whose argument list does
    /// not match their declared parameter types.
    pub fn decode(payload: &str) -> Result<Self, LoadError> {
        let invocation: Invocation = serde_json::from_str(payload)
            .map_err(|e| LoadError::new(format!("invalid invocation payload: {e}")))?;

        if invocation.type_name.trim().is_empty() || invocation.method.trim().is_empty() {
            return Err(LoadError::new("invocation has no type or method"));
        }
        if invocation.arguments.len() != invocation.parameter_types.len() {
            return Err(LoadError::new(format!(
                "{}.{} declares {} parameters but carries {} arguments",
                invocation.type_name,
                invocation.method,
                invocation.parameter_types.len(),
                invocation.arguments.len()
            )));
        }

        Ok(invocation)
    }

    /// Deserialize argument `index` into `T`.
    pub fn argument<T: DeserializeOwned>(&self, index: usize) -> Result<T, LoadError> {
        let value = self
            .arguments
            .get(index)
            .ok_or_else(|| LoadError::new(format!("no argument at index {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| LoadError::new(format!("argument {index}: {e}")))
    }
}

/// Why a stored invocation could not be reconstructed.
///
/// Captured on [`JobData`] instead of being raised, so listings and monitoring
/// keep working for jobs whose payload is no longer understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Job as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobData {
    pub id: JobId,
    /// `None` iff `load_error` is set.
    pub invocation: Option<Invocation>,
    pub load_error: Option<LoadError>,
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// A state entry as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateData {
    pub name: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub data: BTreeMap<String, String>,
}

impl From<&StateRecord> for StateData {
    fn from(record: &StateRecord) -> Self {
        Self {
            name: record.name.clone(),
            reason: record.reason.clone(),
            created_at: record.created_at,
            data: record.data.clone(),
        }
    }
}

/// A state transition to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewState {
    pub name: String,
    pub reason: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl NewState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}
