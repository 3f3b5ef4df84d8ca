//! The on-stream wire unit and its decode step.
//!
//! Every stream entry carries one serialized record in its `data` field.
//! [`Envelope::decode_task`] is the only place a payload turns into a
//! [`Task`]; anything that fails there is a poison message and takes the
//! drop path in the worker.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::task::Task;

/// Log-assigned entry id. Opaque, monotonic within one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Wraps a log-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as sent by the log.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EnvelopeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Why a payload could not be turned into a [`Task`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The entry had no payload field, or it was empty.
    #[error("envelope has no payload")]
    EmptyPayload,

    /// The payload is not valid task JSON.
    #[error("payload is not a valid task: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload parsed but breaks a task invariant.
    #[error("task rejected: {0}")]
    Invalid(String),
}

/// One stream entry: its id and its serialized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Log-assigned id.
    pub id: EnvelopeId,
    /// Serialized record.
    pub payload: String,
}

impl Envelope {
    /// Creates an envelope.
    pub fn new(id: impl Into<EnvelopeId>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Serializes a record into a payload string.
    pub fn encode<T: Serialize + ?Sized>(record: &T) -> Result<String, serde_json::Error> {
        serde_json::to_string(record)
    }

    /// Decodes the payload into a validated [`Task`].
    ///
    /// # Errors
    ///
    /// - [`DecodeError::EmptyPayload`] if the payload is blank.
    /// - [`DecodeError::Json`] if it is not task JSON.
    /// - [`DecodeError::Invalid`] if the task has no record types or an
    ///   unusable domain.
    pub fn decode_task(&self) -> Result<Task, DecodeError> {
        if self.payload.trim().is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        let task: Task = serde_json::from_str(&self.payload)?;
        task.normalize().map_err(DecodeError::Invalid)
    }
}
