//! Lookup and task results published by the worker.

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::ALL_LOOKUPS_FAILED;
use crate::types::task::{RecordType, Task};

/// Outcome of resolving one record type.
///
/// `records` is empty whenever `error` is set. The two causes of an error
/// are told apart by `chaos_injected`, never by the message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    /// The record type that was resolved.
    pub record_type: RecordType,

    /// Resolver output lines in output order, trimmed, empty lines dropped.
    pub records: Vec<String>,

    /// Wall time of this lookup.
    #[serde(rename = "duration_ms", with = "crate::types::duration_ms")]
    pub duration: Duration,

    /// Failure description, if the lookup failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the failure was synthesized by chaos mode.
    #[serde(default)]
    pub chaos_injected: bool,
}

impl LookupResult {
    /// A successful lookup.
    pub fn success(record_type: RecordType, records: Vec<String>, duration: Duration) -> Self {
        Self {
            record_type,
            records,
            duration,
            error: None,
            chaos_injected: false,
        }
    }

    /// A lookup that failed in the external resolver.
    pub fn failure(record_type: RecordType, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            record_type,
            records: Vec::new(),
            duration,
            error: Some(error.into()),
            chaos_injected: false,
        }
    }

    /// A synthetic failure injected by chaos mode.
    pub fn chaos(record_type: RecordType, duration: Duration) -> Self {
        Self {
            chaos_injected: true,
            ..Self::failure(record_type, crate::constants::CHAOS_ERROR_MESSAGE, duration)
        }
    }

    /// Returns `true` if this lookup carries a non-empty error.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Aggregate status of a processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// At least one lookup succeeded.
    Success,
    /// Every lookup failed.
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Result of one task at one worker location, published once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the source task.
    pub task_id: String,
    /// Trace id of the source task.
    pub trace_id: String,
    /// Location of the worker that produced this result.
    pub location: String,
    /// Resolved domain.
    pub domain: String,
    /// `failed` iff every lookup errored.
    pub status: ResultStatus,
    /// One entry per requested record type, in request order.
    pub records: IndexMap<RecordType, LookupResult>,
    /// Set to a summary when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total wall time spent on the task.
    #[serde(rename = "processing_time_ms", with = "crate::types::duration_ms")]
    pub processing_time: Duration,
}

impl TaskResult {
    /// Builds the result of `task` from its lookups, deriving the status.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use indexmap::IndexMap;
    /// use dns_worker::{LookupResult, RecordType, ResultStatus, Task, TaskResult};
    ///
    /// let task = Task::new("example.com", vec![RecordType::A]);
    /// let mut records = IndexMap::new();
    /// records.insert(
    ///     RecordType::A,
    ///     LookupResult::failure(RecordType::A, "dig command failed", Duration::ZERO),
    /// );
    ///
    /// let result = TaskResult::from_lookups(&task, "eu-west-1", records, Duration::ZERO);
    /// assert_eq!(result.status, ResultStatus::Failed);
    /// assert_eq!(result.error.as_deref(), Some("All DNS lookups failed"));
    /// ```
    pub fn from_lookups(
        task: &Task,
        location: &str,
        records: IndexMap<RecordType, LookupResult>,
        processing_time: Duration,
    ) -> Self {
        let all_failed = records.values().all(LookupResult::is_error);
        let (status, error) = if all_failed {
            (ResultStatus::Failed, Some(ALL_LOOKUPS_FAILED.to_string()))
        } else {
            (ResultStatus::Success, None)
        };
        Self {
            task_id: task.task_id.clone(),
            trace_id: task.trace_id.clone(),
            location: location.to_string(),
            domain: task.domain.clone(),
            status,
            records,
            error,
            processing_time,
        }
    }
}
