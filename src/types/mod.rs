//! Wire types exchanged over the task and result streams.
//!
//! - [`task`] - [`Task`] and [`RecordType`], produced by the coordinator
//! - [`result`] - [`LookupResult`] and [`TaskResult`], produced by the worker
//! - [`envelope`] - the on-stream [`Envelope`] and its single decode step

pub mod envelope;
pub mod result;
pub mod task;

pub use envelope::{DecodeError, Envelope, EnvelopeId};
pub use result::{LookupResult, ResultStatus, TaskResult};
pub use task::{RecordType, Task};

/// Serde helper storing a [`std::time::Duration`] as floating-point milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid duration in milliseconds: {millis}"
            )));
        }
        Ok(Duration::from_secs_f64(millis / 1000.0))
    }
}
