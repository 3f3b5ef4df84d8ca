//! Reliable broadcast consumption over an append-only stream.
//!
//! The [`StreamLog`] trait is the contract between the worker loop and the
//! log. It models consumer groups the way Redis Streams does:
//!
//! - A **stream** is an append-only sequence of [`Envelope`]s.
//! - A **subscription** is a named cursor over one stream plus the set of
//!   entries delivered to its readers but not yet acknowledged ("pending").
//! - Every worker location owns its own subscription over the shared task
//!   stream, so every location sees every task (broadcast, not a
//!   competing-consumer split).
//!
//! Delivery is at-least-once: an entry stays pending for its reader until
//! acked, and a restarted reader gets it back from
//! [`read_pending`](StreamLog::read_pending).
//!
//! # Implementations
//!
//! - [`memory::InMemoryStream`] - in-process log for tests and local runs
//! - [`redis::RedisStream`] - Redis Streams consumer groups (`redis` feature)

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::constants::READER_PREFIX;
use crate::types::{Envelope, EnvelopeId};

pub use memory::InMemoryStream;

/// Errors returned by a [`StreamLog`].
///
/// A blocking read that times out is **not** an error; it returns an empty
/// batch.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The subscription was never created on this stream.
    #[error("subscription {subscription} does not exist on stream {stream}")]
    NoSuchSubscription {
        /// Stream name.
        stream: String,
        /// Subscription name.
        subscription: String,
    },

    /// A record could not be serialized for publishing.
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Connection, protocol or backend-specific failure.
    #[error("stream backend error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
        /// Underlying error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StreamError {
    /// Builds a [`StreamError::Backend`] without an underlying source.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

/// Append-only log with named subscriptions.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the health surface pings the
/// same instance the worker loop consumes from.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Creates `subscription` on `stream` positioned at the current tail,
    /// creating the stream if needed. Succeeds without changes if the
    /// subscription already exists.
    ///
    /// # Errors
    ///
    /// [`StreamError::Backend`] for any failure other than "already exists".
    async fn ensure_subscription(&self, stream: &str, subscription: &str)
        -> Result<(), StreamError>;

    /// Returns up to `count` entries delivered to `reader` and not yet
    /// acknowledged, oldest first. With `after`, only entries whose id sorts
    /// after it are returned, so callers can page through the pending list.
    /// Never blocks.
    async fn read_pending(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        after: Option<&EnvelopeId>,
        count: usize,
    ) -> Result<Vec<Envelope>, StreamError>;

    /// Waits up to `block` for entries never delivered on this subscription
    /// and returns up to `count` of them, now pending for `reader`. Returns
    /// an empty batch on timeout.
    async fn read_new(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, StreamError>;

    /// Marks an entry processed for this subscription. Acking an unknown or
    /// already-acked id is a no-op.
    async fn ack(&self, stream: &str, subscription: &str, id: &EnvelopeId)
        -> Result<(), StreamError>;

    /// Appends a payload and returns the id the log assigned to it.
    async fn append(&self, stream: &str, payload: &str) -> Result<EnvelopeId, StreamError>;

    /// Checks connectivity.
    async fn ping(&self) -> Result<(), StreamError>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Serializes `record` as JSON and appends it to `stream`.
pub async fn publish<L, T>(log: &L, stream: &str, record: &T) -> Result<EnvelopeId, StreamError>
where
    L: StreamLog + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = Envelope::encode(record)?;
    log.append(stream, &payload).await
}

/// Where one worker location reads its tasks from.
///
/// Each location gets its own subscription name, derived from the location,
/// over the shared task stream.
///
/// # Examples
///
/// ```
/// use dns_worker::stream::Subscription;
///
/// let sub = Subscription::for_location("dns:tasks", "workers", "eu-west-1");
/// assert_eq!(sub.name, "workers-eu-west-1");
/// assert_eq!(sub.reader, "consumer-eu-west-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Task stream name.
    pub stream: String,
    /// Subscription (consumer group) name.
    pub name: String,
    /// Reader (consumer) id within the subscription.
    pub reader: String,
}

impl Subscription {
    /// Derives the subscription of `location` over `stream`.
    pub fn for_location(stream: &str, prefix: &str, location: &str) -> Self {
        Self {
            stream: stream.to_string(),
            name: format!("{prefix}-{location}"),
            reader: format!("{READER_PREFIX}-{location}"),
        }
    }
}
