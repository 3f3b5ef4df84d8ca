//! In-process [`StreamLog`] with consumer-group semantics.
//!
//! [`InMemoryStream`] keeps one shared entry log per stream and, next to it,
//! any number of independent subscriptions. Each subscription owns a cursor
//! (`last_delivered`) set to the stream tail at the moment the subscription
//! is created, plus its own pending-entry table. Publishing once therefore
//! reaches every subscription that existed at publish time and none created
//! afterwards.
//!
//! Ids are `{seq}-0` with `seq` starting at 1, so they sort like Redis ids.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use dns_worker::stream::{InMemoryStream, StreamLog};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let log = InMemoryStream::new();
//! log.ensure_subscription("tasks", "workers-a").await.unwrap();
//! log.append("tasks", "{}").await.unwrap();
//!
//! let batch = log
//!     .read_new("tasks", "workers-a", "consumer-a", 10, Duration::ZERO)
//!     .await
//!     .unwrap();
//! assert_eq!(batch.len(), 1);
//! assert_eq!(log.pending_count("tasks", "workers-a"), 1);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{StreamError, StreamLog};
use crate::types::{Envelope, EnvelopeId};

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    last_seq: u64,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug)]
struct StoredEntry {
    seq: u64,
    payload: String,
}

#[derive(Debug)]
struct SubscriptionState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct PendingEntry {
    reader: String,
    deliveries: u32,
}

fn envelope_id(seq: u64) -> EnvelopeId {
    EnvelopeId::new(format!("{seq}-0"))
}

fn parse_seq(id: &EnvelopeId) -> Option<u64> {
    id.as_str().split('-').next()?.parse().ok()
}

/// Thread-safe in-memory stream log.
#[derive(Debug, Default)]
pub struct InMemoryStream {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    unavailable: AtomicBool,
}

impl InMemoryStream {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (`false`) or regaining (`true`) the log. While
    /// unavailable every operation fails with [`StreamError::Backend`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of entries ever appended to `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Returns `true` if `stream` has no entries.
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// All entries of `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<Envelope> {
        self.streams.lock().get(stream).map_or_else(Vec::new, |s| {
            s.entries
                .iter()
                .map(|e| Envelope::new(envelope_id(e.seq), e.payload.clone()))
                .collect()
        })
    }

    /// Number of delivered-but-unacknowledged entries of a subscription,
    /// across all of its readers.
    pub fn pending_count(&self, stream: &str, subscription: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.subscriptions.get(subscription))
            .map_or(0, |sub| sub.pending.len())
    }

    /// How many times an entry has been handed out on a subscription, or
    /// `None` if it is not pending there.
    pub fn delivery_count(&self, stream: &str, subscription: &str, id: &EnvelopeId) -> Option<u32> {
        let seq = parse_seq(id)?;
        self.streams
            .lock()
            .get(stream)?
            .subscriptions
            .get(subscription)?
            .pending
            .get(&seq)
            .map(|p| p.deliveries)
    }

    fn check_available(&self) -> Result<(), StreamError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StreamError::backend("in-memory log is unavailable"))
        } else {
            Ok(())
        }
    }

    fn no_such_subscription(stream: &str, subscription: &str) -> StreamError {
        StreamError::NoSuchSubscription {
            stream: stream.to_string(),
            subscription: subscription.to_string(),
        }
    }

    /// Moves up to `count` undelivered entries into `reader`'s pending set.
    fn deliver_new(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        count: usize,
    ) -> Result<Vec<Envelope>, StreamError> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_subscription(stream, subscription))?;
        let StreamState {
            entries,
            subscriptions,
            ..
        } = state;
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Self::no_such_subscription(stream, subscription))?;

        let start = entries.partition_point(|e| e.seq <= sub.last_delivered);
        let batch: Vec<Envelope> = entries[start..]
            .iter()
            .take(count)
            .map(|e| {
                sub.pending.insert(
                    e.seq,
                    PendingEntry {
                        reader: reader.to_string(),
                        deliveries: 1,
                    },
                );
                sub.last_delivered = e.seq;
                Envelope::new(envelope_id(e.seq), e.payload.clone())
            })
            .collect();
        Ok(batch)
    }
}

#[async_trait]
impl StreamLog for InMemoryStream {
    async fn ensure_subscription(
        &self,
        stream: &str,
        subscription: &str,
    ) -> Result<(), StreamError> {
        self.check_available()?;
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let tail = state.last_seq;
        state
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| SubscriptionState {
                last_delivered: tail,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_pending(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        after: Option<&EnvelopeId>,
        count: usize,
    ) -> Result<Vec<Envelope>, StreamError> {
        self.check_available()?;
        // Unparsable cursors start from the head; sequences begin at 1.
        let lower = after.map_or(Bound::Unbounded, |id| {
            Bound::Excluded(parse_seq(id).unwrap_or(0))
        });
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_subscription(stream, subscription))?;
        let StreamState {
            entries,
            subscriptions,
            ..
        } = state;
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Self::no_such_subscription(stream, subscription))?;

        let mut batch = Vec::new();
        for (seq, pending) in sub.pending.range_mut((lower, Bound::Unbounded)) {
            if batch.len() >= count {
                break;
            }
            if pending.reader != reader {
                continue;
            }
            let Ok(idx) = entries.binary_search_by_key(seq, |e| e.seq) else {
                continue;
            };
            pending.deliveries += 1;
            batch.push(Envelope::new(
                envelope_id(*seq),
                entries[idx].payload.clone(),
            ));
        }
        Ok(batch)
    }

    async fn read_new(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, StreamError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            self.check_available()?;
            // Register interest before looking, so an append between the
            // look and the wait still wakes us.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.deliver_new(stream, subscription, reader, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(
        &self,
        stream: &str,
        subscription: &str,
        id: &EnvelopeId,
    ) -> Result<(), StreamError> {
        self.check_available()?;
        let Some(seq) = parse_seq(id) else {
            return Ok(());
        };
        if let Some(sub) = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|s| s.subscriptions.get_mut(subscription))
        {
            sub.pending.remove(&seq);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<EnvelopeId, StreamError> {
        self.check_available()?;
        let seq = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.last_seq += 1;
            let seq = state.last_seq;
            state.entries.push(StoredEntry {
                seq,
                payload: payload.to_string(),
            });
            seq
        };
        self.appended.notify_waiters();
        Ok(envelope_id(seq))
    }

    async fn ping(&self) -> Result<(), StreamError> {
        self.check_available()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
