//! Redis Streams backend.
//!
//! [`RedisStream`] maps the [`StreamLog`] contract onto consumer groups:
//!
//! | Operation | Redis command |
//! |-----------|---------------|
//! | `ensure_subscription` | `XGROUP CREATE <stream> <group> $ MKSTREAM` |
//! | `read_pending` | `XREADGROUP GROUP <group> <consumer> COUNT n STREAMS <stream> <after or 0>` |
//! | `read_new` | `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >` |
//! | `ack` | `XACK <stream> <group> <id>` |
//! | `append` | `XADD <stream> * data <payload>` |
//! | `ping` | `PING` |
//!
//! # Connection Model
//!
//! A blocking `XREADGROUP` occupies its connection on the server side until
//! it returns, so blocking reads get their own [`MultiplexedConnection`].
//! Everything else (acks, appends, health pings) shares a second one and is
//! never queued behind a read.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, AsyncConnectionConfig, RedisError};
use async_trait::async_trait;

use super::{StreamError, StreamLog};
use crate::constants::PAYLOAD_FIELD;
use crate::types::{Envelope, EnvelopeId};

/// Extra response-timeout headroom on top of the longest blocking read.
const BLOCK_SLACK: Duration = Duration::from_secs(5);

/// [`StreamLog`] over Redis Streams consumer groups.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use dns_worker::stream::redis::RedisStream;
///
/// # async fn example() {
/// let log = RedisStream::connect("redis://127.0.0.1:6379", Duration::from_secs(60))
///     .await
///     .unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStream {
    reads: MultiplexedConnection,
    control: MultiplexedConnection,
    max_block: Duration,
}

impl std::fmt::Debug for RedisStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStream")
            .field("max_block", &self.max_block)
            .finish_non_exhaustive()
    }
}

impl RedisStream {
    /// Connects to Redis at `url`.
    ///
    /// `max_block` is the longest wait any [`read_new`](StreamLog::read_new)
    /// call will use; the read connection's response timeout is sized from
    /// it, and longer requested waits are clamped to it.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Backend`] if the URL is invalid or either
    /// connection cannot be established.
    pub async fn connect(url: &str, max_block: Duration) -> Result<Self, StreamError> {
        let client = ::redis::Client::open(url).map_err(|e| StreamError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;

        let read_config =
            AsyncConnectionConfig::new().set_response_timeout(Some(max_block + BLOCK_SLACK));
        let reads = client
            .get_multiplexed_async_connection_with_config(&read_config)
            .await
            .map_err(|e| StreamError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        let control = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StreamError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            reads,
            control,
            max_block,
        })
    }

    async fn read_group(
        &self,
        stream: &str,
        start: &str,
        options: &StreamReadOptions,
    ) -> Result<Vec<Envelope>, StreamError> {
        let mut conn = self.reads.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[start], options)
            .await
            .map_err(|e| map_redis_error(e, stream))?;
        Ok(reply.map(into_envelopes).unwrap_or_default())
    }
}

/// Flattens a read reply. Entries whose fields were trimmed away come back
/// with an empty payload, which the worker treats as undecodable.
fn into_envelopes(reply: StreamReadReply) -> Vec<Envelope> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|entry| {
            let payload: String = entry.get(PAYLOAD_FIELD).unwrap_or_default();
            Envelope::new(entry.id, payload)
        })
        .collect()
}

fn is_missing_group(err: &RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

/// Maps a Redis error to a [`StreamError::Backend`].
fn map_redis_error(err: RedisError, stream: &str) -> StreamError {
    StreamError::Backend {
        message: format!("Redis error on stream {stream}: {err}"),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl StreamLog for RedisStream {
    async fn ensure_subscription(
        &self,
        stream: &str,
        subscription: &str,
    ) -> Result<(), StreamError> {
        let mut conn = self.control.clone();
        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(stream, subscription, "$").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e, stream)),
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        after: Option<&EnvelopeId>,
        count: usize,
    ) -> Result<Vec<Envelope>, StreamError> {
        let options = StreamReadOptions::default()
            .group(subscription, reader)
            .count(count);
        let start = after.map_or("0", EnvelopeId::as_str);
        self.read_group(stream, start, &options)
            .await
            .map_err(|e| with_group_hint(e, stream, subscription))
    }

    async fn read_new(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, StreamError> {
        let mut options = StreamReadOptions::default()
            .group(subscription, reader)
            .count(count);
        // BLOCK 0 waits forever; a zero wait means "do not block at all".
        let block_ms = block.min(self.max_block).as_millis();
        if block_ms > 0 {
            options = options.block(usize::try_from(block_ms).unwrap_or(usize::MAX));
        }
        self.read_group(stream, ">", &options)
            .await
            .map_err(|e| with_group_hint(e, stream, subscription))
    }

    async fn ack(
        &self,
        stream: &str,
        subscription: &str,
        id: &EnvelopeId,
    ) -> Result<(), StreamError> {
        let mut conn = self.control.clone();
        let _acked: i64 = conn
            .xack(stream, subscription, &[id.as_str()])
            .await
            .map_err(|e| map_redis_error(e, stream))?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<EnvelopeId, StreamError> {
        let mut conn = self.control.clone();
        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(|e| map_redis_error(e, stream))?;
        Ok(EnvelopeId::new(id))
    }

    async fn ping(&self) -> Result<(), StreamError> {
        let mut conn = self.control.clone();
        let _pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamError::Backend {
                message: format!("Redis ping failed: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Turns a `NOGROUP` reply into [`StreamError::NoSuchSubscription`].
fn with_group_hint(err: StreamError, stream: &str, subscription: &str) -> StreamError {
    let missing = match &err {
        StreamError::Backend {
            source: Some(source),
            ..
        } => source
            .downcast_ref::<RedisError>()
            .is_some_and(is_missing_group),
        _ => false,
    };
    if missing {
        StreamError::NoSuchSubscription {
            stream: stream.to_string(),
            subscription: subscription.to_string(),
        }
    } else {
        err
    }
}

#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;
    use crate::stream::publish;
    use crate::types::Task;

    /// Connects and returns a stream name unique to this test.
    async fn test_stream() -> (RedisStream, String) {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let log = RedisStream::connect(&url, Duration::from_secs(2))
            .await
            .expect("Redis connection failed -- is Redis running?");
        (log, format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_ensure_subscription_is_idempotent() {
        let (log, stream) = test_stream().await;
        log.ensure_subscription(&stream, "workers-a").await.unwrap();
        log.ensure_subscription(&stream, "workers-a").await.unwrap();
    }

    #[tokio::test]
    async fn redis_every_subscription_sees_every_entry() {
        let (log, stream) = test_stream().await;
        log.ensure_subscription(&stream, "workers-a").await.unwrap();
        log.ensure_subscription(&stream, "workers-b").await.unwrap();
        let task = Task::new("example.com", vec!["A".parse().unwrap()]);
        publish(&log, &stream, &task).await.unwrap();

        for (group, reader) in [("workers-a", "consumer-a"), ("workers-b", "consumer-b")] {
            let batch = log
                .read_new(&stream, group, reader, 10, Duration::from_millis(100))
                .await
                .unwrap();
            assert_eq!(batch.len(), 1, "group {group}");
            assert_eq!(batch[0].decode_task().unwrap().task_id, task.task_id);
        }
    }

    #[tokio::test]
    async fn redis_unacked_entries_come_back_as_pending() {
        let (log, stream) = test_stream().await;
        log.ensure_subscription(&stream, "g").await.unwrap();
        log.append(&stream, "{}").await.unwrap();

        let batch = log
            .read_new(&stream, "g", "c", 10, Duration::from_millis(100))
            .await
            .unwrap();
        let pending = log.read_pending(&stream, "g", "c", None, 10).await.unwrap();
        assert_eq!(pending, batch);
        let after_last = log
            .read_pending(&stream, "g", "c", Some(&batch[0].id), 10)
            .await
            .unwrap();
        assert!(after_last.is_empty());

        log.ack(&stream, "g", &batch[0].id).await.unwrap();
        log.ack(&stream, "g", &batch[0].id).await.unwrap();
        assert!(log
            .read_pending(&stream, "g", "c", None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn redis_blocking_read_times_out_empty() {
        let (log, stream) = test_stream().await;
        log.ensure_subscription(&stream, "g").await.unwrap();
        let batch = log
            .read_new(&stream, "g", "c", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn redis_missing_group_is_reported() {
        let (log, stream) = test_stream().await;
        log.append(&stream, "{}").await.unwrap();
        let err = log.read_pending(&stream, "nope", "c", None, 10).await.unwrap_err();
        assert!(
            matches!(err, StreamError::NoSuchSubscription { .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn redis_ping_succeeds() {
        let (log, _stream) = test_stream().await;
        log.ping().await.unwrap();
    }
}
