//! Stream transport contract and its Redis Streams implementation.
//!
//! The queue runs over an ordered, approximately size-bounded log with
//! consumer-group semantics: a per-group delivery cursor plus a pending
//! entry list (PEL) of delivered-but-unacknowledged messages per
//! consumer. Redis Streams satisfies the contract directly (XADD,
//! XGROUP CREATE, XREADGROUP, XACK, XREVRANGE); `MemoryTransport`
//! provides the same semantics in-process for tests.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use thiserror::Error;

/// Stream entry field under which payloads are stored.
const PAYLOAD_FIELD: &str = "payload";

/// Entry count past which the oldest stream entries are dropped. The
/// cap is approximate; the transport trims when convenient.
pub const DEFAULT_MAX_STREAM_LEN: usize = 1_000_000;

/// Errors surfaced by the stream transport and its clients.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to connect to the backing store.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A transport operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The payload is larger than a single message may carry.
    #[error("payload of {size} bytes exceeds the {limit}-byte message limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A consumer tried to read while still holding an unacknowledged
    /// message.
    #[error("unacknowledged message exists")]
    UnacknowledgedMessage,

    /// Failed to serialize a record into a payload.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One delivered stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Log position assigned by the transport, monotonically increasing
    /// within a stream.
    pub id: String,
    /// Opaque payload; a JSON-serialized record in this system.
    pub payload: String,
}

/// Contract over an ordered, size-bounded log with consumer groups.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Appends a payload, returning the position assigned by the log.
    async fn append(&self, stream: &str, payload: &str) -> Result<String, BrokerError>;

    /// Cheap liveness probe.
    async fn is_alive(&self) -> bool;

    /// Registers a consumer group. Creating a group that already exists
    /// is not an error; a freshly created group only sees messages
    /// appended after creation.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// This consumer's oldest still-pending entry, if any.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Message>, BrokerError>;

    /// The next never-delivered entry for the group, waiting up to
    /// `block` for one to arrive. The returned entry enters this
    /// consumer's pending list.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Message>, BrokerError>;

    /// Removes a delivered entry from the group's pending list.
    async fn acknowledge(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Up to `count` entries strictly newer than `after` (the whole tail
    /// when `after` is `None`), scanning backward from the stream tail.
    /// Returned newest first. Does not touch consumer groups.
    async fn read_tail(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<Message>, BrokerError>;
}

/// Stream transport backed by Redis Streams.
///
/// `ConnectionManager` reconnects automatically, so transient connection
/// loss surfaces as a single failed operation at worst.
#[derive(Clone)]
pub struct RedisTransport {
    redis: ConnectionManager,
    max_stream_len: usize,
}

impl RedisTransport {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Creates a transport from an existing connection manager.
    ///
    /// Useful when sharing a connection pool across components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
        }
    }

    /// Sets the approximate per-stream entry cap.
    pub fn with_max_stream_len(mut self, max_stream_len: usize) -> Self {
        self.max_stream_len = max_stream_len;
        self
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Option<Message>, BrokerError> {
        let mut conn = self.redis.clone();
        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }
        let reply: StreamReadReply = conn.xread_options(&[stream], &[id], &options).await?;
        for key in reply.keys {
            if let Some(entry) = key.ids.into_iter().next() {
                if let Some(message) = message_from_entry(entry) {
                    return Ok(Some(message));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn append(&self, stream: &str, payload: &str) -> Result<String, BrokerError> {
        let mut conn = self.redis.clone();
        let position: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(self.max_stream_len),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await?;
        Ok(position)
    }

    async fn is_alive(&self) -> bool {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        // "$" starts the group at the stream tail: no history replay for
        // freshly restarted services.
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(stream, group, "$")
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Message>, BrokerError> {
        // "0" asks for this consumer's pending entries from the
        // beginning of its PEL.
        self.read_group(stream, group, consumer, "0", None).await
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Message>, BrokerError> {
        self.read_group(stream, group, consumer, ">", Some(block)).await
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.xack::<_, _, _, i64>(stream, group, &[id]).await?;
        Ok(())
    }

    async fn read_tail(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<Message>, BrokerError> {
        let mut conn = self.redis.clone();
        let start = match after {
            Some(id) => format!("({id}"),
            None => "-".to_owned(),
        };
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", start.as_str(), count).await?;
        Ok(reply.ids.into_iter().filter_map(message_from_entry).collect())
    }
}

fn message_from_entry(entry: StreamId) -> Option<Message> {
    let payload = entry.get::<String>(PAYLOAD_FIELD)?;
    Some(Message {
        id: entry.id,
        payload,
    })
}
