//! Append-side client for a single stream.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::transport::{BrokerError, StreamTransport};

/// Largest payload accepted for a single message.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Appends messages to one stream.
#[derive(Clone)]
pub struct Producer {
    transport: Arc<dyn StreamTransport>,
    stream: String,
}

impl Producer {
    pub fn new(transport: Arc<dyn StreamTransport>, stream: impl Into<String>) -> Self {
        Self {
            transport,
            stream: stream.into(),
        }
    }

    /// Stream this producer appends to.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Appends one payload, returning the position the log assigned.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::PayloadTooLarge` for payloads over
    /// `MAX_PAYLOAD_BYTES`.
    pub async fn append(&self, payload: &str) -> Result<String, BrokerError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(BrokerError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        let position = self.transport.append(&self.stream, payload).await?;
        debug!(stream = %self.stream, position = %position, "Appended message");
        Ok(position)
    }

    /// Serializes a record and appends it.
    pub async fn append_record<T: Serialize>(&self, record: &T) -> Result<String, BrokerError> {
        self.append(&serde_json::to_string(record)?).await
    }

    /// Cheap probe for transport liveness.
    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryTransport;

    #[tokio::test]
    async fn test_append_assigns_increasing_positions() {
        let producer = Producer::new(Arc::new(MemoryTransport::new()), "tasks");

        let first = producer.append("{}").await.expect("append");
        let second = producer.append("{}").await.expect("append");

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let producer = Producer::new(transport.clone(), "tasks");
        let payload = "x".repeat(2 * 1024 * 1024);

        let err = producer.append(&payload).await.expect_err("should reject");

        assert!(matches!(err, BrokerError::PayloadTooLarge { .. }));
        // Nothing must reach the stream.
        let tail = transport.read_tail("tasks", None, 1).await.expect("read");
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_payload_at_the_limit_is_accepted() {
        let producer = Producer::new(Arc::new(MemoryTransport::new()), "tasks");
        let payload = "x".repeat(MAX_PAYLOAD_BYTES);

        producer.append(&payload).await.expect("append at the cap");
    }
}
