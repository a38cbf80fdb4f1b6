//! Pull-side client: one message at a time per consumer identity.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::transport::{BrokerError, Message, StreamTransport};

/// How long an empty poll waits for a new message to arrive.
pub const READ_BLOCK: Duration = Duration::from_millis(100);

/// Reads messages from one stream on behalf of one consumer identity
/// within a consumer group.
///
/// A consumer finishes the message it holds before starting another:
/// `read_message` refuses to run while one is outstanding. The identity
/// is expected to be stable across process restarts: a restarted
/// consumer drains its own pending entries before taking new work,
/// which is what makes delivery effectively at-least-once without an
/// external checkpoint store.
pub struct Consumer {
    transport: Arc<dyn StreamTransport>,
    stream: String,
    group: String,
    consumer_id: String,
    outstanding: Option<String>,
}

impl Consumer {
    /// Registers the consumer group and binds to `consumer_id`.
    ///
    /// Group creation is idempotent; a freshly created group only sees
    /// messages appended after this call.
    pub async fn register(
        transport: Arc<dyn StreamTransport>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let stream = stream.into();
        let group = group.into();
        transport.create_group(&stream, &group).await?;
        Ok(Self {
            transport,
            stream,
            group,
            consumer_id: consumer_id.into(),
            outstanding: None,
        })
    }

    /// Stream this consumer reads from.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Identity this consumer reads as.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Returns the next message for this consumer: its own oldest
    /// pending entry if one exists, otherwise a never-delivered entry,
    /// waiting up to `READ_BLOCK` for one. `None` means the stream has
    /// nothing for us right now.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::UnacknowledgedMessage` while a previously
    /// read message has not been acknowledged.
    pub async fn read_message(&mut self) -> Result<Option<Message>, BrokerError> {
        if self.outstanding.is_some() {
            return Err(BrokerError::UnacknowledgedMessage);
        }
        if let Some(message) = self
            .transport
            .read_pending(&self.stream, &self.group, &self.consumer_id)
            .await?
        {
            debug!(
                stream = %self.stream,
                consumer = %self.consumer_id,
                id = %message.id,
                "Resuming pending message"
            );
            self.outstanding = Some(message.id.clone());
            return Ok(Some(message));
        }
        let message = self
            .transport
            .read_new(&self.stream, &self.group, &self.consumer_id, READ_BLOCK)
            .await?;
        if let Some(message) = &message {
            self.outstanding = Some(message.id.clone());
        }
        Ok(message)
    }

    /// Acknowledges the outstanding message; a no-op when nothing is
    /// outstanding.
    pub async fn acknowledge(&mut self) -> Result<(), BrokerError> {
        let Some(id) = self.outstanding.as_deref() else {
            return Ok(());
        };
        self.transport
            .acknowledge(&self.stream, &self.group, id)
            .await?;
        self.outstanding = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryTransport;
    use crate::broker::producer::Producer;

    async fn consumer(transport: &Arc<MemoryTransport>, consumer_id: &str) -> Consumer {
        Consumer::register(transport.clone(), "tasks", "workers", consumer_id)
            .await
            .expect("register")
    }

    #[tokio::test]
    async fn test_acknowledged_message_is_seen_by_no_other_consumer() {
        let transport = Arc::new(MemoryTransport::new());
        let mut first = consumer(&transport, "worker-a").await;
        let mut second = consumer(&transport, "worker-b").await;
        Producer::new(transport.clone(), "tasks")
            .append("{\"n\":1}")
            .await
            .expect("append");

        let message = first.read_message().await.expect("read").expect("message");
        first.acknowledge().await.expect("ack");

        assert!(second.read_message().await.expect("read").is_none());
        assert!(first.read_message().await.expect("read").is_none());
        assert_eq!(message.payload, "{\"n\":1}");
    }

    #[tokio::test]
    async fn test_read_with_outstanding_message_is_a_protocol_error() {
        let transport = Arc::new(MemoryTransport::new());
        let mut consumer = consumer(&transport, "worker-a").await;
        Producer::new(transport.clone(), "tasks")
            .append("{}")
            .await
            .expect("append");

        consumer.read_message().await.expect("read").expect("message");
        let err = consumer.read_message().await.expect_err("second read");

        assert!(matches!(err, BrokerError::UnacknowledgedMessage));
    }

    #[tokio::test]
    async fn test_restarted_consumer_resumes_its_pending_message_first() {
        let transport = Arc::new(MemoryTransport::new());
        let mut crashed = consumer(&transport, "worker-a").await;
        let producer = Producer::new(transport.clone(), "tasks");
        producer.append("first").await.expect("append");
        producer.append("second").await.expect("append");

        let taken = crashed.read_message().await.expect("read").expect("message");
        drop(crashed);

        // Same identity, fresh process: the unfinished message comes
        // back before any new one.
        let mut restarted = consumer(&transport, "worker-a").await;
        let resumed = restarted.read_message().await.expect("read").expect("message");
        assert_eq!(resumed.id, taken.id);
        restarted.acknowledge().await.expect("ack");

        let next = restarted.read_message().await.expect("read").expect("message");
        assert_eq!(next.payload, "second");
    }

    #[tokio::test]
    async fn test_pending_message_does_not_leak_to_other_identities() {
        let transport = Arc::new(MemoryTransport::new());
        let mut holder = consumer(&transport, "worker-a").await;
        let mut other = consumer(&transport, "worker-b").await;
        Producer::new(transport.clone(), "tasks")
            .append("only")
            .await
            .expect("append");

        holder.read_message().await.expect("read").expect("message");

        assert!(other.read_message().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_without_outstanding_is_a_no_op() {
        let transport = Arc::new(MemoryTransport::new());
        let mut consumer = consumer(&transport, "worker-a").await;

        consumer.acknowledge().await.expect("no-op ack");

        // Acknowledging twice after one read is equally harmless.
        Producer::new(transport.clone(), "tasks")
            .append("{}")
            .await
            .expect("append");
        consumer.read_message().await.expect("read").expect("message");
        consumer.acknowledge().await.expect("ack");
        consumer.acknowledge().await.expect("repeat ack");
    }
}
