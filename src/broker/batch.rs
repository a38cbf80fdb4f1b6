//! Reverse-scan reader for dashboard aggregation.

use std::collections::VecDeque;
use std::sync::Arc;

use super::transport::{BrokerError, Message, StreamTransport};

/// Lazy, append-growing view over the newest entries of one stream.
///
/// The first `list_latest` call scans backward from the stream tail up
/// to `capacity` entries; each later call scans backward only to the
/// newest previously-seen position and extends a capacity-bounded FIFO
/// cache with whatever arrived since. The reader never consumes or
/// acknowledges anything and has no interaction with consumer groups.
pub struct BatchReader {
    transport: Arc<dyn StreamTransport>,
    stream: String,
    capacity: usize,
    cache: VecDeque<Message>,
}

impl BatchReader {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        stream: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            transport,
            stream: stream.into(),
            capacity,
            cache: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Stream this reader scans.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Returns the cached payloads oldest-to-newest, after folding in
    /// any entries appended since the previous call.
    pub async fn list_latest(&mut self) -> Result<Vec<String>, BrokerError> {
        // The newest cached entry survives eviction (only the oldest
        // are dropped), so its position is where the next scan stops.
        let after = self.cache.back().map(|message| message.id.clone());
        let mut fresh = self
            .transport
            .read_tail(&self.stream, after.as_deref(), self.capacity)
            .await?;
        fresh.reverse();
        for message in fresh {
            self.cache.push_back(message);
            if self.cache.len() > self.capacity {
                self.cache.pop_front();
            }
        }
        Ok(self.cache.iter().map(|message| message.payload.clone()).collect())
    }
}
