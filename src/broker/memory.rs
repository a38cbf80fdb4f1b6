//! In-process stream transport with consumer-group semantics.
//!
//! Mirrors the Redis Streams behavior the queue relies on (append-only
//! ordered entries, a per-group delivery cursor, per-consumer pending
//! entries, reverse tail scans) without a server. Lifecycle and unit
//! tests run against it; production deployments use `RedisTransport`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{BrokerError, Message, StreamTransport, DEFAULT_MAX_STREAM_LEN};

#[derive(Default)]
struct GroupState {
    /// Absolute position of the next entry never delivered to this group.
    cursor: usize,
    /// Delivered-but-unacknowledged entry ids, oldest first, per consumer.
    pending: HashMap<String, VecDeque<String>>,
}

#[derive(Default)]
struct StreamState {
    /// Absolute position of `entries[0]`; grows as old entries are trimmed.
    base: usize,
    entries: VecDeque<Message>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn end(&self) -> usize {
        self.base + self.entries.len()
    }
}

/// Stream transport living entirely in process memory.
pub struct MemoryTransport {
    streams: Mutex<HashMap<String, StreamState>>,
    alive: AtomicBool,
    max_stream_len: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
        }
    }

    /// Sets the per-stream entry cap.
    pub fn with_max_stream_len(mut self, max_stream_len: usize) -> Self {
        self.max_stream_len = max_stream_len;
        self
    }

    /// Makes `is_alive` report the given state, simulating a transport
    /// outage.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        // The map is only held across non-async operations, so a
        // poisoned lock can only come from a panicking test.
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn append(&self, stream: &str, payload: &str) -> Result<String, BrokerError> {
        let mut streams = self.lock();
        let state = streams.entry(stream.to_owned()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push_back(Message {
            id: id.clone(),
            payload: payload.to_owned(),
        });
        while state.entries.len() > self.max_stream_len {
            state.entries.pop_front();
            state.base += 1;
        }
        Ok(id)
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut streams = self.lock();
        let state = streams.entry(stream.to_owned()).or_default();
        let end = state.end();
        // A new group starts at the stream tail; re-creating an existing
        // group leaves its cursor untouched.
        state
            .groups
            .entry(group.to_owned())
            .or_insert_with(|| GroupState {
                cursor: end,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Message>, BrokerError> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(None);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(None);
        };
        let Some(ids) = group_state.pending.get_mut(consumer) else {
            return Ok(None);
        };
        // Ids whose entries were trimmed out of the stream can never be
        // redelivered; forget them.
        while let Some(id) = ids.front().cloned() {
            if let Some(entry) = state.entries.iter().find(|entry| entry.id == id) {
                return Ok(Some(entry.clone()));
            }
            ids.pop_front();
        }
        Ok(None)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        _block: Duration,
    ) -> Result<Option<Message>, BrokerError> {
        // An in-process transport has no one to wait for; an empty read
        // returns immediately.
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(None);
        };
        let base = state.base;
        let end = state.end();
        let position = match state.groups.get(group) {
            Some(group_state) => group_state.cursor.max(base),
            None => return Ok(None),
        };
        if position >= end {
            return Ok(None);
        }
        let Some(message) = state.entries.get(position - base).cloned() else {
            return Ok(None);
        };
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.cursor = position + 1;
            group_state
                .pending
                .entry(consumer.to_owned())
                .or_default()
                .push_back(message.id.clone());
        }
        Ok(Some(message))
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut streams = self.lock();
        if let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
        {
            for ids in group_state.pending.values_mut() {
                ids.retain(|pending| pending != id);
            }
        }
        Ok(())
    }

    async fn read_tail(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<Message>, BrokerError> {
        let streams = self.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let floor = after.map(sequence_of);
        let newest_first = state
            .entries
            .iter()
            .rev()
            .take_while(|entry| match floor {
                Some(floor) => sequence_of(&entry.id) > floor,
                None => true,
            })
            .take(count)
            .cloned()
            .collect();
        Ok(newest_first)
    }
}

fn sequence_of(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .unwrap_or(0)
}
