//! Last-write-wins aggregation stores for the monitoring read-side.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::broker::{BatchReader, BrokerError};
use crate::records::{StatusRecord, WorkerStateRecord, WorkerStatus};

/// Default capacity of the task aggregation.
pub const TASK_STORE_CAPACITY: usize = 80_000;

/// Default capacity of the worker-state aggregation.
pub const WORKER_STORE_CAPACITY: usize = 20_000;

/// Insertion-ordered, capacity-bounded, last-write-wins map.
///
/// Updating an existing key replaces its value in place; keys keep
/// their first-insertion order and the oldest key is evicted once the
/// capacity is exceeded.
struct BoundedLatest<K, V> {
    capacity: usize,
    values: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedLatest<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn upsert(&mut self, key: K, value: V) {
        if self.values.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.values.remove(&oldest);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    /// Entries most-recently-inserted first.
    fn iter_newest_first(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .iter()
            .rev()
            .filter_map(|key| self.values.get(key).map(|value| (key, value)))
    }
}

/// Latest status record per (task group, task identity).
///
/// Mutated only by `refresh`, which the monitoring loop drives; reads
/// and refreshes may interleave freely since the map lives behind a
/// mutex.
pub struct TaskStore {
    records: Mutex<BoundedLatest<(String, String), StatusRecord>>,
}

impl TaskStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(BoundedLatest::new(capacity)),
        }
    }

    /// Folds the readers' latest views in. Records without a `status`
    /// (output chunks) do not replace the latest meaningful state.
    pub async fn refresh(&self, readers: &mut [BatchReader]) -> Result<(), BrokerError> {
        for reader in readers.iter_mut() {
            let payloads = reader.list_latest().await?;
            let mut records = self.records.lock().await;
            for payload in &payloads {
                let Ok(record) = serde_json::from_str::<StatusRecord>(payload) else {
                    continue;
                };
                if record.status.is_none() {
                    continue;
                }
                let key = (record.task_group.clone(), record.entity_id());
                records.upsert(key, record);
            }
            debug!(
                stream = %reader.stream(),
                size = records.len(),
                "Task store refreshed"
            );
        }
        Ok(())
    }

    /// Current values grouped by task group, most recently inserted
    /// first within each group.
    pub async fn list(&self) -> HashMap<String, Vec<StatusRecord>> {
        let records = self.records.lock().await;
        let mut groups: HashMap<String, Vec<StatusRecord>> = HashMap::new();
        for ((group, _), record) in records.iter_newest_first() {
            groups.entry(group.clone()).or_default().push(record.clone());
        }
        groups
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

/// Latest state record per (task group, worker id).
pub struct WorkerStateStore {
    records: Mutex<BoundedLatest<(String, String), WorkerStateRecord>>,
}

impl WorkerStateStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(BoundedLatest::new(capacity)),
        }
    }

    /// Folds the reader's latest view in; last record per worker wins.
    pub async fn refresh(&self, reader: &mut BatchReader) -> Result<(), BrokerError> {
        let payloads = reader.list_latest().await?;
        let mut records = self.records.lock().await;
        for payload in &payloads {
            // Anything that does not parse as a worker state record
            // (missing status, foreign payloads) is not state.
            let Ok(record) = serde_json::from_str::<WorkerStateRecord>(payload) else {
                continue;
            };
            let key = (record.task_group.clone(), record.worker_id.clone());
            records.upsert(key, record);
        }
        debug!(size = records.len(), "Worker state store refreshed");
        Ok(())
    }

    /// Current values grouped by task group, most recently inserted
    /// first within each group.
    pub async fn list(&self) -> HashMap<String, Vec<WorkerStateRecord>> {
        let records = self.records.lock().await;
        let mut groups: HashMap<String, Vec<WorkerStateRecord>> = HashMap::new();
        for ((group, _), record) in records.iter_newest_first() {
            groups.entry(group.clone()).or_default().push(record.clone());
        }
        groups
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

/// Staleness classification of a worker, judged purely by elapsed time
/// since its last state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    Stuck,
    Dead,
    Gone,
}

/// Classifies a worker's staleness.
///
/// An idle worker is due back within its supervisor restart interval,
/// so its thresholds are short; a worker claiming to run a task may be
/// legitimately silent for a full task ceiling plus grace.
pub fn classify_worker(record: &WorkerStateRecord, now: DateTime<Utc>) -> WorkerHealth {
    let Ok(updated_at) = DateTime::parse_from_rfc3339(&record.updated_at) else {
        return WorkerHealth::Gone;
    };
    let elapsed = now.signed_duration_since(updated_at.with_timezone(&Utc));
    let (stuck, dead, gone) = match record.status {
        WorkerStatus::Idle => (60, 120, 300),
        WorkerStatus::RunningTask => (3_900, 7_800, 19_500),
    };
    match elapsed.num_seconds() {
        seconds if seconds >= gone => WorkerHealth::Gone,
        seconds if seconds >= dead => WorkerHealth::Dead,
        seconds if seconds >= stuck => WorkerHealth::Stuck,
        _ => WorkerHealth::Healthy,
    }
}
