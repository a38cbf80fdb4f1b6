//! Monitoring read-side: capacity-bounded aggregations over the update
//! and worker-state streams.
//!
//! Both stores follow the same pattern: a background loop pulls the
//! newest entries from a `BatchReader` on a fixed interval and upserts
//! the latest record per key, last write wins. Nothing else ever
//! mutates a store; readers and the refresh loop share it through a
//! mutex. Aggregation never touches consumer groups, so it cannot
//! interfere with task delivery.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::broker::BatchReader;

pub use store::{
    classify_worker, TaskStore, WorkerHealth, WorkerStateStore, TASK_STORE_CAPACITY,
    WORKER_STORE_CAPACITY,
};

/// Interval between store refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Drives a task store forever; meant to be spawned alongside whatever
/// serves reads.
pub async fn run_task_store(store: Arc<TaskStore>, mut readers: Vec<BatchReader>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = store.refresh(&mut readers).await {
            warn!(error = %e, "Task store refresh failed");
        }
    }
}

/// Drives a worker-state store forever.
pub async fn run_worker_state_store(
    store: Arc<WorkerStateStore>,
    mut reader: BatchReader,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = store.refresh(&mut reader).await {
            warn!(error = %e, "Worker state store refresh failed");
        }
    }
}
