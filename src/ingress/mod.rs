//! Task ingress: polls an external source and republishes accepted work.
//!
//! Each accepted task becomes two correlated messages: the task itself
//! on the task stream and an `enqueued` status record on the update
//! stream. The ingress pulls nothing while the task stream's transport
//! is unhealthy, so the external source keeps its backlog instead of
//! handing out work the queue cannot hold.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, Producer};
use crate::records::{StatusRecord, Task};

/// Minimum delay before polling the source again after an empty poll or
/// an unhealthy transport.
pub const EMPTY_POLL_DELAY: Duration = Duration::from_secs(5);

/// Errors that can occur during an ingress poll cycle.
#[derive(Debug, Error)]
pub enum IngressError {
    /// The external task source failed.
    #[error("task source failed: {0}")]
    Source(#[source] anyhow::Error),

    /// Appending to a stream failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// External supplier of new work.
///
/// Implementations poll a CI runner API or a database-backed job table;
/// calling repeatedly must be safe.
#[async_trait]
pub trait TaskSource: Send {
    /// Returns the next task to run, or `None` when the source has
    /// nothing to hand out.
    async fn request_new_task(&mut self) -> anyhow::Result<Option<Task>>;
}

/// Publishes work from a `TaskSource` as paired task and status messages.
pub struct TaskIngress<S> {
    source: S,
    tasks: Producer,
    updates: Producer,
    last_empty_poll: Option<Instant>,
    empty_poll_delay: Duration,
}

impl<S: TaskSource> TaskIngress<S> {
    pub fn new(source: S, tasks: Producer, updates: Producer) -> Self {
        Self {
            source,
            tasks,
            updates,
            last_empty_poll: None,
            empty_poll_delay: EMPTY_POLL_DELAY,
        }
    }

    /// Sets the delay kept after an empty poll.
    pub fn with_empty_poll_delay(mut self, delay: Duration) -> Self {
        self.empty_poll_delay = delay;
        self
    }

    /// One poll cycle: pulls at most one task and republishes it.
    ///
    /// A failed append is fatal for the cycle and propagates; there is
    /// no retry here. Losing the status append after the task append
    /// only delays dashboard visibility.
    pub async fn process_one_task(&mut self) -> Result<(), IngressError> {
        if let Some(last) = self.last_empty_poll {
            if last.elapsed() < self.empty_poll_delay {
                return Ok(());
            }
        }
        if !self.tasks.is_alive().await {
            warn!(
                stream = %self.tasks.stream(),
                "Task stream transport is not alive; not pulling new work"
            );
            self.last_empty_poll = Some(Instant::now());
            return Ok(());
        }
        let task = self
            .source
            .request_new_task()
            .await
            .map_err(IngressError::Source)?;
        let Some(task) = task else {
            debug!("Task source has no new work");
            self.last_empty_poll = Some(Instant::now());
            return Ok(());
        };
        let record = StatusRecord::new(task.to_fields(), self.tasks.stream()).with_status("enqueued");
        let position = self.tasks.append_record(&task).await?;
        self.updates.append_record(&record).await?;
        info!(
            stream = %self.tasks.stream(),
            position = %position,
            "Enqueued task"
        );
        Ok(())
    }
}
