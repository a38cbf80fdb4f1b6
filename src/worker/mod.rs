//! Worker: consumes one task, executes it, streams progress.
//!
//! A worker instance binds to exactly one (task stream, update stream,
//! worker-state stream) triple and processes at most one task per call
//! to [`Worker::run_single_task`]. An external supervisor restarts the
//! process between calls with a minimum interval, so an empty queue is
//! never hot-looped; multiple worker processes may run against the same
//! consumer group, coordinated only by the transport's pending-entry
//! mechanics.

pub mod artifacts;
pub mod local_task;
pub mod reporter;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::{BrokerError, Consumer, Producer};
use crate::records::{Task, TaskError};

pub use artifacts::ArtifactsRoot;
pub use local_task::{LocalTask, DEFAULT_TASK_TIMEOUT, KILL_GRACE, POLL_INTERVAL};
pub use reporter::{
    StatusReporter, WorkerStateReporter, OUTPUT_CHUNK_LIMIT, OUTPUT_FLUSH_INTERVAL,
    OUTPUT_TOTAL_LIMIT,
};

/// Errors that abort a worker poll cycle.
///
/// Any of these propagating out of `run_single_task` leaves the current
/// message unacknowledged, so a restarted worker picks it up again.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subprocess supervision failed: {0}")]
    Supervision(#[from] tokio::task::JoinError),
}

/// Settings for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable worker identity; resuming pending work after a crash
    /// depends on it staying the same across restarts.
    pub worker_id: String,
    /// Directory task subprocesses run in.
    pub run_dir: PathBuf,
    /// Directory run artifacts are written under.
    pub artifacts_root: PathBuf,
    /// Public URL prefix under which `artifacts_root` is served.
    pub artifacts_base_url: Option<String>,
    /// Hard ceiling on one task's run time.
    pub task_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let temp = std::env::temp_dir();
        Self {
            worker_id: worker_id.into(),
            run_dir: temp.join("taskforge-run"),
            artifacts_root: temp.join("task-artifacts"),
            artifacts_base_url: None,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    pub fn with_artifacts_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts_root = root.into();
        self
    }

    pub fn with_artifacts_base_url(mut self, url: impl Into<String>) -> Self {
        self.artifacts_base_url = Some(url.into());
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Takes at most one task from the task stream and executes it.
pub struct Worker {
    config: WorkerConfig,
    tasks: Consumer,
    updates: Producer,
    states: WorkerStateReporter,
}

impl Worker {
    pub fn new(config: WorkerConfig, tasks: Consumer, updates: Producer, states: Producer) -> Self {
        let states = WorkerStateReporter::new(states, &config.worker_id, tasks.stream());
        Self {
            config,
            tasks,
            updates,
            states,
        }
    }

    /// One poll cycle: read, execute, report, acknowledge.
    ///
    /// The message is acknowledged only after the run concludes with a
    /// handled outcome: success, a reported failure, or a message that
    /// can never become a task. Malformed messages are dropped rather
    /// than retried, since they can never parse.
    pub async fn run_single_task(&mut self) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            stream = %self.tasks.stream(),
            "Polling for a task"
        );
        let message = self.tasks.read_message().await?;
        let task_fields = message.as_ref().and_then(|m| parse_task_fields(&m.payload));
        match task_fields {
            None => {
                info!("Task queue is empty");
                self.states.send_idle().await?;
            }
            Some(fields) => self.process(fields).await?,
        }
        // A no-op when nothing was read; otherwise the read message is
        // done with, whatever became of it.
        self.tasks.acknowledge().await?;
        Ok(())
    }

    async fn process(&mut self, task_fields: Map<String, Value>) -> Result<(), WorkerError> {
        let artifacts = ArtifactsRoot::create(
            &self.config.artifacts_root,
            self.config.artifacts_base_url.as_deref(),
        )?;
        let mut update = StatusReporter::new(
            self.updates.clone(),
            task_fields.clone(),
            self.tasks.stream(),
            artifacts.url(),
        );
        self.states
            .send_running_task(&task_fields, artifacts.url())
            .await?;
        update.send_running(&self.config.worker_id).await?;

        let task = match Task::from_fields(&task_fields) {
            Ok(task) => task,
            Err(e) => {
                self.report_unrunnable(&artifacts, &update, &e).await?;
                return Ok(());
            }
        };

        let (output_tx, mut output_rx) = mpsc::channel(64);
        let execution = tokio::spawn(LocalTask::new(task).run(
            self.config.run_dir.clone(),
            artifacts.path().to_path_buf(),
            self.config.task_timeout,
            output_tx,
        ));
        while let Some(chunk) = output_rx.recv().await {
            update.send_output(&chunk).await?;
        }
        let run_status = execution.await??;

        info!(
            worker_id = %self.config.worker_id,
            status = %run_status,
            artifacts = %artifacts.url(),
            "Task finished"
        );
        update.send_finished(&run_status).await?;
        Ok(())
    }

    async fn report_unrunnable(
        &self,
        artifacts: &ArtifactsRoot,
        update: &StatusReporter,
        error: &TaskError,
    ) -> Result<(), WorkerError> {
        warn!(error = %error, "Cannot make a runnable task from the message");
        tokio::fs::write(
            artifacts.path().join("worker.log"),
            format!("Failed to make a runnable task: {error}"),
        )
        .await?;
        update.send_parse_failure(&self.config.worker_id).await?;
        Ok(())
    }
}

/// Parses a message payload into task fields. Anything that is not a
/// JSON object is dropped with a log line: it can never become a task,
/// so redelivering it would change nothing.
fn parse_task_fields(payload: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(fields)) => Some(fields),
        Ok(other) => {
            warn!(message = %other, "Message is not a task");
            None
        }
        Err(e) => {
            warn!(error = %e, "Invalid message");
            None
        }
    }
}
