//! Wire formats shared by every component of the queue.
//!
//! Tasks, status records and worker-state records travel as JSON payloads
//! over the stream transport. The structs here enumerate the required and
//! optional fields of each record; anything a task source attaches beyond
//! the required fields is carried through untouched, so every status
//! record stays a superset of the task it describes.

use std::collections::HashMap;
use std::fmt;
use std::process::ExitStatus;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fields a status record owns; they are stripped from the carried task
/// map so the record serializes each of them exactly once.
const STATUS_FIELDS: [&str; 7] = [
    "status",
    "task_group",
    "worker_id",
    "task_artifacts_url",
    "output",
    "failed",
    "succeed",
];

/// Errors raised when a message cannot be turned into a runnable task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0} fields are missing")]
    MissingFields(String),

    #[error("arguments must be a list of strings")]
    InvalidArgs,

    #[error("script must be a string")]
    InvalidScript,

    #[error("environment must be a string-to-string map")]
    InvalidEnv,
}

/// One unit of executable work: a command line, a script body fed to it
/// on stdin, and environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub args: Vec<String>,
    pub script: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Source-specific fields, carried through to status records.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Validates raw message fields into a task, failing with a named
    /// error instead of letting a partial map propagate.
    pub fn from_fields(fields: &Map<String, Value>) -> Result<Self, TaskError> {
        let missing: Vec<&str> = ["args", "script"]
            .iter()
            .filter(|field| !fields.contains_key(**field))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(TaskError::MissingFields(missing.join(", ")));
        }
        let args = fields["args"]
            .as_array()
            .ok_or(TaskError::InvalidArgs)?
            .iter()
            .map(|value| value.as_str().map(str::to_owned).ok_or(TaskError::InvalidArgs))
            .collect::<Result<Vec<String>, TaskError>>()?;
        let script = fields["script"]
            .as_str()
            .ok_or(TaskError::InvalidScript)?
            .to_owned();
        let env = match fields.get("env") {
            None | Some(Value::Null) => HashMap::new(),
            Some(value) => {
                let entries = value.as_object().ok_or(TaskError::InvalidEnv)?;
                entries
                    .iter()
                    .map(|(key, value)| {
                        let value = value.as_str().ok_or(TaskError::InvalidEnv)?;
                        Ok((key.clone(), value.to_owned()))
                    })
                    .collect::<Result<HashMap<String, String>, TaskError>>()?
            }
        };
        let extra = fields
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "args" | "script" | "env"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self { args, script, env, extra })
    }

    /// The task as raw message fields.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        }
    }
}

/// Terminal outcome of one task execution.
///
/// Exit codes and timeouts are normal outcomes here, not errors: the
/// queue reports them and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Succeed,
    FailedWithCode(i32),
    FailedTimedOut,
    FailedNotAPythonCommand,
}

impl RunStatus {
    pub fn from_exit_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => RunStatus::Succeed,
            Some(code) => RunStatus::FailedWithCode(code),
            // Killed by a signal before reporting an exit code.
            None => RunStatus::FailedWithCode(-1),
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, RunStatus::Succeed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeed => write!(f, "succeed"),
            RunStatus::FailedWithCode(code) => write!(f, "failed_with_code_{code}"),
            RunStatus::FailedTimedOut => write!(f, "failed_timed_out"),
            RunStatus::FailedNotAPythonCommand => write!(f, "failed_not_a_python_command"),
        }
    }
}

/// A point-in-time report about one task's progress or outcome.
///
/// Output chunks are the one record kind without a `status`; the
/// monitoring read-side skips them when folding in the latest state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub task_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_artifacts_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeed: Option<bool>,
    /// The fields of the task this record describes.
    #[serde(flatten)]
    pub task: Map<String, Value>,
}

impl StatusRecord {
    pub fn new(task_fields: Map<String, Value>, task_group: impl Into<String>) -> Self {
        let mut task = task_fields;
        for field in STATUS_FIELDS {
            task.remove(field);
        }
        Self {
            status: None,
            task_group: task_group.into(),
            worker_id: None,
            task_artifacts_url: None,
            output: None,
            failed: None,
            succeed: None,
            task,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_artifacts_url(mut self, url: impl Into<String>) -> Self {
        self.task_artifacts_url = Some(url.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_failure(mut self, failed: bool) -> Self {
        self.failed = Some(failed);
        self
    }

    /// Stamps the record as the terminal report of a run.
    pub fn finished(mut self, status: &RunStatus) -> Self {
        self.status = Some(status.to_string());
        self.failed = Some(status.is_failure());
        self.succeed = Some(*status == RunStatus::Succeed);
        self
    }

    /// Stable identity of the task this record describes, used to key
    /// the dashboard aggregation: the source-assigned `task_id` when one
    /// exists, otherwise a digest of the command line and script.
    pub fn entity_id(&self) -> String {
        if let Some(id) = self.task.get("task_id").and_then(Value::as_str) {
            return id.to_owned();
        }
        let mut hasher = Sha256::new();
        if let Some(args) = self.task.get("args") {
            hasher.update(args.to_string().as_bytes());
        }
        if let Some(script) = self.task.get("script") {
            hasher.update(script.to_string().as_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// What a worker reports itself doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    RunningTask,
}

/// A point-in-time liveness and activity report for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStateRecord {
    pub worker_id: String,
    pub task_group: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Value>,
    /// ISO-8601 UTC with microsecond precision.
    pub updated_at: String,
}

impl WorkerStateRecord {
    pub fn idle(worker_id: impl Into<String>, task_group: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_group: task_group.into(),
            status: WorkerStatus::Idle,
            task: None,
            updated_at: now_iso(),
        }
    }

    pub fn running_task(
        worker_id: impl Into<String>,
        task_group: impl Into<String>,
        task: Value,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_group: task_group.into(),
            status: WorkerStatus::RunningTask,
            task: Some(task),
            updated_at: now_iso(),
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
