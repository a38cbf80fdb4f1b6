//! Status and worker-state reporting for one task run.

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::debug;

use crate::broker::{BrokerError, Producer};
use crate::records::{RunStatus, StatusRecord, WorkerStateRecord};

/// Total output bytes one task may stream before updates are cut off.
pub const OUTPUT_TOTAL_LIMIT: usize = 5 * 1024 * 1024;

/// Largest single output record; longer flushes keep only the tail.
pub const OUTPUT_CHUNK_LIMIT: usize = 64 * 1024;

/// Minimum delay between output records.
pub const OUTPUT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const TOTAL_LIMIT_WARNING: &[u8] = b"WARNING: Task generates too much output. \
No more updates will be sent. See full output in task artifacts";

const CHUNK_LIMIT_WARNING: &[u8] = b"WARNING: Output update is too big; showing truncated:\n...";

/// Emits the status records for one task's lifetime.
///
/// Output is buffered and flushed at most once per flush interval. A
/// task whose output would push the streamed total past the cap gets
/// exactly one warning record; everything after that is dropped
/// silently (the artifact file still has it all).
pub struct StatusReporter {
    updates: Producer,
    task_fields: Map<String, Value>,
    task_group: String,
    artifacts_url: String,
    buffer: Vec<u8>,
    total_buffered: usize,
    last_flush: Option<Instant>,
    total_limit: usize,
    chunk_limit: usize,
    flush_interval: Duration,
}

impl StatusReporter {
    pub fn new(
        updates: Producer,
        task_fields: Map<String, Value>,
        task_group: impl Into<String>,
        artifacts_url: impl Into<String>,
    ) -> Self {
        Self {
            updates,
            task_fields,
            task_group: task_group.into(),
            artifacts_url: artifacts_url.into(),
            buffer: Vec::new(),
            total_buffered: 0,
            last_flush: None,
            total_limit: OUTPUT_TOTAL_LIMIT,
            chunk_limit: OUTPUT_CHUNK_LIMIT,
            flush_interval: OUTPUT_FLUSH_INTERVAL,
        }
    }

    /// Overrides the output caps.
    pub fn with_output_limits(mut self, total: usize, chunk: usize) -> Self {
        self.total_limit = total;
        self.chunk_limit = chunk;
        self
    }

    /// Overrides the minimum delay between output records.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub async fn send_running(&self, worker_id: &str) -> Result<(), BrokerError> {
        let record = self
            .record()
            .with_status("running")
            .with_worker_id(worker_id)
            .with_artifacts_url(&self.artifacts_url);
        self.send(&record).await
    }

    /// Reports a task that could not be turned into runnable work; such
    /// a task is terminal immediately.
    pub async fn send_parse_failure(&self, worker_id: &str) -> Result<(), BrokerError> {
        let record = self
            .record()
            .with_status("failed_to_parse_task")
            .with_failure(true)
            .with_worker_id(worker_id)
            .with_artifacts_url(&self.artifacts_url);
        self.send(&record).await
    }

    /// Buffers subprocess output and flushes it as a status record at
    /// most once per flush interval.
    pub async fn send_output(&mut self, raw: &[u8]) -> Result<(), BrokerError> {
        if self.total_buffered > self.total_limit {
            return Ok(());
        }
        self.buffer.extend_from_slice(raw);
        if let Some(last) = self.last_flush {
            if last.elapsed() < self.flush_interval {
                return Ok(());
            }
        }
        self.flush().await
    }

    /// Flushes any remaining output, then emits the terminal record.
    pub async fn send_finished(&mut self, status: &RunStatus) -> Result<(), BrokerError> {
        if !self.buffer.is_empty() {
            let remaining = std::mem::take(&mut self.buffer);
            self.send_output_record(&remaining).await?;
        }
        let record = self
            .record()
            .with_artifacts_url(&self.artifacts_url)
            .finished(status);
        self.send(&record).await
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        let buffered = self.buffer.len();
        if self.total_buffered + buffered > self.total_limit {
            debug!("Output size limit exceeded; no more output updates will be sent");
            self.send_output_record(TOTAL_LIMIT_WARNING).await?;
        } else {
            let update = std::mem::take(&mut self.buffer);
            self.send_output_record(&update).await?;
        }
        self.buffer.clear();
        self.total_buffered += buffered;
        self.last_flush = Some(Instant::now());
        Ok(())
    }

    async fn send_output_record(&self, raw: &[u8]) -> Result<(), BrokerError> {
        let truncated = truncate_output(raw, self.chunk_limit);
        let record = self
            .record()
            .with_output(String::from_utf8_lossy(&truncated).into_owned());
        self.send(&record).await
    }

    fn record(&self) -> StatusRecord {
        StatusRecord::new(self.task_fields.clone(), &self.task_group)
    }

    async fn send(&self, record: &StatusRecord) -> Result<(), BrokerError> {
        self.updates.append_record(record).await?;
        Ok(())
    }
}

fn truncate_output(raw: &[u8], limit: usize) -> Vec<u8> {
    if raw.len() > limit {
        let mut truncated = CHUNK_LIMIT_WARNING.to_vec();
        truncated.extend_from_slice(&raw[raw.len() - limit..]);
        truncated
    } else {
        raw.to_vec()
    }
}

/// Emits one worker liveness record per task-poll cycle.
pub struct WorkerStateReporter {
    states: Producer,
    worker_id: String,
    task_group: String,
}

impl WorkerStateReporter {
    pub fn new(
        states: Producer,
        worker_id: impl Into<String>,
        task_group: impl Into<String>,
    ) -> Self {
        Self {
            states,
            worker_id: worker_id.into(),
            task_group: task_group.into(),
        }
    }

    pub async fn send_idle(&self) -> Result<(), BrokerError> {
        let record = WorkerStateRecord::idle(&self.worker_id, &self.task_group);
        self.states.append_record(&record).await?;
        Ok(())
    }

    pub async fn send_running_task(
        &self,
        task_fields: &Map<String, Value>,
        artifacts_url: &str,
    ) -> Result<(), BrokerError> {
        let mut task = task_fields.clone();
        task.insert("task_artifacts_url".to_owned(), artifacts_url.into());
        let record =
            WorkerStateRecord::running_task(&self.worker_id, &self.task_group, Value::Object(task));
        self.states.append_record(&record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::broker::{MemoryTransport, StreamTransport};
    use crate::records::WorkerStatus;

    fn task_fields() -> Map<String, Value> {
        json!({"args": ["python3", "-"], "script": "print(1)"})
            .as_object()
            .expect("object")
            .clone()
    }

    fn reporter(transport: &Arc<MemoryTransport>) -> StatusReporter {
        StatusReporter::new(
            Producer::new(transport.clone(), "updates"),
            task_fields(),
            "tasks",
            "http://host/artifacts/run-1",
        )
    }

    async fn sent_records(transport: &Arc<MemoryTransport>) -> Vec<StatusRecord> {
        let mut messages = transport.read_tail("updates", None, 100).await.expect("read");
        messages.reverse();
        messages
            .iter()
            .map(|m| serde_json::from_str(&m.payload).expect("status record"))
            .collect()
    }

    #[tokio::test]
    async fn test_running_record_carries_worker_and_artifacts() {
        let transport = Arc::new(MemoryTransport::new());
        reporter(&transport).send_running("worker-1").await.expect("send");

        let records = sent_records(&transport).await;
        assert_eq!(records[0].status.as_deref(), Some("running"));
        assert_eq!(records[0].worker_id.as_deref(), Some("worker-1"));
        assert_eq!(
            records[0].task_artifacts_url.as_deref(),
            Some("http://host/artifacts/run-1")
        );
        assert_eq!(records[0].task["script"], json!("print(1)"));
    }

    #[tokio::test]
    async fn test_first_output_flushes_immediately_then_rate_limits() {
        let transport = Arc::new(MemoryTransport::new());
        let mut reporter = reporter(&transport);

        reporter.send_output(b"first").await.expect("send");
        reporter.send_output(b" second").await.expect("send");

        let records = sent_records(&transport).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output.as_deref(), Some("first"));
        assert!(records[0].status.is_none());

        // The held-back bytes go out with the terminal record.
        reporter.send_finished(&RunStatus::Succeed).await.expect("send");
        let records = sent_records(&transport).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].output.as_deref(), Some(" second"));
        assert_eq!(records[2].status.as_deref(), Some("succeed"));
        assert_eq!(records[2].succeed, Some(true));
        assert_eq!(records[2].failed, Some(false));
    }

    #[tokio::test]
    async fn test_oversized_flush_keeps_the_tail_with_a_marker() {
        let transport = Arc::new(MemoryTransport::new());
        let mut reporter = reporter(&transport).with_output_limits(1024 * 1024, 8);

        reporter.send_output(b"0123456789abcdef").await.expect("send");

        let records = sent_records(&transport).await;
        let output = records[0].output.as_deref().expect("output");
        assert!(output.starts_with("WARNING: Output update is too big"));
        assert!(output.ends_with("89abcdef"));
    }

    #[tokio::test]
    async fn test_total_cap_emits_exactly_one_warning_then_silence() {
        let transport = Arc::new(MemoryTransport::new());
        let mut reporter = reporter(&transport)
            .with_output_limits(10, 1024)
            .with_flush_interval(Duration::ZERO);

        reporter.send_output(b"0123456789abcdef").await.expect("send");
        reporter.send_output(b"more").await.expect("send");
        reporter.send_output(b"and more").await.expect("send");
        reporter.send_finished(&RunStatus::Succeed).await.expect("send");

        let records = sent_records(&transport).await;
        let outputs: Vec<&StatusRecord> =
            records.iter().filter(|r| r.output.is_some()).collect();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0]
            .output
            .as_deref()
            .expect("output")
            .starts_with("WARNING: Task generates too much output"));
        assert_eq!(records.last().expect("terminal").status.as_deref(), Some("succeed"));
    }

    #[tokio::test]
    async fn test_streamed_bytes_never_exceed_cap_plus_one_warning() {
        let transport = Arc::new(MemoryTransport::new());
        let total_limit = 64;
        let mut reporter = reporter(&transport)
            .with_output_limits(total_limit, 1024)
            .with_flush_interval(Duration::ZERO);

        for _ in 0..50 {
            reporter.send_output(&[b'x'; 16]).await.expect("send");
        }
        reporter.send_finished(&RunStatus::Succeed).await.expect("send");

        let records = sent_records(&transport).await;
        let streamed: usize = records
            .iter()
            .filter_map(|r| r.output.as_deref())
            .filter(|o| !o.starts_with("WARNING"))
            .map(str::len)
            .sum();
        let warnings = records
            .iter()
            .filter_map(|r| r.output.as_deref())
            .filter(|o| o.starts_with("WARNING"))
            .count();
        assert!(streamed <= total_limit);
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_parse_failure_record_is_terminal() {
        let transport = Arc::new(MemoryTransport::new());
        reporter(&transport)
            .send_parse_failure("worker-1")
            .await
            .expect("send");

        let records = sent_records(&transport).await;
        assert_eq!(records[0].status.as_deref(), Some("failed_to_parse_task"));
        assert_eq!(records[0].failed, Some(true));
        assert_eq!(records[0].worker_id.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_worker_state_records() {
        let transport = Arc::new(MemoryTransport::new());
        let reporter =
            WorkerStateReporter::new(Producer::new(transport.clone(), "states"), "worker-1", "tasks");

        reporter.send_idle().await.expect("send");
        reporter
            .send_running_task(&task_fields(), "http://host/run-1")
            .await
            .expect("send");

        let mut messages = transport.read_tail("states", None, 10).await.expect("read");
        messages.reverse();
        let idle: WorkerStateRecord =
            serde_json::from_str(&messages[0].payload).expect("record");
        assert_eq!(idle.status, WorkerStatus::Idle);
        assert_eq!(idle.worker_id, "worker-1");
        assert_eq!(idle.task_group, "tasks");

        let running: WorkerStateRecord =
            serde_json::from_str(&messages[1].payload).expect("record");
        assert_eq!(running.status, WorkerStatus::RunningTask);
        let task = running.task.expect("task");
        assert_eq!(task["task_artifacts_url"], json!("http://host/run-1"));
        assert_eq!(task["script"], json!("print(1)"));
    }
}
