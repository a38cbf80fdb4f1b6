//! Update service: forwards status records to an external report sink.
//!
//! The sink classifies its own failures: temporary ones are retried a
//! bounded number of times, permanent ones are logged and dropped, and
//! anything the sink could not classify aborts the cycle without
//! acknowledgment so the message comes back after a restart.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::{BrokerError, Consumer};

/// Delivery attempts per report before it is dropped.
pub const MAX_SEND_ATTEMPTS: u32 = 12;

/// Fixed delay between delivery attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Failure classification a report sink must provide.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The sink expects to recover: rate limits, timeouts, 5xx.
    #[error("temporary report failure: {0}")]
    Temporary(String),

    /// Retrying can never help: rejected payload, deleted target.
    #[error("permanent report failure: {0}")]
    Permanent(String),

    /// Anything the sink could not classify.
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

/// External receiver of serialized status records.
///
/// Implementations post to a CI job-trace API or write to a SQL table;
/// they are responsible for telling retryable failures apart from
/// permanent ones.
#[async_trait]
pub trait ReportSink: Send {
    /// Delivers one serialized status record.
    async fn send_report(&mut self, report: &[u8]) -> Result<(), ReportError>;
}

/// Errors that abort an update cycle before acknowledgment.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("report sink failed: {0}")]
    Sink(#[source] anyhow::Error),
}

/// Forwards one status message per call to the report sink.
pub struct UpdateService<S> {
    updates: Consumer,
    sink: S,
    retry_delay: Duration,
}

impl<S: ReportSink> UpdateService<S> {
    pub fn new(updates: Consumer, sink: S) -> Self {
        Self {
            updates,
            sink,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Sets the delay between delivery attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The sink reports are forwarded to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Reads one update and relays it with bounded retry.
    ///
    /// The message is acknowledged whether delivery succeeded, failed
    /// permanently, or exhausted its attempts; only an unclassified
    /// sink failure leaves it pending for redelivery.
    pub async fn process_one_update(&mut self) -> Result<(), UpdateError> {
        let Some(message) = self.updates.read_message().await? else {
            return Ok(());
        };
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match self.sink.send_report(message.payload.as_bytes()).await {
                Ok(()) => {
                    debug!(attempt, id = %message.id, "Report delivered");
                    break;
                }
                Err(ReportError::Temporary(reason)) => {
                    warn!(attempt, %reason, "Temporary report failure");
                    if attempt < MAX_SEND_ATTEMPTS {
                        tokio::time::sleep(self.retry_delay).await;
                    } else {
                        warn!(
                            id = %message.id,
                            "Report dropped after {MAX_SEND_ATTEMPTS} attempts"
                        );
                    }
                }
                Err(ReportError::Permanent(reason)) => {
                    warn!(id = %message.id, %reason, "Permanent report failure; dropping report");
                    break;
                }
                Err(ReportError::Unclassified(e)) => return Err(UpdateError::Sink(e)),
            }
        }
        self.updates.acknowledge().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::broker::{MemoryTransport, Producer};

    struct ScriptedSink {
        failures: Vec<ReportError>,
        attempts: u32,
        delivered: Vec<Vec<u8>>,
    }

    impl ScriptedSink {
        fn failing_with(failures: Vec<ReportError>) -> Self {
            Self {
                failures,
                attempts: 0,
                delivered: Vec::new(),
            }
        }

        fn reliable() -> Self {
            Self::failing_with(Vec::new())
        }
    }

    #[async_trait]
    impl ReportSink for ScriptedSink {
        async fn send_report(&mut self, report: &[u8]) -> Result<(), ReportError> {
            self.attempts += 1;
            if self.failures.is_empty() {
                self.delivered.push(report.to_vec());
                return Ok(());
            }
            Err(self.failures.remove(0))
        }
    }

    fn temporary_failures(count: usize) -> Vec<ReportError> {
        (0..count)
            .map(|n| ReportError::Temporary(format!("outage {n}")))
            .collect()
    }

    async fn service(
        transport: &Arc<MemoryTransport>,
        sink: ScriptedSink,
    ) -> UpdateService<ScriptedSink> {
        let consumer = Consumer::register(transport.clone(), "updates", "reporters", "updater-1")
            .await
            .expect("register");
        UpdateService::new(consumer, sink).with_retry_delay(Duration::ZERO)
    }

    async fn append_update(transport: &Arc<MemoryTransport>) {
        Producer::new(transport.clone(), "updates")
            .append("{\"status\":\"running\"}")
            .await
            .expect("append");
    }

    #[tokio::test]
    async fn test_successful_delivery_forwards_the_payload() {
        let transport = Arc::new(MemoryTransport::new());
        let mut service = service(&transport, ScriptedSink::reliable()).await;
        append_update(&transport).await;

        service.process_one_update().await.expect("cycle");

        assert_eq!(service.sink.attempts, 1);
        assert_eq!(service.sink.delivered, vec![b"{\"status\":\"running\"}".to_vec()]);
        assert!(service.updates.read_message().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_is_a_quiet_cycle() {
        let transport = Arc::new(MemoryTransport::new());
        let mut service = service(&transport, ScriptedSink::reliable()).await;

        service.process_one_update().await.expect("cycle");

        assert_eq!(service.sink.attempts, 0);
    }

    #[tokio::test]
    async fn test_persistent_temporary_failure_gets_exactly_twelve_attempts() {
        let transport = Arc::new(MemoryTransport::new());
        let mut service = service(&transport, ScriptedSink::failing_with(temporary_failures(13))).await;
        append_update(&transport).await;

        service.process_one_update().await.expect("cycle");

        assert_eq!(service.sink.attempts, 12);
        // Dropped, acknowledged, gone.
        assert!(service.updates.read_message().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_recovery_mid_retry_stops_the_loop() {
        let transport = Arc::new(MemoryTransport::new());
        let mut service = service(&transport, ScriptedSink::failing_with(temporary_failures(3))).await;
        append_update(&transport).await;

        service.process_one_update().await.expect("cycle");

        assert_eq!(service.sink.attempts, 4);
        assert_eq!(service.sink.delivered.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let transport = Arc::new(MemoryTransport::new());
        let sink = ScriptedSink::failing_with(vec![ReportError::Permanent("job deleted".into())]);
        let mut service = service(&transport, sink).await;
        append_update(&transport).await;

        service.process_one_update().await.expect("cycle");

        assert_eq!(service.sink.attempts, 1);
        assert!(service.updates.read_message().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_unclassified_failure_propagates_without_acknowledgment() {
        let transport = Arc::new(MemoryTransport::new());
        let sink =
            ScriptedSink::failing_with(vec![anyhow::anyhow!("sink exploded").into()]);
        let mut service = service(&transport, sink).await;
        append_update(&transport).await;

        let err = service.process_one_update().await.expect_err("should fail");
        assert!(matches!(err, UpdateError::Sink(_)));

        // The message is still pending for this consumer identity and
        // comes back first after a restart.
        let consumer = Consumer::register(transport.clone(), "updates", "reporters", "updater-1")
            .await
            .expect("register");
        let mut restarted = UpdateService::new(consumer, ScriptedSink::reliable())
            .with_retry_delay(Duration::ZERO);
        restarted.process_one_update().await.expect("cycle");
        assert_eq!(restarted.sink.attempts, 1);
    }
}
