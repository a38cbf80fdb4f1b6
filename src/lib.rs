//! taskforge: distributed task queue over an ordered stream transport.
//!
//! Work enters through a task ingress, travels over Redis Streams with
//! consumer-group at-least-once delivery, is executed by single-task
//! workers as subprocesses with rate-limited output streaming, and has
//! its status relayed to external report sinks with bounded retry. Two
//! capacity-bounded read-side stores aggregate the newest records for
//! monitoring.

// Core modules
pub mod broker;
pub mod cli;
pub mod ingress;
pub mod monitor;
pub mod records;
pub mod update;
pub mod worker;

// Re-export commonly used error types
pub use broker::BrokerError;
pub use ingress::IngressError;
pub use records::TaskError;
pub use update::{ReportError, UpdateError};
pub use worker::WorkerError;
