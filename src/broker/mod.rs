//! Messaging over an ordered, size-bounded log with consumer groups.
//!
//! This module provides the moving parts every other component is built
//! from:
//!
//! - **StreamTransport**: the storage contract (append, liveness,
//!   idempotent group registration, pending-entry reads, acknowledgment,
//!   reverse tail scans), implemented by `RedisTransport` for production
//!   and `MemoryTransport` for tests
//! - **Producer**: appends to one stream, rejecting oversized payloads
//! - **Consumer**: one outstanding message per consumer identity, with
//!   redelivery-before-new-delivery and explicit acknowledgment
//! - **BatchReader**: capacity-bounded reverse-scan cache for the
//!   read-mostly monitoring side
//!
//! # Delivery model
//!
//! Append order is the only cross-message ordering guarantee, and it
//! holds per stream only. A message delivered to a consumer stays in
//! the group's pending entry list until acknowledged; a consumer that
//! crashes mid-message resumes it on restart under the same identity.
//! That makes delivery at-least-once, which is the contract everything
//! downstream is written against.

pub mod batch;
pub mod consumer;
pub mod memory;
pub mod producer;
pub mod transport;

pub use batch::BatchReader;
pub use consumer::{Consumer, READ_BLOCK};
pub use memory::MemoryTransport;
pub use producer::{Producer, MAX_PAYLOAD_BYTES};
pub use transport::{
    BrokerError, Message, RedisTransport, StreamTransport, DEFAULT_MAX_STREAM_LEN,
};
