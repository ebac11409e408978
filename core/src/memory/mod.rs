//! In-process brokers.
//!
//! Two strategies with the same [`Publisher`](crate::broker::Publisher) /
//! [`Subscriber`](crate::broker::Subscriber) contract:
//!
//! - [`MemoryQueue`]: one bounded FIFO buffer per (topic, consumer group).
//!   Publishing waits for free space (backpressure), nothing is persisted.
//! - [`MemoryStream`]: an append-only log per topic with a cursor, a pending
//!   list and leases per consumer group, so groups can replay a topic from
//!   different positions and unsettled messages come back after a visibility
//!   window.
//!
//! Both are suitable for single-process deployments and for tests.

mod queue;
mod stream;

pub use queue::{MemoryQueue, QueueConfig};
pub use stream::{MemoryStream, StartFrom, StreamConfig};

/// Settlement counters for one consumer group of one topic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Copies handed to consumers (redeliveries included)
    pub delivered: u64,
    /// Copies acknowledged
    pub acked: u64,
    /// Copies negatively acknowledged
    pub nacked: u64,
}
