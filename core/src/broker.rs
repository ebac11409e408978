//! Broker abstraction: publish/subscribe over named topics with explicit
//! acknowledgement.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   publish(topic, msg)   ┌──────────────────────────┐
//! │  Publisher  │ ──────────────────────► │          Broker          │
//! └─────────────┘                         │  topic ─┬─ group A ───┐  │
//!                                         │         └─ group B ─┐ │  │
//!                                         └─────────────────────┼─┼──┘
//!                        subscribe(topic, group)                │ │
//!                   ┌───────────────────────────────────────────┘ │
//!                   ▼                                             ▼
//!            DeliveryStream (B)                           DeliveryStream (A)
//!                   │                                             │
//!             ack() / nack()                                ack() / nack()
//! ```
//!
//! # Delivery semantics
//!
//! - **At-least-once**: a copy that is nacked, dropped unsettled, or (for
//!   stream brokers) left unsettled past its visibility window is delivered
//!   again. Handlers must be idempotent.
//! - **Consumer groups**: consumers subscribed with the same group split the
//!   topic between them; every distinct group gets its own copy of every
//!   message.
//! - **One terminal state per attempt**: [`Delivery::ack`] and
//!   [`Delivery::nack`] consume the delivery.
//!
//! # Implementations
//!
//! - [`MemoryQueue`](crate::memory::MemoryQueue) - bounded in-process buffers
//! - [`MemoryStream`](crate::memory::MemoryStream) - in-process append-only log
//!   with per-group cursors and leases
//! - `RedpandaBroker` (courier-redpanda crate) - Kafka-compatible durable stream
//!
//! # Dyn Compatibility
//!
//! The traits return explicit `Pin<Box<dyn Future>>` values instead of using
//! `async fn` so they can be used as `Arc<dyn Publisher>` and
//! `Arc<dyn Subscriber>`.

use crate::message::Message;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or configured.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publishing a message to a topic failed.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that was published to
        topic: String,
        /// Why the publish failed
        reason: String,
    },

    /// Subscribing to a topic failed.
    #[error("Subscription to '{topic}' for group '{consumer_group}' failed: {reason}")]
    SubscriptionFailed {
        /// The topic
        topic: String,
        /// The consumer group
        consumer_group: String,
        /// Why the subscription failed
        reason: String,
    },

    /// A message could not be encoded or decoded for the wire.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A bounded operation did not finish in time (e.g. publish under
    /// backpressure).
    #[error("Timed out publishing to topic '{0}'")]
    Timeout(String),

    /// The broker or the subscription was closed.
    #[error("Broker closed")]
    Closed,
}

/// Boxed future returned by broker trait methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Infinite, non-restartable stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// A topic plus the consumer group consuming it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Topic to consume
    pub topic: String,
    /// Consumer group the consumer belongs to
    pub consumer_group: String,
}

impl Subscription {
    /// Create a subscription.
    #[must_use]
    pub fn new(topic: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.consumer_group, self.topic)
    }
}

/// Publishing half of a broker.
///
/// Implementations must be safe for concurrent use from request handlers and
/// consumption loops.
pub trait Publisher: Send + Sync {
    /// Publish `message` to `topic`.
    ///
    /// May wait under backpressure, but only for a bounded time.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`], [`BrokerError::Timeout`] or
    /// [`BrokerError::Closed`] when the message was not accepted.
    fn publish(&self, topic: &str, message: Message) -> BrokerFuture<'_, ()>;
}

/// Consuming half of a broker.
pub trait Subscriber: Send + Sync {
    /// Attach a consumer to `subscription`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the consumer cannot be
    /// created.
    fn subscribe(&self, subscription: &Subscription) -> BrokerFuture<'_, DeliveryStream>;
}

/// Acknowledgement state of one delivered copy of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckState {
    /// Delivered (or waiting to be) and not yet settled
    Pending,
    /// Processed; removed from the broker
    Acked,
    /// Rejected; eligible for redelivery
    Nacked,
}

/// Broker-side settlement hook carried by a [`Delivery`].
pub trait Acknowledger: Send {
    /// The copy was processed.
    fn ack(self: Box<Self>);

    /// The copy was rejected and should be redelivered.
    fn nack(self: Box<Self>);
}

/// One delivered copy of a message, owned by the consumer until settled.
///
/// Dropping a delivery without settling it nacks it, which hands the message
/// back to the broker.
pub struct Delivery {
    message: Message,
    attempt: u32,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Wrap a message delivered for the `attempt`-th time (1-based).
    #[must_use]
    pub fn new(message: Message, attempt: u32, acknowledger: impl Acknowledger + 'static) -> Self {
        Self {
            message,
            attempt,
            acknowledger: Some(Box::new(acknowledger)),
        }
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// How many times this message has been delivered to the group,
    /// including this delivery.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Mark the message as processed.
    pub fn ack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.ack();
        }
    }

    /// Reject the message so the broker redelivers it.
    pub fn nack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.nack();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            tracing::warn!(
                message_id = %self.message.id(),
                attempt = self.attempt,
                "Delivery dropped without ack or nack, returning it to the broker"
            );
            acknowledger.nack();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("attempt", &self.attempt)
            .field("settled", &self.acknowledger.is_none())
            .finish()
    }
}
