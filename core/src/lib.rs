//! # Courier Core
//!
//! Broker abstraction and message model for asynchronous task dispatch.
//!
//! This crate defines what flows through the system and how it is exchanged:
//!
//! - **Message**: opaque payload plus string metadata and a unique id
//! - **Publisher / Subscriber**: the two halves of a broker, addressed by
//!   topic and consumer group
//! - **Delivery**: one delivered copy of a message that must be acked or
//!   nacked
//! - **`MessageHandler`**: task-specific processing of one message
//!
//! Two in-process brokers live in [`memory`]. The Kafka-compatible broker is
//! in the `courier-redpanda` crate, and the router that drives handlers is in
//! `courier-runtime`.
//!
//! ## Example
//!
//! ```
//! use courier_core::broker::{Publisher, Subscriber, Subscription};
//! use courier_core::memory::MemoryStream;
//! use courier_core::message::Message;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryStream::default();
//! let mut deliveries = broker
//!     .subscribe(&Subscription::new("issue-receipt", "issue-receipt"))
//!     .await?;
//!
//! broker
//!     .publish("issue-receipt", Message::new(br#"{"ticket_id":"T1"}"#.to_vec()))
//!     .await?;
//!
//! if let Some(delivery) = deliveries.next().await {
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod correlation;
pub mod handler;
pub mod memory;
pub mod message;

pub use broker::{
    AckState, Acknowledger, BrokerError, BrokerFuture, Delivery, DeliveryStream, Publisher,
    Subscriber, Subscription,
};
pub use correlation::{CORRELATION_ID_KEY, current_correlation_id, new_correlation_id};
pub use handler::{HandlerError, HandlerResult, MessageHandler};
pub use message::{Message, Metadata};
