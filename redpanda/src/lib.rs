//! Redpanda broker for Courier.
//!
//! [`RedpandaBroker`] implements the [`Publisher`] and [`Subscriber`] traits
//! from `courier-core` over any Kafka-compatible cluster (Redpanda, Apache
//! Kafka, MSK, ...) using rdkafka.
//!
//! # Wire format
//!
//! - The record payload is the message payload, untouched.
//! - Every metadata entry becomes a record header. The message id travels in
//!   the [`MESSAGE_ID_HEADER`] header.
//! - The record key is the correlation id (or the message id when there is
//!   none), so every message of one request lands on the same partition.
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual offset commits:
//! - Each subscription gets its own consumer with `group.id` set to the
//!   subscription's consumer group, so groups fan out and members of one group
//!   split the partitions between them.
//! - Ack commits the record's offset.
//! - Nack (or dropping the delivery) seeks the partition back to the record,
//!   which is then read again with the attempt count incremented.
//! - The consumer task waits for each delivery to be settled before reading
//!   the next record. Attempt counts live in that task and restart at 1 after
//!   a process restart or a partition rebalance.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::broker::{Publisher, Subscriber, Subscription};
//! use courier_core::message::Message;
//! use courier_redpanda::RedpandaBroker;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::new("localhost:9092")?;
//!
//! broker
//!     .publish("issue-receipt", Message::new(br#"{"ticket_id":"T1"}"#.to_vec()))
//!     .await?;
//!
//! let mut deliveries = broker
//!     .subscribe(&Subscription::new("issue-receipt", "issue-receipt"))
//!     .await?;
//! while let Some(delivery) = deliveries.next().await {
//!     println!("Received {}", delivery.message().id());
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use courier_core::broker::{
    Acknowledger, BrokerError, BrokerFuture, Delivery, DeliveryStream, Publisher, Subscriber,
    Subscription,
};
use courier_core::message::{Message, Metadata};
use futures::StreamExt;
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Record header carrying the message id.
pub const MESSAGE_ID_HEADER: &str = "message_id";

const DEFAULT_ACKS: &str = "1";
const DEFAULT_COMPRESSION: &str = "none";
const DEFAULT_OFFSET_RESET: &str = "earliest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-compatible broker.
///
/// # Example
///
/// ```no_run
/// use courier_redpanda::RedpandaBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    auto_offset_reset: String,
}

impl RedpandaBroker {
    /// Create a broker with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be
    /// created (invalid configuration).
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// The bootstrap servers this broker talks to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn consumer(&self, subscription: &Subscription) -> Result<StreamConsumer, BrokerError> {
        let failed = |reason: String| BrokerError::SubscriptionFailed {
            topic: subscription.topic.clone(),
            consumer_group: subscription.consumer_group.clone(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &subscription.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[subscription.topic.as_str()])
            .map_err(|e| failed(format!("Failed to subscribe: {e}")))?;

        Ok(consumer)
    }
}

/// Builder for a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Comma-separated bootstrap servers, e.g. `"localhost:9092"`. Required.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"1"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Bound on a publish waiting in the producer queue, and on a seek.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where a consumer group with no committed offset starts reading:
    /// `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so tasks published before the worker's first
    /// start are not lost.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no brokers were set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let compression = self.compression.as_deref().unwrap_or(DEFAULT_COMPRESSION);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_OFFSET_RESET.to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "Redpanda broker created"
        );

        Ok(RedpandaBroker {
            producer,
            brokers,
            timeout,
            auto_offset_reset,
        })
    }
}

impl Publisher for RedpandaBroker {
    fn publish(&self, topic: &str, message: Message) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();

        Box::pin(async move {
            let key = message
                .correlation_id()
                .map_or_else(|| message.id().to_string(), str::to_string);
            let record = FutureRecord::to(&topic)
                .payload(message.payload())
                .key(key.as_bytes())
                .headers(encode_headers(&message));

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        message_id = %message.id(),
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(BrokerError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }
}

impl Subscriber for RedpandaBroker {
    fn subscribe(&self, subscription: &Subscription) -> BrokerFuture<'_, DeliveryStream> {
        let subscription = subscription.clone();

        Box::pin(async move {
            let consumer = self.consumer(&subscription)?;
            let timeout = self.timeout;

            tracing::info!(
                topic = %subscription.topic,
                consumer_group = %subscription.consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed"
            );

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(consume(consumer, tx, timeout));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(delivery) = rx.recv().await {
                    yield delivery;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Owns one consumer: reads a record, hands it out, applies the settlement.
async fn consume(consumer: StreamConsumer, tx: mpsc::Sender<Delivery>, timeout: Duration) {
    let mut stream = consumer.stream();
    let mut attempts: HashMap<(i32, i64), u32> = HashMap::new();

    loop {
        let next = tokio::select! {
            () = tx.closed() => break,
            next = stream.next() => next,
        };
        let record = match next {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to receive record");
                continue;
            },
            None => break,
        };

        let partition = record.partition();
        let offset = record.offset();

        let message = match decode(&record) {
            Ok(message) => message,
            Err(e) => {
                // Nothing downstream can handle a record we cannot decode.
                tracing::error!(
                    topic = record.topic(),
                    partition,
                    offset,
                    error = %e,
                    "Skipping undecodable record"
                );
                if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                    tracing::warn!(error = %e, "Failed to commit skipped record");
                }
                continue;
            },
        };

        let attempt = {
            let count = attempts.entry((partition, offset)).or_insert(0);
            *count += 1;
            *count
        };

        let (settle_tx, settle_rx) = oneshot::channel();
        let delivery = Delivery::new(message, attempt, KafkaAcknowledger { settle: settle_tx });
        if tx.send(delivery).await.is_err() {
            tracing::debug!("Subscriber dropped, stopping consumer");
            break;
        }

        match settle_rx.await {
            Ok(Settlement::Ack) => {
                attempts.remove(&(partition, offset));
                if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                    tracing::warn!(
                        topic = record.topic(),
                        partition,
                        offset,
                        error = %e,
                        "Failed to commit offset (message may be redelivered)"
                    );
                }
            },
            Ok(Settlement::Nack) | Err(_) => {
                if let Err(e) = consumer.seek(
                    record.topic(),
                    partition,
                    Offset::Offset(offset),
                    Timeout::After(timeout),
                ) {
                    tracing::warn!(
                        topic = record.topic(),
                        partition,
                        offset,
                        error = %e,
                        "Failed to seek back to nacked record"
                    );
                }
            },
        }
    }

    tracing::debug!("Consumer task exiting");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
}

struct KafkaAcknowledger {
    settle: oneshot::Sender<Settlement>,
}

impl Acknowledger for KafkaAcknowledger {
    fn ack(self: Box<Self>) {
        let _ = self.settle.send(Settlement::Ack);
    }

    fn nack(self: Box<Self>) {
        let _ = self.settle.send(Settlement::Nack);
    }
}

fn encode_headers(message: &Message) -> OwnedHeaders {
    let id = message.id().to_string();
    let headers = OwnedHeaders::new().insert(Header {
        key: MESSAGE_ID_HEADER,
        value: Some(id.as_bytes()),
    });

    message
        .metadata()
        .iter()
        .fold(headers, |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            })
        })
}

fn decode<M: KafkaMessage>(record: &M) -> Result<Message, BrokerError> {
    let mut id = None;
    let mut metadata = Metadata::new();

    if let Some(headers) = record.headers() {
        for header in headers.iter() {
            let Some(raw) = header.value else {
                continue;
            };
            let value = std::str::from_utf8(raw).map_err(|e| {
                BrokerError::Encoding(format!("header '{}' is not UTF-8: {e}", header.key))
            })?;

            if header.key == MESSAGE_ID_HEADER {
                let parsed = Uuid::parse_str(value).map_err(|e| {
                    BrokerError::Encoding(format!("invalid {MESSAGE_ID_HEADER} '{value}': {e}"))
                })?;
                id = Some(parsed);
            } else {
                metadata.insert(header.key.to_string(), value.to_string());
            }
        }
    }

    let id = id.unwrap_or_else(|| {
        tracing::debug!(
            topic = record.topic(),
            offset = record.offset(),
            "Record has no message id header, assigning one"
        );
        Uuid::new_v4()
    });
    let payload = record.payload().unwrap_or_default().to_vec();

    Ok(Message::with_id(id, payload).with_metadata_map(metadata))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use courier_core::correlation::CORRELATION_ID_KEY;
    use rdkafka::message::{OwnedMessage, Timestamp};

    fn record(payload: &[u8], headers: OwnedHeaders) -> OwnedMessage {
        OwnedMessage::new(
            Some(payload.to_vec()),
            None,
            "issue-receipt".to_string(),
            Timestamp::NotAvailable,
            0,
            42,
            Some(headers),
        )
    }

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = RedpandaBroker::builder().build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }

    #[test]
    fn id_and_metadata_travel_as_headers() {
        let message = Message::new(br#"{"ticket_id":"T1"}"#.to_vec())
            .with_metadata(CORRELATION_ID_KEY, "req-1")
            .with_metadata("tenant", "acme");

        let decoded = decode(&record(message.payload(), encode_headers(&message))).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn record_without_id_header_gets_a_fresh_id() {
        let headers = OwnedHeaders::new().insert(Header {
            key: CORRELATION_ID_KEY,
            value: Some("req-2".as_bytes()),
        });

        let decoded = decode(&record(b"{}", headers)).unwrap();

        assert_eq!(decoded.correlation_id(), Some("req-2"));
        assert_eq!(decoded.payload(), b"{}");
    }

    #[test]
    fn malformed_id_header_is_an_encoding_error() {
        let headers = OwnedHeaders::new().insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some("not-a-uuid".as_bytes()),
        });

        assert!(matches!(
            decode(&record(b"{}", headers)),
            Err(BrokerError::Encoding(_))
        ));
    }
}
