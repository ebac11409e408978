//! Integration tests for [`RedpandaBroker`] against a real Kafka instance.
//!
//! These tests use testcontainers to start Kafka and check:
//! - Publish/subscribe round-trip with id and metadata intact
//! - Fan-out across consumer groups
//! - Nack redelivery with an incremented attempt count
//! - Acked offsets are committed for the group
//!
//! # Running These Tests
//!
//! They are `#[ignore]`d by default because they need Docker and take a while
//! to start Kafka:
//!
//! ```bash
//! cargo test -p courier-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use courier_core::broker::{DeliveryStream, Publisher, Subscriber, Subscription};
use courier_core::correlation::CORRELATION_ID_KEY;
use courier_core::message::Message;
use courier_redpanda::RedpandaBroker;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, RedpandaBroker) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let broker = RedpandaBroker::new(&format!("{host}:{port}")).expect("Failed to create broker");

    wait_for_kafka_ready(&broker).await;
    (kafka, broker)
}

/// Publish to a warmup topic until the cluster accepts writes.
async fn wait_for_kafka_ready(broker: &RedpandaBroker) {
    for _ in 0..60 {
        if broker
            .publish("warmup", Message::new(vec![0]))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("Kafka failed to become ready");
}

async fn next_delivery(stream: &mut DeliveryStream) -> courier_core::broker::Delivery {
    tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended")
}

#[tokio::test]
#[ignore = "needs Docker"]
async fn round_trip_keeps_id_and_metadata() {
    let (_kafka, broker) = start_kafka().await;

    let message = Message::new(br#"{"ticket_id":"T1"}"#.to_vec())
        .with_metadata(CORRELATION_ID_KEY, "req-1");
    broker.publish("round-trip", message.clone()).await.unwrap();

    let mut stream = broker
        .subscribe(&Subscription::new("round-trip", "round-trip-group"))
        .await
        .unwrap();

    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.message(), &message);
    assert_eq!(delivery.attempt(), 1);
    delivery.ack();
}

#[tokio::test]
#[ignore = "needs Docker"]
async fn every_group_receives_every_message() {
    let (_kafka, broker) = start_kafka().await;

    let message = Message::new(b"fan-out".to_vec());
    broker.publish("fan-out", message.clone()).await.unwrap();

    let mut receipts = broker
        .subscribe(&Subscription::new("fan-out", "issue-receipt"))
        .await
        .unwrap();
    let mut tracker = broker
        .subscribe(&Subscription::new("fan-out", "append-to-tracker"))
        .await
        .unwrap();

    let first = next_delivery(&mut receipts).await;
    let second = next_delivery(&mut tracker).await;
    assert_eq!(first.message().id(), message.id());
    assert_eq!(second.message().id(), message.id());
    first.ack();
    second.ack();
}

#[tokio::test]
#[ignore = "needs Docker"]
async fn nacked_record_is_redelivered_with_next_attempt() {
    let (_kafka, broker) = start_kafka().await;

    let message = Message::new(b"retry-me".to_vec());
    broker.publish("redelivery", message.clone()).await.unwrap();

    let mut stream = broker
        .subscribe(&Subscription::new("redelivery", "redelivery-group"))
        .await
        .unwrap();

    let first = next_delivery(&mut stream).await;
    assert_eq!(first.attempt(), 1);
    first.nack();

    let second = next_delivery(&mut stream).await;
    assert_eq!(second.message().id(), message.id());
    assert_eq!(second.attempt(), 2);
    second.ack();
}

#[tokio::test]
#[ignore = "needs Docker"]
async fn acked_offsets_survive_a_new_consumer() {
    let (_kafka, broker) = start_kafka().await;
    let subscription = Subscription::new("commits", "commits-group");

    let first = Message::new(b"first".to_vec());
    let second = Message::new(b"second".to_vec());
    broker.publish("commits", first.clone()).await.unwrap();
    broker.publish("commits", second.clone()).await.unwrap();

    {
        let mut stream = broker.subscribe(&subscription).await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.message().id(), first.id());
        delivery.ack();
        // Let the async commit reach the group coordinator.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let mut stream = broker.subscribe(&subscription).await.unwrap();
    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.message().id(), second.id());
    delivery.ack();
}
