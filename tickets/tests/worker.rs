//! End-to-end worker scenarios on the in-process stream broker.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

mod common;

use common::{Harness, ticket};
use courier_core::broker::{Publisher, Subscriber, Subscription};
use courier_core::correlation::CORRELATION_ID_KEY;
use courier_core::message::Message;
use courier_runtime::router::{DEAD_LETTER_REASON_KEY, DEAD_LETTER_TOPIC_KEY};
use courier_testing::helpers::wait_until;
use futures::StreamExt;
use std::time::Duration;
use tickets::clients::IssueReceiptRequest;
use tickets::events::{
    ORDER_CONFIRMED, OrderConfirmed, PAYMENT_COMPLETED, PaymentCompleted, Price, TicketEvent,
    TicketStatus,
};
use tickets::handlers::{TICKETS_TO_PRINT, TICKETS_TO_REFUND};
use tickets::worker::{ISSUE_RECEIPT_TOPIC, Task, WorkerConfig};

const WAIT: Duration = Duration::from_secs(30);

fn ten_dollars() -> Price {
    Price {
        amount: "10.00".to_string(),
        currency: "USD".to_string(),
    }
}

/// Read the next message of `topic` through a fresh probe group.
async fn first_message_on(harness: &Harness, topic: &str) -> Message {
    let mut stream = harness
        .broker
        .subscribe(&Subscription::new(topic, "test-probe"))
        .await
        .unwrap();
    let delivery = tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("no message on topic")
        .expect("stream ended");
    let message = delivery.message().clone();
    delivery.ack();
    message
}

#[tokio::test(start_paused = true)]
async fn confirmed_booking_issues_receipt_and_prints() {
    let harness = Harness::start(WorkerConfig::default()).await;

    harness
        .sender
        .publish_booking(&ticket("T1", TicketStatus::Confirmed), "corr-1")
        .await
        .unwrap();

    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.issued_receipts().len() == 1 && gateway.rows().len() == 1).await);

    assert_eq!(
        gateway.issued_receipts(),
        vec![IssueReceiptRequest {
            ticket_id: "T1".to_string(),
            price: ten_dollars(),
        }]
    );
    let (sheet, row) = gateway.rows()[0].request.clone();
    assert_eq!(sheet, TICKETS_TO_PRINT);
    assert_eq!(row, vec!["T1", "t1@example.com", "10.00", "USD"]);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn canceled_booking_goes_to_refund_sheet_without_receipt() {
    let harness = Harness::start(WorkerConfig::default()).await;

    harness
        .sender
        .publish_booking(&ticket("T2", TicketStatus::Canceled), "corr-2")
        .await
        .unwrap();

    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.rows().len() == 1).await);
    assert_eq!(gateway.rows()[0].request.0, TICKETS_TO_REFUND);

    // Give a stray receipt every chance to show up.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(gateway.receipts().is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn tasks_sent_directly_are_processed_once_each() {
    let harness = Harness::start(WorkerConfig::default()).await;
    let event = TicketEvent::new(&ticket("T3", TicketStatus::Confirmed), "corr-3");

    harness.sender.send(Task::IssueReceipt, &event).await.unwrap();
    harness.sender.send(Task::AppendToTracker, &event).await.unwrap();

    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.issued_receipts().len() == 1 && gateway.rows().len() == 1).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gateway.receipts().len(), 1);
    assert_eq!(gateway.rows().len(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn flaky_receipts_service_is_retried_with_backoff() {
    let harness = Harness::start(WorkerConfig::default()).await;
    harness.gateway.fail_receipts(2);
    let event = TicketEvent::new(&ticket("T4", TicketStatus::Confirmed), "corr-4");

    harness.sender.send(Task::IssueReceipt, &event).await.unwrap();

    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.issued_receipts().len() == 1).await);

    let calls = gateway.receipts();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].at - calls[0].at >= Duration::from_millis(100));
    assert!(calls[2].at - calls[1].at >= Duration::from_millis(200));

    let sub = Subscription::new(ISSUE_RECEIPT_TOPIC, "issue-receipt");
    let broker = harness.broker.clone();
    assert!(wait_until(WAIT, || broker.stats(&sub).acked == 1).await);
    assert_eq!(broker.stats(&sub).nacked, 0);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn correlation_id_reaches_the_clients() {
    let harness = Harness::start(WorkerConfig::default()).await;

    harness
        .sender
        .publish_booking(&ticket("T5", TicketStatus::Confirmed), "corr-5")
        .await
        .unwrap();

    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.issued_receipts().len() == 1 && gateway.rows().len() == 1).await);
    assert_eq!(gateway.receipts()[0].correlation_id.as_deref(), Some("corr-5"));
    assert_eq!(gateway.rows()[0].correlation_id.as_deref(), Some("corr-5"));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn missing_correlation_id_is_generated() {
    let harness = Harness::start(WorkerConfig::default()).await;
    let event = TicketEvent::new(&ticket("T6", TicketStatus::Confirmed), "");

    harness.sender.send(Task::IssueReceipt, &event).await.unwrap();

    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.issued_receipts().len() == 1).await);
    let correlation_id = gateway.receipts()[0].correlation_id.clone().unwrap();
    assert!(!correlation_id.is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_task_is_dead_lettered_and_the_next_one_processed() {
    let harness = Harness::start(WorkerConfig::default()).await;

    let malformed = Message::new(b"not json".to_vec()).with_metadata(CORRELATION_ID_KEY, "corr-7");
    harness
        .broker
        .publish(ISSUE_RECEIPT_TOPIC, malformed.clone())
        .await
        .unwrap();

    let dead = first_message_on(&harness, "dead-letter").await;
    assert_eq!(dead.payload(), malformed.payload());
    assert_eq!(dead.correlation_id(), Some("corr-7"));
    assert_eq!(dead.metadata_value(DEAD_LETTER_TOPIC_KEY), Some(ISSUE_RECEIPT_TOPIC));
    assert!(dead.metadata_value(DEAD_LETTER_REASON_KEY).is_some());
    assert!(harness.gateway.receipts().is_empty());

    let event = TicketEvent::new(&ticket("T7", TicketStatus::Confirmed), "corr-8");
    harness.sender.send(Task::IssueReceipt, &event).await.unwrap();
    let gateway = harness.gateway.clone();
    assert!(wait_until(WAIT, || gateway.issued_receipts().len() == 1).await);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn completed_payment_confirms_the_order() {
    let harness = Harness::start(WorkerConfig::default()).await;

    let payment = PaymentCompleted {
        payment_id: "P1".to_string(),
        order_id: "O1".to_string(),
        completed_at: "2024-05-01T10:00:00Z".to_string(),
    };
    let message = Message::new(serde_json::to_vec(&payment).unwrap())
        .with_metadata(CORRELATION_ID_KEY, "corr-9");
    harness.broker.publish(PAYMENT_COMPLETED, message).await.unwrap();

    let confirmed = first_message_on(&harness, ORDER_CONFIRMED).await;
    let order: OrderConfirmed = serde_json::from_slice(confirmed.payload()).unwrap();
    assert_eq!(order.order_id, "O1");
    assert_eq!(order.confirmed_at, "2024-05-01T10:00:00Z");
    assert_eq!(confirmed.correlation_id(), Some("corr-9"));

    harness.stop().await;
}
