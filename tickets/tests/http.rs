//! HTTP port behaviour, driven through the axum router without a socket.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use common::ticket;
use courier_runtime::metrics::{MetricsExporter, builder};
use courier_testing::RecordingPublisher;
use serde_json::{Value, json};
use std::sync::Arc;
use tickets::events::{
    AppendToTrackerPayload, IssueReceiptPayload, TICKET_BOOKING_CANCELED, TICKET_BOOKING_CONFIRMED,
    TicketEvent, TicketStatus,
};
use tickets::http::{AppState, TicketsRequest, router};
use tickets::worker::{APPEND_TO_TRACKER_TOPIC, ISSUE_RECEIPT_TOPIC, TaskSender};
use tower::ServiceExt;

fn state(publisher: &RecordingPublisher) -> AppState {
    AppState::new(TaskSender::new(Arc::new(publisher.clone())), None)
}

async fn post(state: AppState, path: &str, body: &TicketsRequest, correlation_id: Option<&str>) -> Response {
    let mut request = Request::post(path).header(header::CONTENT_TYPE, "application/json");
    if let Some(id) = correlation_id {
        request = request.header("Correlation-ID", id);
    }
    let request = request
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    router(state).oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let response = router(state(&RecordingPublisher::new()))
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

#[tokio::test]
async fn confirmation_enqueues_both_tasks_with_request_correlation_id() {
    let publisher = RecordingPublisher::new();
    let request = TicketsRequest {
        tickets: vec![ticket("T1", TicketStatus::Confirmed)],
    };

    let response = post(state(&publisher), "/tickets-confirmation", &request, Some("corr-http")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let published = publisher.published();
    assert_eq!(published.len(), 2);
    assert!(
        published
            .iter()
            .all(|(_, message)| message.correlation_id() == Some("corr-http"))
    );

    let receipt = &publisher.messages_on(ISSUE_RECEIPT_TOPIC)[0];
    let receipt: IssueReceiptPayload = serde_json::from_slice(receipt.payload()).unwrap();
    assert_eq!(receipt.ticket_id, "T1");

    let row = &publisher.messages_on(APPEND_TO_TRACKER_TOPIC)[0];
    let row: AppendToTrackerPayload = serde_json::from_slice(row.payload()).unwrap();
    assert_eq!(row.customer_email, "t1@example.com");
}

#[tokio::test]
async fn missing_correlation_header_gets_a_fresh_id_per_request() {
    let publisher = RecordingPublisher::new();
    let request = TicketsRequest {
        tickets: vec![ticket("T1", TicketStatus::Confirmed)],
    };

    post(state(&publisher), "/tickets-confirmation", &request, None).await;
    post(state(&publisher), "/tickets-confirmation", &request, None).await;

    let ids: Vec<String> = publisher
        .published()
        .iter()
        .map(|(_, message)| message.correlation_id().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[0], ids[2]);
}

#[tokio::test]
async fn status_publishes_one_booking_event_per_ticket() {
    let publisher = RecordingPublisher::new();
    let request = TicketsRequest {
        tickets: vec![
            ticket("T1", TicketStatus::Confirmed),
            ticket("T2", TicketStatus::Canceled),
        ],
    };

    let response = post(state(&publisher), "/tickets-status", &request, Some("corr-status")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let confirmed = publisher.messages_on(TICKET_BOOKING_CONFIRMED);
    let canceled = publisher.messages_on(TICKET_BOOKING_CANCELED);
    assert_eq!(confirmed.len(), 1);
    assert_eq!(canceled.len(), 1);

    let event: TicketEvent = serde_json::from_slice(canceled[0].payload()).unwrap();
    assert_eq!(event.ticket_id, "T2");
    assert_eq!(event.meta.correlation_id, "corr-status");
}

#[tokio::test]
async fn unknown_status_is_rejected() {
    let body = json!({
        "tickets": [{
            "ticket_id": "T1",
            "status": "lost",
            "customer_email": "t1@example.com",
            "price": {"amount": "10.00", "currency": "USD"}
        }]
    });
    let request = Request::post("/tickets-status")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let publisher = RecordingPublisher::new();
    let response = router(state(&publisher)).oneshot(request).await.unwrap();

    assert!(response.status().is_client_error());
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn broker_failure_is_a_json_500() {
    let publisher = RecordingPublisher::new();
    publisher.fail_next(1);
    let request = TicketsRequest {
        tickets: vec![ticket("T1", TicketStatus::Confirmed)],
    };

    let response = post(state(&publisher), "/tickets-confirmation", &request, None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "INTERNAL_SERVER_ERROR");
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .starts_with("Failed to enqueue tasks")
    );
}

#[tokio::test]
async fn broker_failure_mid_batch_keeps_earlier_tickets_enqueued() {
    let publisher = RecordingPublisher::new();
    publisher.fail_after(2, 1);
    let request = TicketsRequest {
        tickets: vec![
            ticket("T1", TicketStatus::Confirmed),
            ticket("T2", TicketStatus::Confirmed),
        ],
    };

    let response = post(state(&publisher), "/tickets-confirmation", &request, Some("batch-1")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let published = publisher.published();
    let topics: Vec<_> = published.iter().map(|(topic, _)| topic.as_str()).collect();
    assert_eq!(topics, [ISSUE_RECEIPT_TOPIC, APPEND_TO_TRACKER_TOPIC]);
    let receipt: IssueReceiptPayload = serde_json::from_slice(published[0].1.payload()).unwrap();
    assert_eq!(receipt.ticket_id, "T1");
}

#[tokio::test]
async fn metrics_are_not_found_when_disabled() {
    let response = router(state(&RecordingPublisher::new()))
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_render_prometheus_text_when_enabled() {
    let recorder = builder().unwrap().build_recorder();
    let exporter = MetricsExporter::from_handle(recorder.handle());
    metrics::with_local_recorder(&recorder, || {
        metrics::counter!("tickets_test_requests_total").increment(3);
    });

    let state = AppState::new(TaskSender::new(Arc::new(RecordingPublisher::new())), Some(exporter));
    let response = router(state)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("tickets_test_requests_total 3"));
}
