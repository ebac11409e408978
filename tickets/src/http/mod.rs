//! HTTP port of the tickets service.
//!
//! - `GET /health`: liveness, always `ok`
//! - `POST /tickets-status`: one booking event per ticket; the booking topics
//!   fan out to the receipt and tracker tasks
//! - `POST /tickets-confirmation`: both tasks for every ticket, enqueued
//!   directly
//! - `GET /metrics`: Prometheus text, when metrics are enabled
//!
//! The request's `Correlation-ID` header (or a fresh id) is attached to every
//! message enqueued for it. A 200 means the messages were accepted by the
//! broker, not that receipts were issued.
//!
//! A batch is not atomic. Payloads are validated before anything is sent, but
//! a broker failure partway through returns a 500 with the earlier tickets
//! already enqueued. Clients retry the whole batch, so handlers see those
//! tickets again.

mod error;

pub use error::AppError;

use crate::clients::CORRELATION_ID_HEADER;
use crate::events::{Ticket, TicketEvent};
use crate::worker::{Task, TaskSender};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_core::correlation::new_correlation_id;
use courier_runtime::metrics::MetricsExporter;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    sender: TaskSender,
    metrics: Option<MetricsExporter>,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub const fn new(sender: TaskSender, metrics: Option<MetricsExporter>) -> Self {
        Self { sender, metrics }
    }
}

/// Body of the ticket endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketsRequest {
    /// Tickets to process
    pub tickets: Vec<Ticket>,
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tickets-status", post(tickets_status))
        .route("/tickets-confirmation", post(tickets_confirmation))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map_or_else(new_correlation_id, str::to_string)
}

async fn health() -> &'static str {
    "ok"
}

async fn tickets_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TicketsRequest>,
) -> Result<StatusCode, AppError> {
    let correlation_id = correlation_id(&headers);
    tracing::info!(
        correlation_id = %correlation_id,
        tickets = request.tickets.len(),
        "Publishing booking events"
    );

    for ticket in &request.tickets {
        state.sender.publish_booking(ticket, &correlation_id).await?;
    }
    Ok(StatusCode::OK)
}

async fn tickets_confirmation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TicketsRequest>,
) -> Result<StatusCode, AppError> {
    let correlation_id = correlation_id(&headers);
    tracing::info!(
        correlation_id = %correlation_id,
        tickets = request.tickets.len(),
        "Enqueuing ticket tasks"
    );

    let events: Vec<_> = request
        .tickets
        .iter()
        .map(|ticket| TicketEvent::new(ticket, correlation_id.as_str()))
        .collect();
    let tasks = events
        .iter()
        .flat_map(|event| [(Task::IssueReceipt, event), (Task::AppendToTracker, event)]);

    state.sender.send_all(tasks).await?;
    Ok(StatusCode::OK)
}

async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state
        .metrics
        .as_ref()
        .map(MetricsExporter::render)
        .ok_or_else(|| AppError::not_found("Metrics are disabled"))
}
