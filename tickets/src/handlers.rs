//! Message handlers for the ticket tasks.
//!
//! Each handler decodes its payload, makes exactly one client call and maps
//! the outcome onto [`HandlerError`]: a payload that does not decode is a
//! [`HandlerError::Decode`] (dead-lettered, never retried) and a client
//! failure is a [`HandlerError::Transient`] (retried).

use crate::clients::{IssueReceiptRequest, ReceiptsClient, SpreadsheetsClient};
use crate::events::{AppendToTrackerPayload, IssueReceiptPayload, OrderConfirmed, PaymentCompleted};
use async_trait::async_trait;
use courier_core::handler::{HandlerError, HandlerResult, MessageHandler};
use courier_core::message::Message;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Sheet of confirmed tickets waiting to be printed.
pub const TICKETS_TO_PRINT: &str = "tickets-to-print";
/// Sheet of canceled tickets waiting to be refunded.
pub const TICKETS_TO_REFUND: &str = "tickets-to-refund";

fn decode<T: DeserializeOwned>(message: &Message) -> Result<T, HandlerError> {
    serde_json::from_slice(message.payload()).map_err(HandlerError::decode)
}

/// Issues a receipt for a ticket.
pub struct IssueReceipt {
    receipts: Arc<dyn ReceiptsClient>,
}

impl IssueReceipt {
    /// Create the handler.
    #[must_use]
    pub fn new(receipts: Arc<dyn ReceiptsClient>) -> Self {
        Self { receipts }
    }
}

#[async_trait]
impl MessageHandler for IssueReceipt {
    async fn handle(&self, message: Message) -> HandlerResult {
        let payload: IssueReceiptPayload = decode(&message)?;

        self.receipts
            .issue_receipt(IssueReceiptRequest {
                ticket_id: payload.ticket_id,
                price: payload.price,
            })
            .await
            .map_err(HandlerError::transient)?;

        Ok(Vec::new())
    }
}

/// Appends a ticket row to one tracker sheet.
pub struct AppendToTracker {
    spreadsheets: Arc<dyn SpreadsheetsClient>,
    sheet: String,
}

impl AppendToTracker {
    /// Create the handler for `sheet`.
    #[must_use]
    pub fn new(spreadsheets: Arc<dyn SpreadsheetsClient>, sheet: impl Into<String>) -> Self {
        Self {
            spreadsheets,
            sheet: sheet.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for AppendToTracker {
    async fn handle(&self, message: Message) -> HandlerResult {
        let payload: AppendToTrackerPayload = decode(&message)?;

        self.spreadsheets
            .append_row(&self.sheet, payload.into_row())
            .await
            .map_err(HandlerError::transient)?;

        Ok(Vec::new())
    }
}

/// Turns `PaymentCompleted` into `OrderConfirmed`.
///
/// The produced message keeps the metadata (and so the correlation id) of
/// the payment message.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderConfirmation;

#[async_trait]
impl MessageHandler for OrderConfirmation {
    async fn handle(&self, message: Message) -> HandlerResult {
        let payment: PaymentCompleted = decode(&message)?;
        let confirmed = OrderConfirmed::from(payment);
        let payload = serde_json::to_vec(&confirmed).map_err(HandlerError::decode)?;

        Ok(vec![message.derive(payload)])
    }
}
