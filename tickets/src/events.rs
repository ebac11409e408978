//! Ticket domain events and task payloads.
//!
//! Everything here is JSON on the wire. Handlers decode only the fields they
//! need, so a full [`TicketEvent`] is also a valid payload for the narrower
//! [`IssueReceiptPayload`] and [`AppendToTrackerPayload`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic of confirmed bookings.
pub const TICKET_BOOKING_CONFIRMED: &str = "TicketBookingConfirmed";
/// Topic of canceled bookings.
pub const TICKET_BOOKING_CANCELED: &str = "TicketBookingCanceled";
/// Topic of completed payments, published by the payments service.
pub const PAYMENT_COMPLETED: &str = "payment-completed";
/// Topic of confirmed orders, derived from completed payments.
pub const ORDER_CONFIRMED: &str = "order-confirmed";

/// Money amount as the upstream systems send it (decimal string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Decimal amount, e.g. `"10.00"`
    pub amount: String,
    /// ISO currency code
    pub currency: String,
}

/// Booking status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    /// Booking went through
    Confirmed,
    /// Booking was canceled and must be refunded
    Canceled,
}

/// A ticket as received at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identifier
    pub ticket_id: String,
    /// Booking status
    pub status: TicketStatus,
    /// Customer e-mail address
    pub customer_email: String,
    /// Ticket price
    pub price: Price,
}

/// Event envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Unique event id
    pub id: String,
    /// RFC 3339 publication time
    pub published_at: String,
}

impl EventHeader {
    /// Fresh header stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            published_at: Utc::now().to_rfc3339(),
        }
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Event metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Correlation id of the request that produced the event
    pub correlation_id: String,
}

/// A booking event, immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketEvent {
    /// Envelope header
    pub header: EventHeader,
    /// Envelope metadata
    pub meta: EventMeta,
    /// Ticket identifier
    pub ticket_id: String,
    /// Customer e-mail address
    pub customer_email: String,
    /// Ticket price
    pub price: Price,
    /// Booking status
    pub status: TicketStatus,
}

impl TicketEvent {
    /// Build the event for `ticket` with a fresh header.
    #[must_use]
    pub fn new(ticket: &Ticket, correlation_id: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(),
            meta: EventMeta {
                correlation_id: correlation_id.into(),
            },
            ticket_id: ticket.ticket_id.clone(),
            customer_email: ticket.customer_email.clone(),
            price: ticket.price.clone(),
            status: ticket.status,
        }
    }

    /// The booking topic this event belongs on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self.status {
            TicketStatus::Confirmed => TICKET_BOOKING_CONFIRMED,
            TicketStatus::Canceled => TICKET_BOOKING_CANCELED,
        }
    }
}

/// Payload of the `issue-receipt` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReceiptPayload {
    /// Ticket identifier
    pub ticket_id: String,
    /// Amount to put on the receipt
    pub price: Price,
}

impl From<&TicketEvent> for IssueReceiptPayload {
    fn from(event: &TicketEvent) -> Self {
        Self {
            ticket_id: event.ticket_id.clone(),
            price: event.price.clone(),
        }
    }
}

/// Payload of the `append-to-tracker` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendToTrackerPayload {
    /// Ticket identifier
    pub ticket_id: String,
    /// Customer e-mail address
    pub customer_email: String,
    /// Ticket price
    pub price: Price,
}

impl From<&TicketEvent> for AppendToTrackerPayload {
    fn from(event: &TicketEvent) -> Self {
        Self {
            ticket_id: event.ticket_id.clone(),
            customer_email: event.customer_email.clone(),
            price: event.price.clone(),
        }
    }
}

impl AppendToTrackerPayload {
    /// The tracker row: ticket id, e-mail, amount, currency.
    #[must_use]
    pub fn into_row(self) -> Vec<String> {
        vec![
            self.ticket_id,
            self.customer_email,
            self.price.amount,
            self.price.currency,
        ]
    }
}

/// A payment finished on the payments side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    /// Payment identifier
    pub payment_id: String,
    /// Order the payment belongs to
    pub order_id: String,
    /// When the payment completed
    pub completed_at: String,
}

/// An order whose payment completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    /// Order identifier
    pub order_id: String,
    /// Confirmation time (the payment completion time)
    pub confirmed_at: String,
}

impl From<PaymentCompleted> for OrderConfirmed {
    fn from(payment: PaymentCompleted) -> Self {
        Self {
            order_id: payment.order_id,
            confirmed_at: payment.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn ticket(status: TicketStatus) -> Ticket {
        Ticket {
            ticket_id: "T1".to_string(),
            status,
            customer_email: "alice@example.com".to_string(),
            price: Price {
                amount: "10.00".to_string(),
                currency: "USD".to_string(),
            },
        }
    }

    #[test]
    fn event_topic_follows_status() {
        assert_eq!(
            TicketEvent::new(&ticket(TicketStatus::Confirmed), "c").topic(),
            TICKET_BOOKING_CONFIRMED
        );
        assert_eq!(
            TicketEvent::new(&ticket(TicketStatus::Canceled), "c").topic(),
            TICKET_BOOKING_CANCELED
        );
    }

    #[test]
    fn event_wire_format() {
        let event = TicketEvent::new(&ticket(TicketStatus::Confirmed), "req-1");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["meta"]["correlation_id"], "req-1");
        assert_eq!(json["status"], "confirmed");
        assert_eq!(json["price"]["amount"], "10.00");
        assert!(chrono::DateTime::parse_from_rfc3339(json["header"]["published_at"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn full_event_decodes_as_task_payloads() {
        let event = TicketEvent::new(&ticket(TicketStatus::Confirmed), "req-1");
        let bytes = serde_json::to_vec(&event).unwrap();

        let receipt: IssueReceiptPayload = serde_json::from_slice(&bytes).unwrap();
        let tracker: AppendToTrackerPayload = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(receipt, IssueReceiptPayload::from(&event));
        assert_eq!(
            tracker.into_row(),
            vec!["T1", "alice@example.com", "10.00", "USD"]
        );
    }
}
