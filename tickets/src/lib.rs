//! # Tickets
//!
//! Ticket booking worker built on Courier.
//!
//! Booking requests arrive over HTTP and become messages; the worker's
//! router consumes them and performs two side effects per ticket through
//! external services:
//!
//! - **Issue receipt**: `POST /receipts-api/receipts`
//! - **Append to tracker**: a row in `tickets-to-print` (confirmed) or
//!   `tickets-to-refund` (canceled)
//!
//! Delivery is at-least-once. Transient client failures are retried in place
//! with exponential backoff, then redelivered by the broker, then
//! dead-lettered. Malformed payloads are dead-lettered immediately.
//!
//! ## Modules
//!
//! - [`events`]: domain events and task payloads
//! - [`clients`]: receipts and spreadsheets clients
//! - [`handlers`]: message handlers, one client call each
//! - [`worker`]: topic → handler registry, task publishing, router
//! - [`http`]: axum port
//! - [`config`], [`telemetry`], [`app`]: process wiring

pub mod app;
pub mod clients;
pub mod config;
pub mod events;
pub mod handlers;
pub mod http;
pub mod telemetry;
pub mod worker;

pub use app::{App, SetupError};
pub use config::{Config, ConfigError};
pub use worker::{Task, TaskSender, Worker};
