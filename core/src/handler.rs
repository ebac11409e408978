//! Message handlers and their error taxonomy.
//!
//! A [`MessageHandler`] receives one message and returns the messages it
//! produced (empty for handlers that only cause a side effect). Whether a
//! failure is worth retrying is encoded in the error variant, not left to the
//! caller to guess.

use crate::message::Message;
use async_trait::async_trait;
use std::fmt::Display;
use thiserror::Error;

/// Errors a handler invocation can end with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload could not be decoded. Retrying cannot fix it.
    #[error("Malformed payload: {0}")]
    Decode(String),

    /// A downstream call failed and may succeed later.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Decode`] from any displayable error.
    pub fn decode(err: impl Display) -> Self {
        Self::Decode(err.to_string())
    }

    /// Build a [`HandlerError::Transient`] from any displayable error.
    pub fn transient(err: impl Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Whether retrying the same message could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err)
    }
}

/// Result of one handler invocation: messages to publish downstream.
pub type HandlerResult = Result<Vec<Message>, HandlerError>;

/// Task-specific processing of one message.
///
/// # Idempotency
///
/// Delivery is at-least-once, so the same message may be handled more than
/// once. Side effects must tolerate duplicates.
///
/// # Thread Safety
///
/// Handlers are shared across consumption loops, hence `Send + Sync + 'static`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Decode`] for payloads that can never be
    /// processed and [`HandlerError::Transient`] for failures worth retrying.
    async fn handle(&self, message: Message) -> HandlerResult;
}
