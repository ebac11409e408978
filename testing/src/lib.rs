//! # Courier Testing
//!
//! Testing utilities and helpers for Courier.
//!
//! This crate provides:
//! - Mock broker and handler implementations ([`mocks`])
//! - Log capture for asserting on structured log output ([`logs`])
//! - Eventual-assertion helpers for asynchronous pipelines ([`helpers`])
//!
//! ## Example
//!
//! ```
//! use courier_testing::mocks::{Outcome, ScriptedHandler};
//! use courier_core::handler::{HandlerError, MessageHandler};
//! use courier_core::message::Message;
//!
//! # async fn example() {
//! let handler = ScriptedHandler::new()
//!     .then(Outcome::Fail(HandlerError::transient("receipts down")))
//!     .then(Outcome::Succeed(vec![]));
//!
//! assert!(handler.handle(Message::new(b"{}".to_vec())).await.is_err());
//! assert!(handler.handle(Message::new(b"{}".to_vec())).await.is_ok());
//! assert_eq!(handler.call_count(), 2);
//! # }
//! ```

pub mod logs;
pub mod mocks;

pub use logs::CapturedLogs;
pub use mocks::{Invocation, Outcome, RecordingPublisher, ScriptedHandler};

/// Helpers for asserting on asynchronous outcomes.
pub mod helpers {
    use std::time::Duration;
    use tokio::time::Instant;

    /// Poll `condition` until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met. Works with a paused tokio
    /// clock, where idle sleeps advance time automatically.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::helpers::wait_until;
    /// use std::time::Duration;
    ///
    /// # async fn example() {
    /// assert!(wait_until(Duration::from_secs(1), || true).await);
    /// # }
    /// ```
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
