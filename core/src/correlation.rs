//! Correlation id handling.
//!
//! A correlation id ties together every message and log line that stems from
//! one originating request. It travels in message metadata under
//! [`CORRELATION_ID_KEY`] and, while a message is being handled, in a
//! task-local scope so that code far from the message (an HTTP client setting
//! a request header, for instance) can read it with
//! [`current_correlation_id`].

use std::future::Future;
use uuid::Uuid;

/// Metadata key under which the correlation id is stored.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Generate a new correlation id.
#[must_use]
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Run `future` with `correlation_id` as the current correlation id.
pub async fn scope<F>(correlation_id: String, future: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(correlation_id, future).await
}

/// The correlation id of the message currently being handled, if any.
#[must_use]
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_exposes_correlation_id() {
        assert_eq!(current_correlation_id(), None);

        let seen = scope("abc".to_string(), async { current_correlation_id() }).await;

        assert_eq!(seen.as_deref(), Some("abc"));
        assert_eq!(current_correlation_id(), None);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }
}
