//! In-place retry of retryable handler failures.

use super::HandlerFuture;
use crate::retry::{RetryPolicy, retry_with_predicate};
use courier_core::handler::HandlerError;
use courier_core::message::Message;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

/// Layer that retries the inner service with exponential backoff.
///
/// Only errors for which [`HandlerError::is_retryable`] holds are retried;
/// decode failures surface at once. The error of the last attempt is returned
/// when the policy is exhausted.
#[derive(Clone, Debug, Default)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    /// Create a retry layer with the given policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Middleware service for in-place retries.
#[derive(Clone, Debug)]
pub struct Retry<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<Message> for Retry<S>
where
    S: Service<Message, Response = Vec<Message>, Error = HandlerError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Vec<Message>;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Every attempt drives readiness on its own clone of the inner service.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            retry_with_predicate(
                policy,
                move || inner.clone().oneshot(message.clone()),
                HandlerError::is_retryable,
            )
            .await
        })
    }
}
