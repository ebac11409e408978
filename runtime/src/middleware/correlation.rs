//! Correlation id propagation.
//!
//! # Flow
//!
//! 1. **Read** `correlation_id` from the message metadata (or generate one)
//! 2. **Scope** the rest of the chain in a tracing span carrying the id and
//!    in the task-local correlation scope
//! 3. **Stamp** the id on produced messages that lack one

use super::HandlerFuture;
use courier_core::correlation::{self, CORRELATION_ID_KEY, new_correlation_id};
use courier_core::handler::HandlerError;
use courier_core::message::Message;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// Layer for correlation id propagation.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = Correlation<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Correlation { inner }
    }
}

/// Middleware service for correlation id propagation.
#[derive(Clone, Debug)]
pub struct Correlation<S> {
    inner: S,
}

impl<S> Service<Message> for Correlation<S>
where
    S: Service<Message, Response = Vec<Message>, Error = HandlerError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Vec<Message>;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let existing = message.correlation_id().map(str::to_string);
        let (message, correlation_id) = match existing {
            Some(id) => (message, id),
            None => {
                let id = new_correlation_id();
                tracing::debug!(
                    message_id = %message.id(),
                    correlation_id = %id,
                    "Message had no correlation id, generated one"
                );
                (message.with_metadata(CORRELATION_ID_KEY, id.clone()), id)
            },
        };

        let span = tracing::info_span!(
            "correlated",
            correlation_id = %correlation_id,
            message_id = %message.id(),
        );

        let fut = self.inner.call(message);
        let scoped_id = correlation_id.clone();

        Box::pin(
            correlation::scope(scoped_id, async move {
                let produced = fut.await?;
                Ok(produced
                    .into_iter()
                    .map(|produced| {
                        if produced.correlation_id().is_some() {
                            produced
                        } else {
                            produced.with_metadata(CORRELATION_ID_KEY, correlation_id.clone())
                        }
                    })
                    .collect())
            })
            .instrument(span),
        )
    }
}
