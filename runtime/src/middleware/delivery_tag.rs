//! Per-delivery tagging and outcome logging.

use super::HandlerFuture;
use courier_core::handler::HandlerError;
use courier_core::message::Message;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use uuid::Uuid;

/// Layer that tags each handler invocation with a fresh `message_uuid` and
/// logs its start and outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeliveryTagLayer;

impl<S> Layer<S> for DeliveryTagLayer {
    type Service = DeliveryTag<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeliveryTag { inner }
    }
}

/// Middleware service for delivery tagging.
#[derive(Clone, Debug)]
pub struct DeliveryTag<S> {
    inner: S,
}

impl<S> Service<Message> for DeliveryTag<S>
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
        let message_uuid = Uuid::new_v4();
        let message_id = message.id();
        let payload_len = message.payload().len();
        let fut = self.inner.call(message);

        Box::pin(async move {
            tracing::info!(%message_uuid, %message_id, payload_len, "Handling a message");

            let result = fut.await;
            match &result {
                Ok(produced) => {
                    tracing::info!(%message_uuid, produced = produced.len(), "Message handled");
                },
                Err(err) => {
                    tracing::error!(%message_uuid, error = %err, "Message handling error");
                },
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tower::{ServiceExt, service_fn};

    #[tokio::test]
    async fn passes_results_through_unchanged() {
        let ok = DeliveryTagLayer
            .layer(service_fn(|m: Message| async move { Ok::<_, HandlerError>(vec![m]) }))
            .oneshot(Message::new(b"a".to_vec()))
            .await
            .unwrap();
        assert_eq!(ok.len(), 1);

        let err = DeliveryTagLayer
            .layer(service_fn(|_: Message| async {
                Err::<Vec<Message>, _>(HandlerError::transient("down"))
            }))
            .oneshot(Message::new(b"a".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::transient("down"));
    }
}
