//! Middleware chain around message handlers.
//!
//! A handler is exposed to the chain as a tower [`Service`] from [`Message`]
//! to the produced messages, failing with [`HandlerError`]. Middleware are
//! tower [`Layer`]s over that service. The router applies them in
//! registration order, the first registered being the outermost.
//!
//! # Standard chain
//!
//! ```text
//! CorrelationLayer ─► DeliveryTagLayer ─► RetryLayer ─► handler
//! ```
//!
//! - [`CorrelationLayer`] reads or creates the correlation id and makes it
//!   visible to logs and to code called by the handler
//! - [`DeliveryTagLayer`] logs each delivery under its own tag
//! - [`RetryLayer`] retries retryable failures in place with backoff
//!
//! # Example
//!
//! ```
//! use courier_runtime::middleware::{handler_service, CorrelationLayer, Middleware};
//! use courier_core::handler::{HandlerResult, MessageHandler};
//! use courier_core::message::Message;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Echo {
//!     async fn handle(&self, message: Message) -> HandlerResult {
//!         Ok(vec![message.derive(message.payload().to_vec())])
//!     }
//! }
//!
//! let service = CorrelationLayer.wrap(handler_service(Arc::new(Echo)));
//! ```

mod correlation;
mod delivery_tag;
mod retry;

pub use correlation::{Correlation, CorrelationLayer};
pub use delivery_tag::{DeliveryTag, DeliveryTagLayer};
pub use retry::{Retry, RetryLayer};

use courier_core::handler::{HandlerError, HandlerResult, MessageHandler};
use courier_core::message::Message;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tower::util::BoxCloneService;
use tower::{Layer, Service, service_fn};

/// A handler with zero or more middleware applied.
pub type HandlerService = BoxCloneService<Message, Vec<Message>, HandlerError>;

/// Future returned by the middleware services in this module.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// Type-erased middleware, so layers of different types can be registered on
/// one router.
///
/// Implemented for every tower [`Layer`] whose service fits the handler
/// contract.
pub trait Middleware: Send + Sync + 'static {
    /// Wrap `next` with this middleware.
    fn wrap(&self, next: HandlerService) -> HandlerService;
}

impl<L> Middleware for L
where
    L: Layer<HandlerService> + Send + Sync + 'static,
    L::Service: Service<Message, Response = Vec<Message>, Error = HandlerError>
        + Clone
        + Send
        + 'static,
    <L::Service as Service<Message>>::Future: Send + 'static,
{
    fn wrap(&self, next: HandlerService) -> HandlerService {
        BoxCloneService::new(self.layer(next))
    }
}

/// Expose a [`MessageHandler`] as the innermost service of a chain.
///
/// A panic inside the handler becomes [`HandlerError::Panicked`].
pub fn handler_service(handler: Arc<dyn MessageHandler>) -> HandlerService {
    BoxCloneService::new(service_fn(move |message: Message| {
        let handler = Arc::clone(&handler);
        async move {
            AssertUnwindSafe(handler.handle(message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))))
        }
    }))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tower::ServiceExt;

    struct Exploding;

    #[async_trait]
    impl MessageHandler for Exploding {
        #[allow(clippy::panic)]
        async fn handle(&self, _message: Message) -> HandlerResult {
            panic!("sheet service exploded");
        }
    }

    #[tokio::test]
    async fn handler_panics_become_errors() {
        let result = handler_service(Arc::new(Exploding))
            .oneshot(Message::new(b"x".to_vec()))
            .await;

        assert_eq!(
            result,
            Err(HandlerError::Panicked("sheet service exploded".to_string()))
        );
    }
}
