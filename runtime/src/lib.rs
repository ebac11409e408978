//! # Courier Runtime
//!
//! Drives message handlers from broker subscriptions.
//!
//! ## Core Components
//!
//! - **Router**: one consumption loop per binding, settlement (ack, nack,
//!   dead-letter) and graceful shutdown
//! - **Middleware**: tower layers applied around every handler
//!   (correlation propagation, delivery tagging, retry with backoff)
//! - **Retry**: exponential backoff policy shared by the retry middleware
//! - **Metrics**: Prometheus recorders for router and retry activity
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::router::{Binding, Router, RouterConfig};
//! use courier_runtime::middleware::{CorrelationLayer, DeliveryTagLayer, RetryLayer};
//!
//! let mut router = Router::new(RouterConfig::default());
//! router.add_middleware(CorrelationLayer);
//! router.add_middleware(DeliveryTagLayer);
//! router.add_middleware(RetryLayer::default());
//! router.add_binding(Binding::new("issue-receipt", subscription, broker, handler))?;
//!
//! router.run(shutdown_signal()).await?;
//! ```

/// Prometheus metrics for observability
pub mod metrics;

/// Middleware chain around message handlers
pub mod middleware;

/// Retry logic with exponential backoff
pub mod retry;

/// Router and consumption loops
pub mod router;

pub use retry::RetryPolicy;
pub use router::{Binding, Router, RouterConfig, RouterError, RunningSignal};
