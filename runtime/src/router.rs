//! Router: runs one consumption loop per binding.
//!
//! # Architecture
//!
//! ```text
//! Subscriber ──► DeliveryStream ──► middleware chain ──► handler
//!                     ▲                                     │
//!                     │ ack / nack            produced messages
//!                     │                                     ▼
//!                     └──────────── loop ◄──── Publisher(output topic)
//! ```
//!
//! # Settlement rules
//!
//! Per delivery, after the middleware-wrapped handler returns:
//!
//! 1. **Success**: produced messages go to the binding's output topic, then
//!    the delivery is acked.
//! 2. **Retryable failure** with delivery budget left: nack, so the broker
//!    redelivers.
//! 3. **Non-retryable failure** or budget exhausted: dead-letter. The message
//!    is published to the dead-letter topic when a dead-letter publisher is
//!    configured, otherwise logged at ERROR with its payload; either way it is
//!    then acked. If publishing the dead letter fails, the delivery is nacked.
//!
//! # Shutdown
//!
//! `run` waits for the shutdown future, then broadcasts to all loops. A loop
//! finishes its in-flight delivery before exiting, and `run` returns once
//! every loop has stopped.

use crate::metrics::RouterMetrics;
use crate::middleware::{HandlerService, Middleware, handler_service, panic_message};
use courier_core::broker::{BrokerError, Delivery, DeliveryStream, Publisher, Subscriber, Subscription};
use courier_core::correlation::{CORRELATION_ID_KEY, new_correlation_id};
use courier_core::handler::{HandlerError, MessageHandler};
use courier_core::message::Message;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::Instrument;

/// Metadata key: why the message was dead-lettered.
pub const DEAD_LETTER_REASON_KEY: &str = "dead_letter_reason";
/// Metadata key: topic the message was consumed from.
pub const DEAD_LETTER_TOPIC_KEY: &str = "dead_letter_topic";
/// Metadata key: binding whose handler gave up on the message.
pub const DEAD_LETTER_HANDLER_KEY: &str = "dead_letter_handler";

/// Errors from router setup.
#[derive(Error, Debug)]
pub enum RouterError {
    /// A binding with the same name is already registered.
    #[error("Binding '{0}' is already registered")]
    DuplicateBinding(String),

    /// `run` was called without any binding.
    #[error("Router has no bindings")]
    NoBindings,

    /// A binding could not subscribe to its topic.
    #[error("Binding '{binding}' could not subscribe: {source}")]
    Subscribe {
        /// Name of the binding
        binding: String,
        /// Broker error
        #[source]
        source: BrokerError,
    },
}

/// Router configuration.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Deliveries of one message before it is dead-lettered
    pub max_deliveries: u32,
    /// Topic dead letters are published to
    pub dead_letter_topic: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 3,
            dead_letter_topic: "dead-letter".to_string(),
        }
    }
}

/// A topic subscription bound to a handler, run as one consumption loop.
pub struct Binding {
    name: String,
    subscription: Subscription,
    subscriber: Arc<dyn Subscriber>,
    output: Option<(String, Arc<dyn Publisher>)>,
    handler: Arc<dyn MessageHandler>,
}

impl Binding {
    /// Bind `handler` to `subscription`, consumed through `subscriber`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subscription: Subscription,
        subscriber: Arc<dyn Subscriber>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            subscriber,
            output: None,
            handler,
        }
    }

    /// Publish messages produced by the handler to `topic`.
    #[must_use]
    pub fn with_output(mut self, topic: impl Into<String>, publisher: Arc<dyn Publisher>) -> Self {
        self.output = Some((topic.into(), publisher));
        self
    }

    /// Binding name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscription consumed by this binding.
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("subscription", &self.subscription)
            .field("output", &self.output.as_ref().map(|(topic, _)| topic))
            .finish_non_exhaustive()
    }
}

/// Signal that fires once every consumption loop has been started.
#[derive(Clone, Debug)]
pub struct RunningSignal {
    rx: watch::Receiver<bool>,
}

impl RunningSignal {
    /// Wait until the router is running.
    ///
    /// Returns `false` if the router stopped or failed to start before that.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|running| *running).await.is_ok()
    }

    /// Whether the router is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Runs bindings through a shared middleware chain.
///
/// # Example
///
/// ```
/// use courier_core::memory::MemoryStream;
/// use courier_core::broker::Subscription;
/// use courier_runtime::middleware::{CorrelationLayer, DeliveryTagLayer, RetryLayer};
/// use courier_runtime::router::{Binding, Router, RouterConfig};
/// # use courier_core::handler::{HandlerResult, MessageHandler};
/// # use courier_core::message::Message;
/// use std::sync::Arc;
///
/// # struct PrintTicket;
/// # #[async_trait::async_trait]
/// # impl MessageHandler for PrintTicket {
/// #     async fn handle(&self, _message: Message) -> HandlerResult { Ok(vec![]) }
/// # }
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(MemoryStream::default());
///
/// let mut router = Router::new(RouterConfig::default());
/// router.add_middleware(CorrelationLayer);
/// router.add_middleware(DeliveryTagLayer);
/// router.add_middleware(RetryLayer::default());
/// router.add_binding(Binding::new(
///     "print",
///     Subscription::new("tickets", "printer"),
///     broker,
///     Arc::new(PrintTicket),
/// ))?;
///
/// router.run(async { /* wait for ctrl-c */ }).await?;
/// # Ok(())
/// # }
/// ```
pub struct Router {
    config: RouterConfig,
    middleware: Vec<Arc<dyn Middleware>>,
    bindings: Vec<Binding>,
    dead_letter: Option<Arc<dyn Publisher>>,
    running: watch::Sender<bool>,
}

impl Router {
    /// Create a router without bindings or middleware.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            config,
            middleware: Vec::new(),
            bindings: Vec::new(),
            dead_letter: None,
            running,
        }
    }

    /// Append a middleware. The first one added is the outermost.
    pub fn add_middleware(&mut self, middleware: impl Middleware) {
        self.middleware.push(Arc::new(middleware));
    }

    /// Register a binding.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateBinding`] if the name is taken.
    pub fn add_binding(&mut self, binding: Binding) -> Result<(), RouterError> {
        if self.bindings.iter().any(|b| b.name == binding.name) {
            return Err(RouterError::DuplicateBinding(binding.name));
        }
        self.bindings.push(binding);
        Ok(())
    }

    /// Publish dead letters through `publisher` instead of only logging them.
    #[must_use]
    pub fn with_dead_letter(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    /// Signal that fires when all loops are running.
    #[must_use]
    pub fn running(&self) -> RunningSignal {
        RunningSignal {
            rx: self.running.subscribe(),
        }
    }

    /// Names of the registered bindings.
    #[must_use]
    pub fn binding_names(&self) -> Vec<&str> {
        self.bindings.iter().map(Binding::name).collect()
    }

    /// Subscribe every binding, run the loops until `shutdown` completes,
    /// then stop them gracefully.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoBindings`] or [`RouterError::Subscribe`]
    /// before any loop starts.
    pub async fn run<F>(self, shutdown: F) -> Result<(), RouterError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            config,
            middleware,
            bindings,
            dead_letter,
            running,
        } = self;

        if bindings.is_empty() {
            return Err(RouterError::NoBindings);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut loops = Vec::with_capacity(bindings.len());

        for binding in bindings {
            let stream = binding
                .subscriber
                .subscribe(&binding.subscription)
                .await
                .map_err(|source| RouterError::Subscribe {
                    binding: binding.name.clone(),
                    source,
                })?;

            let service = middleware
                .iter()
                .rev()
                .fold(handler_service(Arc::clone(&binding.handler)), |next, layer| {
                    layer.wrap(next)
                });

            loops.push(ConsumerLoop {
                context: LoopContext {
                    name: binding.name,
                    subscription: binding.subscription,
                    output: binding.output,
                    max_deliveries: config.max_deliveries,
                    dead_letter_topic: config.dead_letter_topic.clone(),
                    dead_letter: dead_letter.clone(),
                },
                service,
                stream,
                shutdown: shutdown_tx.subscribe(),
            });
        }

        let count = loops.len();
        let mut tasks = JoinSet::new();
        for consumer in loops {
            tasks.spawn(consumer.run());
        }

        running.send_replace(true);
        tracing::info!(bindings = count, "Router running");

        shutdown.await;
        tracing::info!("Shutdown signal received, stopping consumption loops");
        let _ = shutdown_tx.send(());

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Consumption loop task failed");
            }
        }

        running.send_replace(false);
        tracing::info!("Router stopped");
        Ok(())
    }
}

struct ConsumerLoop {
    context: LoopContext,
    service: HandlerService,
    stream: DeliveryStream,
    shutdown: broadcast::Receiver<()>,
}

/// The shareable part of a loop, borrowed while a delivery is processed.
struct LoopContext {
    name: String,
    subscription: Subscription,
    output: Option<(String, Arc<dyn Publisher>)>,
    max_deliveries: u32,
    dead_letter_topic: String,
    dead_letter: Option<Arc<dyn Publisher>>,
}

impl ConsumerLoop {
    async fn run(mut self) {
        let context = &self.context;
        tracing::info!(
            binding = %context.name,
            topic = %context.subscription.topic,
            consumer_group = %context.subscription.consumer_group,
            "Consumption loop started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                next = self.stream.next() => next,
            };

            let Some(delivery) = next else {
                tracing::warn!(binding = %context.name, "Delivery stream ended");
                break;
            };

            // Stamped here so the delivery span and the dead letter carry the
            // same id the handler sees.
            let message = with_correlation_id(delivery.message());
            let span = tracing::info_span!(
                "delivery",
                handler = %context.name,
                topic = %context.subscription.topic,
                consumer_group = %context.subscription.consumer_group,
                message_id = %message.id(),
                attempt = delivery.attempt(),
                correlation_id = message.correlation_id().unwrap_or_default(),
            );

            context
                .process(self.service.clone(), delivery, message)
                .instrument(span)
                .await;
        }

        tracing::info!(binding = %context.name, "Consumption loop stopped");
    }
}

/// `message` with its correlation id, generating one if it has none.
fn with_correlation_id(message: &Message) -> Message {
    if message.correlation_id().is_some() {
        message.clone()
    } else {
        message
            .clone()
            .with_metadata(CORRELATION_ID_KEY, new_correlation_id())
    }
}

impl LoopContext {
    async fn process(&self, service: HandlerService, delivery: Delivery, message: Message) {
        RouterMetrics::record_consumed(&self.name);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(service.oneshot(message.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

        RouterMetrics::record_duration(&self.name, started.elapsed());

        let outcome = match outcome {
            Ok(produced) => self.publish_produced(produced).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                delivery.ack();
                RouterMetrics::record_acked(&self.name);
                tracing::debug!("Message acked");
            },
            Err(err) if !err.is_retryable() || delivery.attempt() >= self.max_deliveries => {
                self.dead_letter(delivery, message, &err).await;
            },
            Err(err) => {
                tracing::warn!(
                    attempt = delivery.attempt(),
                    max_deliveries = self.max_deliveries,
                    error = %err,
                    "Message nacked for redelivery"
                );
                delivery.nack();
                RouterMetrics::record_nacked(&self.name);
            },
        }
    }

    async fn publish_produced(&self, produced: Vec<Message>) -> Result<(), HandlerError> {
        if produced.is_empty() {
            return Ok(());
        }

        let Some((topic, publisher)) = &self.output else {
            tracing::warn!(
                count = produced.len(),
                "Handler produced messages but the binding has no output topic, discarding"
            );
            return Ok(());
        };

        let count = produced.len();
        for message in produced {
            publisher.publish(topic, message).await.map_err(|e| {
                HandlerError::transient(format!("publishing to '{topic}' failed: {e}"))
            })?;
        }
        RouterMetrics::record_produced(&self.name, count);
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery, original: Message, err: &HandlerError) {
        let Some(publisher) = &self.dead_letter else {
            tracing::error!(
                message_id = %original.id(),
                correlation_id = original.correlation_id().unwrap_or_default(),
                payload = %String::from_utf8_lossy(original.payload()),
                reason = %err,
                "Giving up on message, no dead-letter publisher configured"
            );
            delivery.ack();
            RouterMetrics::record_dead_lettered(&self.name);
            return;
        };

        let dead = original
            .with_metadata(DEAD_LETTER_REASON_KEY, err.to_string())
            .with_metadata(DEAD_LETTER_TOPIC_KEY, self.subscription.topic.clone())
            .with_metadata(DEAD_LETTER_HANDLER_KEY, self.name.clone());

        match publisher.publish(&self.dead_letter_topic, dead).await {
            Ok(()) => {
                tracing::warn!(
                    dead_letter_topic = %self.dead_letter_topic,
                    reason = %err,
                    "Message moved to dead-letter topic"
                );
                delivery.ack();
                RouterMetrics::record_dead_lettered(&self.name);
            },
            Err(e) => {
                tracing::error!(
                    dead_letter_topic = %self.dead_letter_topic,
                    error = %e,
                    "Failed to publish dead letter, nacking"
                );
                delivery.nack();
                RouterMetrics::record_nacked(&self.name);
            },
        }
    }
}
