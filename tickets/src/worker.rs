//! The ticket worker: task publishing plus the router consuming the tasks.
//!
//! All topic → handler wiring lives in one table, [`ROUTES`]. Adding a task
//! means adding a row there and, if needed, a handler kind.
//!
//! # Example
//!
//! ```
//! use courier_core::memory::MemoryStream;
//! use std::sync::Arc;
//! use tickets::worker::{BrokerHandle, Clients, Worker, WorkerConfig};
//! # use tickets::clients::{ClientError, IssueReceiptRequest, ReceiptsClient, SpreadsheetsClient};
//! # struct Noop;
//! # #[async_trait::async_trait]
//! # impl ReceiptsClient for Noop {
//! #     async fn issue_receipt(&self, _: IssueReceiptRequest) -> Result<(), ClientError> { Ok(()) }
//! # }
//! # #[async_trait::async_trait]
//! # impl SpreadsheetsClient for Noop {
//! #     async fn append_row(&self, _: &str, _: Vec<String>) -> Result<(), ClientError> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = BrokerHandle::new(Arc::new(MemoryStream::default()));
//! let clients = Clients {
//!     receipts: Arc::new(Noop),
//!     spreadsheets: Arc::new(Noop),
//! };
//!
//! let worker = Worker::new(broker, clients, WorkerConfig::default())?;
//! let sender = worker.sender();
//! worker.run(async { /* wait for ctrl-c */ }).await?;
//! # drop(sender);
//! # Ok(())
//! # }
//! ```

use crate::clients::{ReceiptsClient, SpreadsheetsClient};
use crate::events::{
    AppendToTrackerPayload, IssueReceiptPayload, ORDER_CONFIRMED, PAYMENT_COMPLETED,
    TICKET_BOOKING_CANCELED, TICKET_BOOKING_CONFIRMED, Ticket, TicketEvent,
};
use crate::handlers::{
    AppendToTracker, IssueReceipt, OrderConfirmation, TICKETS_TO_PRINT, TICKETS_TO_REFUND,
};
use courier_core::broker::{BrokerError, Publisher, Subscriber, Subscription};
use courier_core::correlation::{CORRELATION_ID_KEY, new_correlation_id};
use courier_core::handler::MessageHandler;
use courier_core::message::Message;
use courier_runtime::middleware::{CorrelationLayer, DeliveryTagLayer, RetryLayer};
use courier_runtime::retry::RetryPolicy;
use courier_runtime::router::{Binding, Router, RouterConfig, RouterError, RunningSignal};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Topic of the issue-receipt task.
pub const ISSUE_RECEIPT_TOPIC: &str = "issue-receipt";
/// Topic of the append-to-tracker task.
pub const APPEND_TO_TRACKER_TOPIC: &str = "append-to-tracker";

/// A unit of background work for one ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Issue a payment receipt
    IssueReceipt,
    /// Append the ticket to the print tracker
    AppendToTracker,
}

impl Task {
    /// Topic the task is published to.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            Self::IssueReceipt => ISSUE_RECEIPT_TOPIC,
            Self::AppendToTracker => APPEND_TO_TRACKER_TOPIC,
        }
    }

    /// Wire payload of the task for `event`.
    ///
    /// # Errors
    ///
    /// Returns the serialization error, which only a broken `Serialize`
    /// implementation can produce.
    pub fn payload(self, event: &TicketEvent) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::IssueReceipt => serde_json::to_vec(&IssueReceiptPayload::from(event)),
            Self::AppendToTracker => serde_json::to_vec(&AppendToTrackerPayload::from(event)),
        }
    }
}

/// Handler a route dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// [`IssueReceipt`]
    IssueReceipt,
    /// [`AppendToTracker`] on the given sheet
    AppendToTracker(&'static str),
    /// [`OrderConfirmation`]
    OrderConfirmation,
}

/// One row of the topic → handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Binding name, unique in the router
    pub name: &'static str,
    /// Topic consumed
    pub topic: &'static str,
    /// Consumer group
    pub consumer_group: &'static str,
    /// Handler invoked per message
    pub handler: HandlerKind,
    /// Topic the handler's produced messages go to
    pub output: Option<&'static str>,
}

/// The topic → handler registry.
///
/// The booking topics are consumed by the same groups as the task topics, so
/// a booking fans out to one receipt and one tracker row.
pub const ROUTES: &[Route] = &[
    Route {
        name: "issue-receipt",
        topic: ISSUE_RECEIPT_TOPIC,
        consumer_group: "issue-receipt",
        handler: HandlerKind::IssueReceipt,
        output: None,
    },
    Route {
        name: "append-to-tracker",
        topic: APPEND_TO_TRACKER_TOPIC,
        consumer_group: "append-to-tracker",
        handler: HandlerKind::AppendToTracker(TICKETS_TO_PRINT),
        output: None,
    },
    Route {
        name: "booking-confirmed-receipt",
        topic: TICKET_BOOKING_CONFIRMED,
        consumer_group: "issue-receipt",
        handler: HandlerKind::IssueReceipt,
        output: None,
    },
    Route {
        name: "booking-confirmed-tracker",
        topic: TICKET_BOOKING_CONFIRMED,
        consumer_group: "append-to-tracker",
        handler: HandlerKind::AppendToTracker(TICKETS_TO_PRINT),
        output: None,
    },
    Route {
        name: "booking-canceled-tracker",
        topic: TICKET_BOOKING_CANCELED,
        consumer_group: "append-to-tracker",
        handler: HandlerKind::AppendToTracker(TICKETS_TO_REFUND),
        output: None,
    },
    Route {
        name: "order-confirmation",
        topic: PAYMENT_COMPLETED,
        consumer_group: "order-confirmation",
        handler: HandlerKind::OrderConfirmation,
        output: Some(ORDER_CONFIRMED),
    },
];

/// Both halves of a broker, shared by the worker and the HTTP port.
#[derive(Clone)]
pub struct BrokerHandle {
    /// Publishing half
    pub publisher: Arc<dyn Publisher>,
    /// Consuming half
    pub subscriber: Arc<dyn Subscriber>,
}

impl BrokerHandle {
    /// Use one broker for both halves.
    #[must_use]
    pub fn new<B>(broker: Arc<B>) -> Self
    where
        B: Publisher + Subscriber + 'static,
    {
        Self {
            publisher: broker.clone(),
            subscriber: broker,
        }
    }
}

/// External service clients used by the handlers.
#[derive(Clone)]
pub struct Clients {
    /// Receipts service
    pub receipts: Arc<dyn ReceiptsClient>,
    /// Spreadsheets service
    pub spreadsheets: Arc<dyn SpreadsheetsClient>,
}

fn resolve_correlation_id(correlation_id: &str) -> String {
    if correlation_id.is_empty() {
        new_correlation_id()
    } else {
        correlation_id.to_string()
    }
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Local retry policy applied around every handler
    pub retry: RetryPolicy,
    /// Delivery budget per message before dead-lettering
    pub max_deliveries: u32,
    /// Topic dead letters are published to; `None` only logs them
    pub dead_letter_topic: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            retry: RetryPolicy::default(),
            max_deliveries: router.max_deliveries,
            dead_letter_topic: Some(router.dead_letter_topic),
        }
    }
}

/// Failure to enqueue a task.
#[derive(Error, Debug)]
pub enum SendError {
    /// The payload could not be serialized.
    #[error("Failed to encode task payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The broker did not accept the message.
    #[error(transparent)]
    Publish(#[from] BrokerError),
}

/// Cloneable handle for enqueuing tasks and booking events.
#[derive(Clone)]
pub struct TaskSender {
    publisher: Arc<dyn Publisher>,
}

impl TaskSender {
    /// Create a sender publishing through `publisher`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Publish `task` for `event`.
    ///
    /// The message carries the event's correlation id, or a fresh one if the
    /// event has none. There is no outbox: if this fails the task is not
    /// enqueued and the caller decides what to do.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Publish`] if the broker rejected the message.
    pub async fn send(&self, task: Task, event: &TicketEvent) -> Result<(), SendError> {
        self.send_all([(task, event)]).await
    }

    /// Publish every `(task, event)` pair in order.
    ///
    /// All payloads are encoded before the first publish, so an encoding
    /// failure enqueues nothing. A broker failure stops the batch: the
    /// messages published before it stay enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Encode`] if any payload cannot be serialized, or
    /// [`SendError::Publish`] for the first message the broker rejected.
    pub async fn send_all<'a>(
        &self,
        tasks: impl IntoIterator<Item = (Task, &'a TicketEvent)>,
    ) -> Result<(), SendError> {
        let encoded = tasks
            .into_iter()
            .map(|(task, event)| Ok((task.topic(), task.payload(event)?, event.meta.correlation_id.as_str())))
            .collect::<Result<Vec<_>, SendError>>()?;

        for (topic, payload, correlation_id) in encoded {
            self.publish(topic, payload, correlation_id).await?;
        }
        Ok(())
    }

    /// Publish a booking event for `ticket` to the topic matching its status.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Publish`] if the broker rejected the message.
    pub async fn publish_booking(
        &self,
        ticket: &Ticket,
        correlation_id: &str,
    ) -> Result<TicketEvent, SendError> {
        let correlation_id = resolve_correlation_id(correlation_id);
        let event = TicketEvent::new(ticket, &correlation_id);
        let payload = serde_json::to_vec(&event)?;
        self.publish(event.topic(), payload, &correlation_id).await?;
        Ok(event)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        correlation_id: &str,
    ) -> Result<(), SendError> {
        let correlation_id = resolve_correlation_id(correlation_id);
        let message = Message::new(payload).with_metadata(CORRELATION_ID_KEY, correlation_id.as_str());
        let message_id = message.id();
        self.publisher.publish(topic, message).await?;

        tracing::debug!(
            topic,
            message_id = %message_id,
            correlation_id = %correlation_id,
            "Task published"
        );
        Ok(())
    }
}

/// Publisher plus the router running every [`ROUTES`] binding.
pub struct Worker {
    sender: TaskSender,
    router: Router,
}

impl Worker {
    /// Wire the registry onto `broker`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateBinding`] if the registry names a
    /// binding twice.
    pub fn new(broker: BrokerHandle, clients: Clients, config: WorkerConfig) -> Result<Self, RouterError> {
        let dead_letter_publish = config.dead_letter_topic.is_some();
        let mut router = Router::new(RouterConfig {
            max_deliveries: config.max_deliveries,
            dead_letter_topic: config.dead_letter_topic.unwrap_or_default(),
        });
        if dead_letter_publish {
            router = router.with_dead_letter(Arc::clone(&broker.publisher));
        }

        router.add_middleware(CorrelationLayer);
        router.add_middleware(DeliveryTagLayer);
        router.add_middleware(RetryLayer::new(config.retry));

        for route in ROUTES {
            let handler: Arc<dyn MessageHandler> = match route.handler {
                HandlerKind::IssueReceipt => Arc::new(IssueReceipt::new(Arc::clone(&clients.receipts))),
                HandlerKind::AppendToTracker(sheet) => {
                    Arc::new(AppendToTracker::new(Arc::clone(&clients.spreadsheets), sheet))
                },
                HandlerKind::OrderConfirmation => Arc::new(OrderConfirmation),
            };

            let mut binding = Binding::new(
                route.name,
                Subscription::new(route.topic, route.consumer_group),
                Arc::clone(&broker.subscriber),
                handler,
            );
            if let Some(output) = route.output {
                binding = binding.with_output(output, Arc::clone(&broker.publisher));
            }
            router.add_binding(binding)?;
        }

        Ok(Self {
            sender: TaskSender::new(broker.publisher),
            router,
        })
    }

    /// Publish `task` for `event`. See [`TaskSender::send`].
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the task was not enqueued.
    pub async fn send(&self, task: Task, event: &TicketEvent) -> Result<(), SendError> {
        self.sender.send(task, event).await
    }

    /// Publish a booking event. See [`TaskSender::publish_booking`].
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the event was not published.
    pub async fn publish_booking(
        &self,
        ticket: &Ticket,
        correlation_id: &str,
    ) -> Result<TicketEvent, SendError> {
        self.sender.publish_booking(ticket, correlation_id).await
    }

    /// Handle for publishing from elsewhere (the HTTP port).
    #[must_use]
    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    /// Fires once every binding's loop is running.
    #[must_use]
    pub fn running(&self) -> RunningSignal {
        self.router.running()
    }

    /// Run until `shutdown` completes, then stop after in-flight messages.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Subscribe`] if a binding cannot subscribe.
    pub async fn run<F>(self, shutdown: F) -> Result<(), RouterError>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!(bindings = ?self.router.binding_names(), "Starting ticket worker");
        self.router.run(shutdown).await
    }
}
