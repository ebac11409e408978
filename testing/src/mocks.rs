//! Mock broker and handler implementations.
//!
//! - [`RecordingPublisher`]: records published messages, can be told to fail
//! - [`ScriptedHandler`]: replays a script of outcomes and records every call

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only a poisoned lock panics

use async_trait::async_trait;
use courier_core::broker::{BrokerError, BrokerFuture, Publisher};
use courier_core::correlation::current_correlation_id;
use courier_core::handler::{HandlerError, HandlerResult, MessageHandler};
use courier_core::message::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Publisher that records messages instead of sending them.
///
/// Clones share the same record.
///
/// # Example
///
/// ```
/// use courier_testing::RecordingPublisher;
/// use courier_core::broker::Publisher;
/// use courier_core::message::Message;
///
/// # async fn example() {
/// let publisher = RecordingPublisher::new();
/// publisher.fail_next(1);
///
/// assert!(publisher.publish("t", Message::new(b"1".to_vec())).await.is_err());
/// assert!(publisher.publish("t", Message::new(b"2".to_vec())).await.is_ok());
/// assert_eq!(publisher.messages_on("t").len(), 1);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    state: Arc<Mutex<PublisherState>>,
}

#[derive(Debug, Default)]
struct PublisherState {
    published: Vec<(String, Message)>,
    successes_left: usize,
    failures_left: usize,
}

impl RecordingPublisher {
    /// Create an empty recording publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with [`BrokerError::PublishFailed`].
    pub fn fail_next(&self, count: usize) {
        self.fail_after(0, count);
    }

    /// Accept the next `successes` publishes, then fail `count` of them.
    pub fn fail_after(&self, successes: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.successes_left = successes;
        state.failures_left = count;
    }

    /// Every successfully published `(topic, message)` pair, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Message)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Messages published to `topic`, in order.
    #[must_use]
    pub fn messages_on(&self, topic: &str) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, topic: &str, message: Message) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.successes_left > 0 {
                state.successes_left -= 1;
            } else if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(BrokerError::PublishFailed {
                    topic,
                    reason: "scripted failure".to_string(),
                });
            }
            state.published.push((topic, message));
            Ok(())
        })
    }
}

/// What a [`ScriptedHandler`] does on one call.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Return these produced messages
    Succeed(Vec<Message>),
    /// Fail with this error
    Fail(HandlerError),
    /// Panic with this message
    Panic(String),
}

/// One recorded call of a [`ScriptedHandler`].
#[derive(Clone, Debug)]
pub struct Invocation {
    /// Message the handler received
    pub message: Message,
    /// When the call started (tokio clock, so it follows a paused clock)
    pub at: Instant,
    /// Correlation id visible to the handler through the task-local scope
    pub correlation_id: Option<String>,
}

/// Handler that replays scripted outcomes, then succeeds with no output.
///
/// Clones share the script and the call record, so a test can keep one
/// clone and hand another to a router.
#[derive(Clone, Debug, Default)]
pub struct ScriptedHandler {
    state: Arc<Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    calls: Vec<Invocation>,
}

impl ScriptedHandler {
    /// Create a handler that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler that fails `times` times with `error`, then succeeds.
    #[must_use]
    pub fn failing(times: usize, error: &HandlerError) -> Self {
        (0..times).fold(Self::new(), |handler, _| {
            handler.then(Outcome::Fail(error.clone()))
        })
    }

    /// Append an outcome to the script.
    #[must_use]
    pub fn then(self, outcome: Outcome) -> Self {
        self.state.lock().unwrap().outcomes.push_back(outcome);
        self
    }

    /// Recorded calls, in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    #[allow(clippy::panic)]
    async fn handle(&self, message: Message) -> HandlerResult {
        let outcome = {
            let mut script = self.state.lock().unwrap();
            script.calls.push(Invocation {
                message,
                at: Instant::now(),
                correlation_id: current_correlation_id(),
            });
            script.outcomes.pop_front()
        };

        match outcome {
            None => Ok(Vec::new()),
            Some(Outcome::Succeed(produced)) => Ok(produced),
            Some(Outcome::Fail(error)) => Err(error),
            Some(Outcome::Panic(reason)) => panic!("{reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn scripted_handler_replays_then_succeeds() {
        let handler = ScriptedHandler::failing(2, &HandlerError::transient("down"));

        for _ in 0..2 {
            assert_eq!(
                handler.handle(Message::new(b"x".to_vec())).await,
                Err(HandlerError::transient("down"))
            );
        }
        assert_eq!(handler.handle(Message::new(b"x".to_vec())).await, Ok(vec![]));
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn handler_records_correlation_scope() {
        let handler = ScriptedHandler::new();
        courier_core::correlation::scope("req-9".to_string(), handler.handle(Message::new(vec![])))
            .await
            .unwrap();

        assert_eq!(handler.invocations()[0].correlation_id.as_deref(), Some("req-9"));
    }
}
