//! Bounded in-process queue broker.

use super::DeliveryStats;
use crate::broker::{
    Acknowledger, BrokerError, BrokerFuture, Delivery, DeliveryStream, Publisher, Subscriber,
    Subscription,
};
use crate::message::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// Configuration for [`MemoryQueue`].
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Capacity of each (topic, group) buffer and of the per-topic backlog
    pub capacity: usize,
    /// Longest time `publish` waits for buffer space before giving up
    pub publish_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// In-process broker with one bounded FIFO buffer per (topic, consumer group).
///
/// - Publishing copies the message into the buffer of every group attached to
///   the topic, waiting for space when a buffer is full.
/// - Consumers of the same group compete for the same buffer.
/// - A nacked message goes to the back of its group's buffer with its attempt
///   counter increased.
/// - Messages published before any group attached are kept in a bounded
///   backlog and handed to every group that attaches before the first
///   publish reaches a live group. That publish drops the backlog, so groups
///   created afterwards start from new messages only.
///
/// If one group's buffer times out during a fan-out publish, groups already
/// served keep their copy; a retried publish may therefore duplicate it for
/// them, which at-least-once consumers tolerate.
///
/// # Example
///
/// ```
/// use courier_core::broker::{Publisher, Subscriber, Subscription};
/// use courier_core::memory::MemoryQueue;
/// use courier_core::message::Message;
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = MemoryQueue::default();
/// let mut deliveries = queue.subscribe(&Subscription::new("progress", "printer")).await?;
///
/// queue.publish("progress", Message::new(b"50".to_vec())).await?;
///
/// if let Some(delivery) = deliveries.next().await {
///     assert_eq!(delivery.message().payload(), b"50");
///     delivery.ack();
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryQueue {
    config: QueueConfig,
    topics: Mutex<HashMap<String, TopicQueues>>,
}

#[derive(Default)]
struct TopicQueues {
    groups: HashMap<String, GroupQueue>,
    backlog: Vec<Message>,
}

#[derive(Clone)]
struct GroupQueue {
    sender: mpsc::Sender<Envelope>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Envelope>>>,
    counters: Arc<Counters>,
}

struct Envelope {
    message: Message,
    attempt: u32,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
        }
    }
}

impl MemoryQueue {
    /// Create a queue broker with the given configuration.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Settlement counters for one subscription.
    #[must_use]
    pub fn stats(&self, subscription: &Subscription) -> DeliveryStats {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(&subscription.topic)
            .and_then(|queues| queues.groups.get(&subscription.consumer_group))
            .map(|group| group.counters.snapshot())
            .unwrap_or_default()
    }

    /// Find or create the buffer of a consumer group.
    fn attach(&self, subscription: &Subscription) -> GroupQueue {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let queues = topics.entry(subscription.topic.clone()).or_default();

        if let Some(group) = queues.groups.get(&subscription.consumer_group) {
            return group.clone();
        }

        let capacity = self.config.capacity.max(queues.backlog.len()).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        for message in &queues.backlog {
            // Capacity covers the whole backlog, so this cannot be full.
            let _ = sender.try_send(Envelope {
                message: message.clone(),
                attempt: 1,
            });
        }

        let group = GroupQueue {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            counters: Arc::new(Counters::default()),
        };
        queues
            .groups
            .insert(subscription.consumer_group.clone(), group.clone());
        group
    }
}

impl Publisher for MemoryQueue {
    fn publish(&self, topic: &str, message: Message) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();

        Box::pin(async move {
            let senders: Vec<mpsc::Sender<Envelope>> = {
                let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
                let queues = topics.entry(topic.clone()).or_default();

                if queues.groups.is_empty() {
                    if queues.backlog.len() >= self.config.capacity {
                        return Err(BrokerError::PublishFailed {
                            topic,
                            reason: "no consumer group attached and backlog is full".to_string(),
                        });
                    }
                    tracing::debug!(
                        topic = %topic,
                        message_id = %message.id(),
                        "No consumer group attached yet, keeping message in backlog"
                    );
                    queues.backlog.push(message);
                    return Ok(());
                }

                if !queues.backlog.is_empty() {
                    tracing::debug!(
                        topic = %topic,
                        dropped = queues.backlog.len(),
                        "Topic is live, dropping pre-attach backlog"
                    );
                    queues.backlog.clear();
                }

                queues
                    .groups
                    .values()
                    .map(|group| group.sender.clone())
                    .collect()
            };

            for sender in senders {
                let envelope = Envelope {
                    message: message.clone(),
                    attempt: 1,
                };
                match tokio::time::timeout(self.config.publish_timeout, sender.send(envelope)).await
                {
                    Ok(Ok(())) => {},
                    Ok(Err(_)) => return Err(BrokerError::Closed),
                    Err(_) => {
                        tracing::warn!(
                            topic = %topic,
                            timeout_ms = self.config.publish_timeout.as_millis(),
                            "Queue full, publish timed out"
                        );
                        return Err(BrokerError::Timeout(topic));
                    },
                }
            }

            tracing::trace!(topic = %topic, message_id = %message.id(), "Message queued");
            Ok(())
        })
    }
}

impl Subscriber for MemoryQueue {
    fn subscribe(&self, subscription: &Subscription) -> BrokerFuture<'_, DeliveryStream> {
        let subscription = subscription.clone();

        Box::pin(async move {
            let group = self.attach(&subscription);

            tracing::info!(
                topic = %subscription.topic,
                consumer_group = %subscription.consumer_group,
                "Subscribed to in-memory queue"
            );

            let stream = async_stream::stream! {
                loop {
                    let next = {
                        let mut receiver = group.receiver.lock().await;
                        receiver.recv().await
                    };
                    let Some(envelope) = next else {
                        break;
                    };

                    group.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    let message = envelope.message.clone();
                    let attempt = envelope.attempt;
                    yield Delivery::new(
                        message,
                        attempt,
                        QueueAcknowledger {
                            envelope,
                            sender: group.sender.clone(),
                            counters: Arc::clone(&group.counters),
                        },
                    );
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

struct QueueAcknowledger {
    envelope: Envelope,
    sender: mpsc::Sender<Envelope>,
    counters: Arc<Counters>,
}

impl Acknowledger for QueueAcknowledger {
    fn ack(self: Box<Self>) {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    fn nack(self: Box<Self>) {
        let Self {
            envelope,
            sender,
            counters,
        } = *self;
        counters.nacked.fetch_add(1, Ordering::Relaxed);

        let retry = Envelope {
            message: envelope.message,
            attempt: envelope.attempt + 1,
        };
        match sender.try_send(retry) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(retry)) => requeue_later(sender, retry),
            Err(mpsc::error::TrySendError::Closed(retry)) => {
                tracing::warn!(
                    message_id = %retry.message.id(),
                    "Queue closed, nacked message cannot be redelivered"
                );
            },
        }
    }
}

/// Requeue without blocking the consumer that nacked: it may be the only one
/// draining the full buffer.
fn requeue_later(sender: mpsc::Sender<Envelope>, envelope: Envelope) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let message_id = envelope.message.id();
                if sender.send(envelope).await.is_err() {
                    tracing::warn!(%message_id, "Queue closed before nacked message was requeued");
                }
            });
        },
        Err(_) => {
            tracing::error!(
                message_id = %envelope.message.id(),
                "Queue full and no runtime to requeue nacked message"
            );
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use futures::StreamExt;

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = MemoryQueue::default();
        let sub = Subscription::new("progress", "printer");
        let mut stream = queue.subscribe(&sub).await.unwrap();

        for body in ["1", "2", "3"] {
            queue.publish("progress", message(body)).await.unwrap();
        }

        for expected in ["1", "2", "3"] {
            let delivery = stream.next().await.unwrap();
            assert_eq!(delivery.message().payload(), expected.as_bytes());
            delivery.ack();
        }
        assert_eq!(
            queue.stats(&sub),
            DeliveryStats {
                delivered: 3,
                acked: 3,
                nacked: 0
            }
        );
    }

    #[tokio::test]
    async fn consumers_in_one_group_split_messages() {
        let queue = MemoryQueue::default();
        let sub = Subscription::new("tasks", "workers");
        let mut first = queue.subscribe(&sub).await.unwrap();
        let mut second = queue.subscribe(&sub).await.unwrap();

        queue.publish("tasks", message("a")).await.unwrap();
        queue.publish("tasks", message("b")).await.unwrap();

        let one = first.next().await.unwrap();
        let two = second.next().await.unwrap();
        assert_ne!(one.message().id(), two.message().id());
        one.ack();
        two.ack();

        let nothing_left =
            tokio::time::timeout(Duration::from_millis(20), first.next()).await;
        assert!(nothing_left.is_err());
    }

    #[tokio::test]
    async fn distinct_groups_each_get_a_copy() {
        let queue = MemoryQueue::default();
        let mut receipts = queue
            .subscribe(&Subscription::new("booked", "receipts"))
            .await
            .unwrap();
        let mut tracker = queue
            .subscribe(&Subscription::new("booked", "tracker"))
            .await
            .unwrap();

        let sent = message("T1");
        queue.publish("booked", sent.clone()).await.unwrap();

        let a = receipts.next().await.unwrap();
        let b = tracker.next().await.unwrap();
        assert_eq!(a.message().id(), sent.id());
        assert_eq!(b.message().id(), sent.id());
        a.ack();
        b.ack();
    }

    #[tokio::test]
    async fn nack_redelivers_with_next_attempt() {
        let queue = MemoryQueue::default();
        let sub = Subscription::new("alarms", "sensor");
        let mut stream = queue.subscribe(&sub).await.unwrap();
        queue.publish("alarms", message("1")).await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.attempt(), 1);
        first.nack();

        let second = stream.next().await.unwrap();
        assert_eq!(second.attempt(), 2);
        second.ack();

        let stats = queue.stats(&sub);
        assert_eq!((stats.delivered, stats.acked, stats.nacked), (2, 1, 1));
    }

    #[tokio::test]
    async fn backlog_reaches_groups_attaching_later() {
        let queue = MemoryQueue::default();
        queue.publish("early", message("x")).await.unwrap();

        let mut one = queue.subscribe(&Subscription::new("early", "g1")).await.unwrap();
        let mut two = queue.subscribe(&Subscription::new("early", "g2")).await.unwrap();

        assert_eq!(one.next().await.unwrap().message().payload(), b"x");
        assert_eq!(two.next().await.unwrap().message().payload(), b"x");
    }

    #[tokio::test]
    async fn backlog_is_dropped_once_the_topic_is_live() {
        let queue = MemoryQueue::default();
        queue.publish("early", message("x")).await.unwrap();

        let mut first = queue.subscribe(&Subscription::new("early", "g1")).await.unwrap();
        queue.publish("early", message("live")).await.unwrap();
        assert_eq!(first.next().await.unwrap().message().payload(), b"x");
        assert_eq!(first.next().await.unwrap().message().payload(), b"live");

        let mut late = queue.subscribe(&Subscription::new("early", "g2")).await.unwrap();
        queue.publish("early", message("after")).await.unwrap();
        assert_eq!(late.next().await.unwrap().message().payload(), b"after");

        let nothing_left = tokio::time::timeout(Duration::from_millis(20), late.next()).await;
        assert!(nothing_left.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_times_out_publish() {
        let queue = MemoryQueue::new(QueueConfig {
            capacity: 1,
            publish_timeout: Duration::from_millis(50),
        });
        let _stream = queue.subscribe(&Subscription::new("slow", "g")).await.unwrap();

        queue.publish("slow", message("1")).await.unwrap();
        let err = queue.publish("slow", message("2")).await.unwrap_err();

        assert_eq!(err, BrokerError::Timeout("slow".to_string()));
    }
}
