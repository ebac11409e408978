//! In-process stream broker with consumer groups.

use super::DeliveryStats;
use crate::broker::{
    AckState, Acknowledger, BrokerFuture, Delivery, DeliveryStream, Publisher, Subscriber,
    Subscription,
};
use crate::message::Message;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Where a consumer group starts reading when it is first created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartFrom {
    /// Replay every message already in the topic
    #[default]
    Earliest,
    /// Only messages published after the group was created
    Latest,
}

/// Configuration for [`MemoryStream`].
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// How long a delivered message may stay unsettled before another
    /// consumer of the same group may claim it
    pub visibility_timeout: Duration,
    /// Upper bound on how long an idle consumer waits before re-checking
    /// for expired leases
    pub poll_interval: Duration,
    /// Starting position of newly created groups
    pub start_from: StartFrom,
    /// Entries every group has settled that a topic keeps for late
    /// `Earliest` groups and for inspection; older ones are dropped
    pub max_retained: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            start_from: StartFrom::Earliest,
            max_retained: 1024,
        }
    }
}

/// In-process stream broker.
///
/// Every topic is an append-only log. Each consumer group keeps:
///
/// - a cursor: the next log entry never delivered to the group
/// - a pending list: delivered but unsettled entries with their delivery
///   count and lease deadline
///
/// A consumer claims, in order, an entry whose lease expired, an entry that
/// was nacked, or the next unread entry. Acking removes the entry from the
/// pending list. Settlements from a consumer whose lease was taken over are
/// ignored.
///
/// Offsets are absolute. Entries below every group's cursor and pending list
/// are settled; beyond [`StreamConfig::max_retained`] of them the oldest are
/// dropped. A topic without groups keeps only its last `max_retained` entries.
#[derive(Clone)]
pub struct MemoryStream {
    config: StreamConfig,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
    max_retained: usize,
}

#[derive(Default)]
struct TopicLog {
    // Offset of `entries[0]`
    base: usize,
    entries: VecDeque<Message>,
    index: HashMap<Uuid, usize>,
    groups: HashMap<String, GroupCursor>,
}

impl TopicLog {
    fn end(&self) -> usize {
        self.base + self.entries.len()
    }

    fn get(&self, offset: usize) -> Option<&Message> {
        self.entries.get(offset.checked_sub(self.base)?)
    }

    fn push(&mut self, message: Message) {
        self.index.insert(message.id(), self.end());
        self.entries.push_back(message);
    }

    /// Drop settled entries beyond `max_retained`.
    fn compact(&mut self, max_retained: usize) {
        let settled = self
            .groups
            .values()
            .map(|cursor| {
                cursor
                    .pending
                    .keys()
                    .next()
                    .map_or(cursor.next, |&first| first.min(cursor.next))
            })
            .min()
            .unwrap_or_else(|| self.end());

        let excess = settled.saturating_sub(self.base).saturating_sub(max_retained);
        for _ in 0..excess {
            let Some(message) = self.entries.pop_front() else {
                break;
            };
            if self.index.get(&message.id()) == Some(&self.base) {
                self.index.remove(&message.id());
            }
            self.base += 1;
        }
    }
}

#[derive(Default)]
struct GroupCursor {
    next: usize,
    pending: BTreeMap<usize, Lease>,
    redeliver: VecDeque<usize>,
    stats: DeliveryStats,
}

struct Lease {
    deliveries: u32,
    // `None` once nacked, until claimed again
    expires_at: Option<Instant>,
}

struct Claim {
    offset: usize,
    deliveries: u32,
    message: Message,
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

impl MemoryStream {
    /// Create a stream broker with the given configuration.
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        let shared = Shared {
            state: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            max_retained: config.max_retained,
        };
        Self {
            config,
            shared: Arc::new(shared),
        }
    }

    /// Settlement counters for one subscription.
    #[must_use]
    pub fn stats(&self, subscription: &Subscription) -> DeliveryStats {
        let state = self.shared.lock();
        state
            .get(&subscription.topic)
            .and_then(|log| log.groups.get(&subscription.consumer_group))
            .map(|cursor| cursor.stats)
            .unwrap_or_default()
    }

    /// Acknowledgement state of a message for one consumer group.
    ///
    /// Returns `None` if the topic, group or message is unknown, including
    /// messages already dropped from the log.
    #[must_use]
    pub fn ack_state(&self, subscription: &Subscription, message_id: Uuid) -> Option<AckState> {
        let state = self.shared.lock();
        let log = state.get(&subscription.topic)?;
        let offset = *log.index.get(&message_id)?;
        let cursor = log.groups.get(&subscription.consumer_group)?;

        Some(match cursor.pending.get(&offset) {
            Some(lease) if lease.expires_at.is_none() => AckState::Nacked,
            Some(_) => AckState::Pending,
            None if offset < cursor.next => AckState::Acked,
            None => AckState::Pending,
        })
    }

    /// Number of unsettled entries (delivered or nacked) for one subscription.
    #[must_use]
    pub fn pending(&self, subscription: &Subscription) -> usize {
        let state = self.shared.lock();
        state
            .get(&subscription.topic)
            .and_then(|log| log.groups.get(&subscription.consumer_group))
            .map_or(0, |cursor| cursor.pending.len())
    }

    /// Number of entries the topic's log currently holds.
    #[must_use]
    pub fn retained(&self, topic: &str) -> usize {
        self.shared.lock().get(topic).map_or(0, |log| log.entries.len())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, subscription: &Subscription, start_from: StartFrom) {
        let mut state = self.lock();
        let log = state.entry(subscription.topic.clone()).or_default();
        let next = match start_from {
            StartFrom::Earliest => log.base,
            StartFrom::Latest => log.end(),
        };
        log.groups
            .entry(subscription.consumer_group.clone())
            .or_insert_with(|| GroupCursor {
                next,
                ..GroupCursor::default()
            });
    }

    fn claim(&self, subscription: &Subscription, visibility: Duration) -> Option<Claim> {
        let mut state = self.lock();
        let log = state.get_mut(&subscription.topic)?;
        let end = log.end();
        let cursor = log.groups.get_mut(&subscription.consumer_group)?;
        let now = Instant::now();

        let expired = cursor
            .pending
            .iter()
            .find(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(&offset, _)| offset);

        let offset = if let Some(offset) = expired {
            offset
        } else if let Some(offset) = cursor.redeliver.pop_front() {
            offset
        } else if cursor.next < end {
            cursor.next += 1;
            cursor.next - 1
        } else {
            return None;
        };

        let Some(message) = log.get(offset).cloned() else {
            // Only reachable if the log dropped an entry still owed to a group.
            tracing::error!(subscription = %subscription, offset, "Claimed offset is no longer retained");
            return None;
        };
        let cursor = log.groups.get_mut(&subscription.consumer_group)?;
        let lease = cursor.pending.entry(offset).or_insert(Lease {
            deliveries: 0,
            expires_at: None,
        });
        lease.deliveries += 1;
        lease.expires_at = Some(now + visibility);
        let deliveries = lease.deliveries;
        cursor.stats.delivered += 1;

        Some(Claim {
            offset,
            deliveries,
            message,
        })
    }

    fn settle(&self, subscription: &Subscription, offset: usize, deliveries: u32, outcome: AckState) {
        let wake = {
            let mut state = self.lock();
            let Some(log) = state.get_mut(&subscription.topic) else {
                return;
            };
            let Some(cursor) = log.groups.get_mut(&subscription.consumer_group) else {
                return;
            };

            if cursor.pending.get(&offset).map(|lease| lease.deliveries) != Some(deliveries) {
                tracing::debug!(
                    subscription = %subscription,
                    offset,
                    "Ignoring settlement from a consumer whose lease was taken over"
                );
                return;
            }

            match outcome {
                AckState::Acked => {
                    cursor.pending.remove(&offset);
                    cursor.stats.acked += 1;
                    log.compact(self.max_retained);
                    false
                },
                AckState::Nacked => {
                    if let Some(lease) = cursor.pending.get_mut(&offset) {
                        lease.expires_at = None;
                    }
                    cursor.redeliver.push_back(offset);
                    cursor.stats.nacked += 1;
                    true
                },
                AckState::Pending => false,
            }
        };

        if wake {
            self.notify.notify_waiters();
        }
    }
}

impl Publisher for MemoryStream {
    fn publish(&self, topic: &str, message: Message) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();

        Box::pin(async move {
            tracing::trace!(topic = %topic, message_id = %message.id(), "Appending message to stream");
            {
                let mut state = self.shared.lock();
                let log = state.entry(topic).or_default();
                log.push(message);
                log.compact(self.shared.max_retained);
            }
            self.shared.notify.notify_waiters();
            Ok(())
        })
    }
}

impl Subscriber for MemoryStream {
    fn subscribe(&self, subscription: &Subscription) -> BrokerFuture<'_, DeliveryStream> {
        let subscription = subscription.clone();

        Box::pin(async move {
            self.shared.attach(&subscription, self.config.start_from);

            tracing::info!(
                topic = %subscription.topic,
                consumer_group = %subscription.consumer_group,
                start_from = ?self.config.start_from,
                "Subscribed to in-memory stream"
            );

            let shared = Arc::clone(&self.shared);
            let visibility = self.config.visibility_timeout;
            let poll_interval = self.config.poll_interval;

            let stream = async_stream::stream! {
                loop {
                    // Register interest before checking, so a publish between
                    // the check and the wait is not missed.
                    let mut notified = std::pin::pin!(shared.notify.notified());
                    notified.as_mut().enable();

                    if let Some(claim) = shared.claim(&subscription, visibility) {
                        let acknowledger = StreamAcknowledger {
                            shared: Arc::clone(&shared),
                            subscription: subscription.clone(),
                            offset: claim.offset,
                            deliveries: claim.deliveries,
                        };
                        yield Delivery::new(claim.message, claim.deliveries, acknowledger);
                    } else {
                        let _ = tokio::time::timeout(poll_interval, notified).await;
                    }
                }
                #[allow(unreachable_code)]
                ()
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

struct StreamAcknowledger {
    shared: Arc<Shared>,
    subscription: Subscription,
    offset: usize,
    deliveries: u32,
}

impl Acknowledger for StreamAcknowledger {
    fn ack(self: Box<Self>) {
        self.shared
            .settle(&self.subscription, self.offset, self.deliveries, AckState::Acked);
    }

    fn nack(self: Box<Self>) {
        self.shared
            .settle(&self.subscription, self.offset, self.deliveries, AckState::Nacked);
    }
}
