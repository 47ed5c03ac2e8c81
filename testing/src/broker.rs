//! In-memory message broker.
//!
//! Models the parts of a topic-exchange broker the delivery pipeline relies
//! on:
//! - durable exchanges, queues and bindings declared idempotently
//! - topic routing with `*` / `#` wildcards
//! - per-consumer prefetch with explicit ack and reject
//! - reject-without-requeue routing to the queue's dead-letter target
//! - unacknowledged messages returned to the queue (flagged redelivered) when
//!   a subscription closes
//!
//! Everything lives behind one mutex that is never held across an await.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use event_relay_core::broker::{DeliverySource, Publisher, TopologyManager};
use event_relay_core::delivery::{Acknowledger, BoxFuture, Delivery, Subscription, SubscriptionCloser};
use event_relay_core::error::{BrokerError, PublishError};
use event_relay_core::event::Event;
use event_relay_core::topology::{DEFAULT_EXCHANGE, QueueTopology, topic_matches};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A message sitting in a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    /// Routing key it was published with.
    pub routing_key: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// Correlation id message property.
    pub correlation_id: Option<String>,
    /// Whether it has been delivered before.
    pub redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
    dead_letter_target: Option<String>,
    consumers: usize,
}

impl QueueState {
    fn new(dead_letter_target: Option<String>) -> Self {
        Self {
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            dead_letter_target,
            consumers: 0,
        }
    }

    fn in_flight_for(&self, consumer_id: u64) -> usize {
        self.unacked.values().filter(|(c, _)| *c == consumer_id).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<StoredMessage>,
    next_tag: u64,
    next_consumer: u64,
    publish_outage: bool,
}

impl BrokerState {
    fn declare_queue(&mut self, name: &str, dead_letter_target: Option<&str>) -> Result<(), BrokerError> {
        match self.queues.get(name) {
            Some(existing) if existing.dead_letter_target.as_deref() != dead_letter_target => {
                Err(BrokerError::Declaration {
                    entity: name.to_string(),
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-routing-key': \
                         declared {:?}, existing {:?}",
                        dead_letter_target, existing.dead_letter_target
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.queues
                    .insert(name.to_string(), QueueState::new(dead_letter_target.map(String::from)));
                Ok(())
            }
        }
    }

    fn route(&mut self, exchange: &str, message: &StoredMessage) {
        let targets: HashSet<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_back(message.clone());
            }
        }
    }

    fn take_next(&mut self, queue: &str, consumer_id: u64, prefetch: usize) -> Option<(u64, StoredMessage)> {
        let tag = self.next_tag + 1;
        let state = self.queues.get_mut(queue)?;
        if state.in_flight_for(consumer_id) >= prefetch {
            return None;
        }
        let message = state.ready.pop_front()?;
        state.unacked.insert(tag, (consumer_id, message.clone()));
        self.next_tag = tag;
        Some((tag, message))
    }
}

#[derive(Debug)]
struct Inner {
    exchange: String,
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Inner {
    fn settle(&self, queue: &str, tag: u64, dead_letter: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().unwrap();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Acknowledge(format!("queue '{queue}' deleted")))?;
            let (_, message) = queue_state
                .unacked
                .remove(&tag)
                .ok_or_else(|| BrokerError::Acknowledge(format!("unknown delivery tag {tag}")))?;

            if dead_letter {
                let target = queue_state.dead_letter_target.clone();
                if let Some(dlq) = target.and_then(|name| state.queues.get_mut(&name)) {
                    dlq.ready.push_back(StoredMessage {
                        redelivered: false,
                        ..message
                    });
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// In-memory broker implementing [`TopologyManager`], [`Publisher`] and
/// [`DeliverySource`].
///
/// Clones share state, so one clone can be handed to the producer and another
/// to the consumer runtime.
///
/// # Example
///
/// ```
/// use event_relay_core::broker::{Publisher, TopologyManager};
/// use event_relay_core::topology::QueueTopology;
/// use event_relay_testing::InMemoryBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.declare(&QueueTopology::for_consumer("crm")).await?;
/// broker.publish("user.created", b"{}", "corr-1").await?;
///
/// assert_eq!(broker.queue_len("crm.user.events"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker whose publisher targets the default `events` exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::with_exchange(DEFAULT_EXCHANGE)
    }

    /// Broker whose publisher targets `exchange`.
    #[must_use]
    pub fn with_exchange(exchange: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange: exchange.into(),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Publish an encoded event under its own routing key.
    ///
    /// # Errors
    ///
    /// Same as [`Publisher::publish`].
    pub async fn publish_event(&self, event: &Event) -> Result<(), PublishError> {
        let payload = event.to_json_bytes().map_err(|e| PublishError::Rejected {
            routing_key: event.routing_key().to_string(),
            reason: e.to_string(),
        })?;
        self.publish(event.routing_key(), &payload, &event.correlation_id)
            .await
    }

    /// Declare the publisher exchange with no queues bound, as a producer
    /// does at startup.
    pub fn declare_exchange(&self) {
        let exchange = self.inner.exchange.clone();
        self.inner.state.lock().unwrap().exchanges.insert(exchange);
    }

    /// Make every publish fail until switched off again.
    pub fn set_publish_outage(&self, outage: bool) {
        self.inner.state.lock().unwrap().publish_outage = outage;
    }

    /// Messages ready for delivery in `queue`.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet settled.
    #[must_use]
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of the ready messages in `queue`, head first.
    #[must_use]
    pub fn queue_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `queue` has been declared.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().unwrap().queues.contains_key(queue)
    }

    /// Binding patterns from the publisher exchange to `queue`.
    #[must_use]
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    /// Active consumers on `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers)
    }

    /// Every message accepted by [`Publisher::publish`], in order.
    #[must_use]
    pub fn published(&self) -> Vec<StoredMessage> {
        self.inner.state.lock().unwrap().published.clone()
    }
}

impl TopologyManager for InMemoryBroker {
    fn declare<'a>(&'a self, topology: &'a QueueTopology) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            topology.validate()?;
            let mut state = self.inner.state.lock().unwrap();

            state.exchanges.insert(topology.exchange.clone());
            state.declare_queue(&topology.dead_letter_queue, None)?;
            state.declare_queue(&topology.queue, Some(&topology.dead_letter_queue))?;

            for pattern in &topology.routing_keys {
                let binding = Binding {
                    exchange: topology.exchange.clone(),
                    pattern: pattern.clone(),
                    queue: topology.queue.clone(),
                };
                if !state.bindings.contains(&binding) {
                    state.bindings.push(binding);
                }
            }
            Ok(())
        })
    }
}

impl Publisher for InMemoryBroker {
    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        payload: &'a [u8],
        correlation_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.publish_outage {
                    return Err(PublishError::Closed("broker unavailable".to_string()));
                }
                if !state.exchanges.contains(&self.inner.exchange) {
                    return Err(PublishError::Rejected {
                        routing_key: routing_key.to_string(),
                        reason: format!("NOT_FOUND - no exchange '{}'", self.inner.exchange),
                    });
                }

                let message = StoredMessage {
                    routing_key: routing_key.to_string(),
                    body: payload.to_vec(),
                    correlation_id: Some(correlation_id.to_string()),
                    redelivered: false,
                };
                let exchange = self.inner.exchange.clone();
                state.route(&exchange, &message);
                state.published.push(message);
            }
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }
}

impl DeliverySource for InMemoryBroker {
    fn consume<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<Subscription, BrokerError>> {
        Box::pin(async move {
            let consumer_id = {
                let mut state = self.inner.state.lock().unwrap();
                state.next_consumer += 1;
                let consumer_id = state.next_consumer;
                let queue = state
                    .queues
                    .get_mut(&topology.queue)
                    .ok_or_else(|| BrokerError::Consume {
                        queue: topology.queue.clone(),
                        reason: format!("NOT_FOUND - no queue '{}'", topology.queue),
                    })?;
                queue.consumers += 1;
                consumer_id
            };

            let cancelled = Arc::new(AtomicBool::new(false));
            let inner = Arc::clone(&self.inner);
            let queue = topology.queue.clone();
            let prefetch = usize::from(topology.prefetch());
            let stream_cancelled = Arc::clone(&cancelled);

            let deliveries = async_stream::stream! {
                loop {
                    let notified = inner.notify.notified();
                    if stream_cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    let next = inner.state.lock().unwrap().take_next(&queue, consumer_id, prefetch);
                    match next {
                        Some((tag, message)) => {
                            let acker = InMemoryAcker {
                                inner: Arc::clone(&inner),
                                queue: queue.clone(),
                                tag,
                            };
                            yield Ok(Delivery::new(
                                message.body,
                                message.routing_key,
                                message.correlation_id,
                                message.redelivered,
                                Box::new(acker),
                            ));
                        }
                        None => notified.await,
                    }
                }
            };

            let closer = InMemoryCloser {
                inner: Arc::clone(&self.inner),
                queue: topology.queue.clone(),
                consumer_id,
                cancelled,
            };

            Ok(Subscription::new(Box::pin(deliveries), Box::new(closer)))
        })
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
}

impl Acknowledger for InMemoryAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move { self.inner.settle(&self.queue, self.tag, false) })
    }

    fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move { self.inner.settle(&self.queue, self.tag, true) })
    }
}

struct InMemoryCloser {
    inner: Arc<Inner>,
    queue: String,
    consumer_id: u64,
    cancelled: Arc<AtomicBool>,
}

impl SubscriptionCloser for InMemoryCloser {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            self.cancelled.store(true, Ordering::Release);
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(queue) = state.queues.get_mut(&self.queue) {
                    let mut returned: Vec<(u64, StoredMessage)> = queue
                        .unacked
                        .iter()
                        .filter(|(_, (consumer, _))| *consumer == self.consumer_id)
                        .map(|(tag, (_, message))| (*tag, message.clone()))
                        .collect();
                    returned.sort_by_key(|(tag, _)| *tag);

                    for (tag, message) in returned.into_iter().rev() {
                        queue.unacked.remove(&tag);
                        queue.ready.push_front(StoredMessage {
                            redelivered: true,
                            ..message
                        });
                    }
                    queue.consumers = queue.consumers.saturating_sub(1);
                }
            }
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }
}
