//! Consumer runtime: turns handler results into broker settlements.
//!
//! # Lifecycle
//!
//! ```text
//! subscribe ──► consume(queue, prefetch 1) ──► loop {
//!     delivery ─► decode ─► handler ─► Ok  ─► ack
//!                   │                  Err ─► reject(requeue = false) ─► DLQ
//!                   └── malformed ──────────► reject(requeue = false) ─► DLQ
//! } ──► cancel ──► finish in-flight delivery ──► close channel
//! ```
//!
//! Deliveries are handled strictly one at a time. A message is settled only
//! after its handler has returned, so a crash before settlement leaves it
//! unacknowledged and the broker redelivers it.
//!
//! # Example
//!
//! ```ignore
//! let runtime = ConsumerRuntime::new(source);
//! let handle = runtime
//!     .subscribe(QueueTopology::for_consumer("crm"), handler)
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! let stats = handle.cancel().await?;
//! ```

use crate::metrics::ConsumerMetrics;
use event_relay_core::broker::DeliverySource;
use event_relay_core::delivery::{Delivery, Subscription};
use event_relay_core::error::{BrokerError, HandlerError};
use event_relay_core::event::Event;
use event_relay_core::handler::EventHandler;
use event_relay_core::topology::QueueTopology;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// How a single delivery was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded, message acknowledged.
    Acknowledged,
    /// Decode or handler failure, message rejected to the dead-letter queue.
    DeadLettered,
}

/// Settlement counts for one subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries acknowledged.
    pub acknowledged: u64,
    /// Deliveries rejected without requeue.
    pub dead_lettered: u64,
}

impl ConsumerStats {
    /// Total settled deliveries.
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.acknowledged + self.dead_lettered
    }
}

#[derive(Debug, Default)]
struct Counters {
    acknowledged: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            acknowledged: self.acknowledged.load(Ordering::Acquire),
            dead_lettered: self.dead_lettered.load(Ordering::Acquire),
        }
    }
}

/// Binds handlers to queues through a [`DeliverySource`].
#[derive(Clone)]
pub struct ConsumerRuntime {
    source: Arc<dyn DeliverySource>,
    processing_deadline: Option<Duration>,
}

impl ConsumerRuntime {
    /// Runtime consuming from `source`, with no processing deadline.
    #[must_use]
    pub fn new(source: Arc<dyn DeliverySource>) -> Self {
        Self {
            source,
            processing_deadline: None,
        }
    }

    /// Dead-letter deliveries whose handler runs longer than `deadline`.
    #[must_use]
    pub const fn with_processing_deadline(mut self, deadline: Duration) -> Self {
        self.processing_deadline = Some(deadline);
        self
    }

    /// Start consuming `topology.queue` with `handler`.
    ///
    /// The topology must already be declared. Returns once the broker has
    /// registered the consumer; deliveries are processed on a spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the topology is invalid or the broker refuses
    /// the subscription.
    pub async fn subscribe<H>(
        &self,
        topology: QueueTopology,
        handler: H,
    ) -> Result<SubscriptionHandle, BrokerError>
    where
        H: EventHandler + 'static,
    {
        topology.validate()?;
        let subscription = self.source.consume(&topology).await?;

        tracing::info!(
            consumer = %topology.consumer_name,
            queue = %topology.queue,
            prefetch = topology.prefetch(),
            "Consumer started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let span = tracing::info_span!(
            "consumer",
            consumer = %topology.consumer_name,
            queue = %topology.queue
        );

        let worker = Worker {
            queue: topology.queue.clone(),
            handler,
            processing_deadline: self.processing_deadline,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(worker.run(subscription, shutdown_rx).instrument(span));

        Ok(SubscriptionHandle {
            queue: topology.queue,
            consumer_name: topology.consumer_name,
            shutdown: shutdown_tx,
            counters,
            task,
        })
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle leaves the consumer running; use [`cancel`](Self::cancel)
/// to stop it.
pub struct SubscriptionHandle {
    queue: String,
    consumer_name: String,
    shutdown: watch::Sender<bool>,
    counters: Arc<Counters>,
    task: JoinHandle<Result<ConsumerStats, BrokerError>>,
}

impl SubscriptionHandle {
    /// Consumer tag of this subscription.
    #[must_use]
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Settlement counts so far.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Whether the consumer loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop taking new deliveries, let the in-flight one settle, then close.
    ///
    /// Unsettled prefetched messages return to the queue when the channel
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the delivery stream failed before
    /// cancellation, or the consumer task panicked.
    pub async fn cancel(self) -> Result<ConsumerStats, BrokerError> {
        // The loop may already have exited, in which case nobody is listening.
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Wait for the consumer loop to exit on its own.
    ///
    /// The loop exits when the broker ends or fails the delivery stream.
    ///
    /// # Errors
    ///
    /// Returns the [`BrokerError`] that ended the stream, if any.
    pub async fn join(self) -> Result<ConsumerStats, BrokerError> {
        let Self {
            queue,
            shutdown,
            task,
            ..
        } = self;

        let result = task.await.map_err(|e| BrokerError::Consume {
            queue,
            reason: format!("consumer task failed: {e}"),
        })?;
        drop(shutdown);
        result
    }
}

struct Worker<H> {
    queue: String,
    handler: H,
    processing_deadline: Option<Duration>,
    counters: Arc<Counters>,
}

impl<H: EventHandler> Worker<H> {
    async fn run(
        self,
        subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, BrokerError> {
        let (mut deliveries, closer) = subscription.into_parts();
        let mut listening = true;
        let mut ended = Ok(());

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed(), if listening => {
                    if changed.is_err() {
                        // Handle dropped without cancelling: keep consuming.
                        listening = false;
                    } else if *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => match self.process(delivery).await {
                        Some(DeliveryOutcome::Acknowledged) => {
                            self.counters.acknowledged.fetch_add(1, Ordering::AcqRel);
                        }
                        Some(DeliveryOutcome::DeadLettered) => {
                            self.counters.dead_lettered.fetch_add(1, Ordering::AcqRel);
                        }
                        None => {}
                    },
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Delivery stream failed");
                        ended = Err(e);
                        break;
                    }
                    None => {
                        tracing::info!("Delivery stream ended");
                        break;
                    }
                }
            }
        }

        drop(deliveries);
        if let Err(e) = closer.close().await {
            tracing::warn!(error = %e, "Failed to close subscription cleanly");
        }

        let stats = self.counters.snapshot();
        tracing::info!(
            acknowledged = stats.acknowledged,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        ended.map(|()| stats)
    }

    /// Handle and settle one delivery. `None` means settlement failed and the
    /// broker still owns the message.
    async fn process(&self, delivery: Delivery) -> Option<DeliveryOutcome> {
        let started = Instant::now();
        let correlation_id = delivery.correlation_id_or_dash().to_string();

        tracing::info!(
            routing_key = %delivery.routing_key,
            correlation_id = %correlation_id,
            redelivered = delivery.redelivered,
            "Received message"
        );

        let result = match Event::from_json_bytes(&delivery.body) {
            Ok(event) => {
                let event_id = event.event_id.clone();
                let result = self.invoke(event).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        event_id = %event_id,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Handler failed"
                    );
                }
                result
            }
            Err(e) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to decode message"
                );
                Err(HandlerError::Decode(e.to_string()))
            }
        };

        ConsumerMetrics::record_handler_duration(&self.queue, started.elapsed());

        match result {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    ConsumerMetrics::record_acknowledged(&self.queue);
                    Some(DeliveryOutcome::Acknowledged)
                }
                Err(e) => {
                    ConsumerMetrics::record_settlement_error(&self.queue);
                    tracing::error!(
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to acknowledge message, broker will redeliver"
                    );
                    None
                }
            },
            Err(err) => match delivery.dead_letter().await {
                Ok(()) => {
                    ConsumerMetrics::record_dead_lettered(&self.queue, err.kind());
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        reason = err.kind(),
                        "Message sent to dead-letter queue"
                    );
                    Some(DeliveryOutcome::DeadLettered)
                }
                Err(e) => {
                    ConsumerMetrics::record_settlement_error(&self.queue);
                    tracing::error!(
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to reject message, broker will redeliver"
                    );
                    None
                }
            },
        }
    }

    async fn invoke(&self, event: Event) -> Result<(), HandlerError> {
        match self.processing_deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.handler.handle(event))
                .await
                .unwrap_or(Err(HandlerError::TimedOut(deadline))),
            None => self.handler.handle(event).await,
        }
    }
}
