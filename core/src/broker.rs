//! Broker seams: topology declaration, publishing and consuming.
//!
//! Every service owns one broker connection and hands it, explicitly, to the
//! three components built on these traits. There is no process-wide connection.
//!
//! ```text
//! ┌──────────┐  publish   ┌───────────┐  topic route  ┌────────────┐  deliver  ┌─────────────────┐
//! │ Producer │───────────►│  Exchange │──────────────►│ Main queue │──────────►│ ConsumerRuntime │
//! └──────────┘            └───────────┘               └─────┬──────┘           └────────┬────────┘
//!                                                           │ reject, no requeue        │ ack / reject
//!                                                           ▼                           │
//!                                                     ┌────────────┐◄──────────────────┘
//!                                                     │    DLQ     │
//!                                                     └────────────┘
//! ```
//!
//! # Dyn Compatibility
//!
//! These traits return `Pin<Box<dyn Future>>` instead of using `async fn` so
//! they can be held as `Arc<dyn Publisher>` and friends, letting tests swap the
//! AMQP implementation for the in-memory broker.

use crate::delivery::{BoxFuture, Subscription};
use crate::error::{BrokerError, PublishError};
use crate::topology::QueueTopology;

/// Declares exchanges, queues and bindings.
///
/// Declaration is idempotent: declaring an already-correct topology is a
/// successful no-op. Any error means the whole sequence must be retried.
pub trait TopologyManager: Send + Sync {
    /// Declare the exchange, the dead-letter queue, the main queue (with its
    /// dead-letter target set at declaration time) and one binding per routing key.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if any declaration or binding fails.
    fn declare<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;
}

/// Publishes durable messages to the topic exchange.
pub trait Publisher: Send + Sync {
    /// Publish `payload` under `routing_key`.
    ///
    /// The message is persistent and carries content type, correlation id and a
    /// publish timestamp in its properties. Bounded by the publisher's timeout;
    /// failures are reported, never retried here.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the attempt fails or times out.
    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        payload: &'a [u8],
        correlation_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PublishError>>;
}

/// Opens manual-acknowledgement subscriptions with prefetch 1.
pub trait DeliverySource: Send + Sync {
    /// Start consuming `topology.queue` as `topology.consumer_name`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the channel or consumer cannot be created.
    fn consume<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<Subscription, BrokerError>>;
}
