//! Broker-provided envelopes and their settlement.
//!
//! A [`Delivery`] is owned by the consumer runtime for exactly one handler
//! invocation. Settling it ([`Delivery::ack`] or [`Delivery::dead_letter`])
//! consumes it, so it cannot be settled twice or retained afterwards.

use crate::error::BrokerError;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by broker seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Settles one delivery with the broker.
///
/// Implemented per broker; the in-memory broker and the AMQP client each
/// provide one. Both methods consume the acknowledger.
pub trait Acknowledger: Send {
    /// Remove the message from its queue permanently.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>>;

    /// Reject without requeue. The broker routes the message to the queue's
    /// dead-letter target, if one was declared.
    fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>>;
}

/// A received message.
pub struct Delivery {
    /// Raw message body.
    pub body: Vec<u8>,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Correlation id from the message properties, not the payload.
    pub correlation_id: Option<String>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a received message together with its acknowledger.
    #[must_use]
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        correlation_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            correlation_id,
            redelivered,
            acker,
        }
    }

    /// Correlation id for logging, or `"-"` when the publisher set none.
    #[must_use]
    pub fn correlation_id_or_dash(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or("-")
    }

    /// Acknowledge the message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledge`] if the broker could not be told.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject without requeue, sending the message to the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledge`] if the broker could not be told.
    pub async fn dead_letter(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Tears down the broker side of a subscription.
pub trait SubscriptionCloser: Send {
    /// Cancel the broker consumer and close its channel.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>>;
}

/// An open subscription: the delivery stream plus a way to close it.
pub struct Subscription {
    /// Deliveries in broker order.
    pub deliveries: DeliveryStream,
    closer: Box<dyn SubscriptionCloser>,
}

impl Subscription {
    /// Pair a delivery stream with its closer.
    #[must_use]
    pub fn new(deliveries: DeliveryStream, closer: Box<dyn SubscriptionCloser>) -> Self {
        Self { deliveries, closer }
    }

    /// Split into stream and closer so the stream can be dropped before closing.
    #[must_use]
    pub fn into_parts(self) -> (DeliveryStream, Box<dyn SubscriptionCloser>) {
        (self.deliveries, self.closer)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
