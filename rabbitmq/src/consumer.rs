//! Manual-ack subscriptions.

use crate::connection::RabbitConnection;
use event_relay_core::broker::DeliverySource;
use event_relay_core::delivery::{Acknowledger, BoxFuture, Delivery, Subscription, SubscriptionCloser};
use event_relay_core::error::BrokerError;
use event_relay_core::topology::QueueTopology;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;

/// Opens one channel per subscription with prefetch applied.
#[derive(Clone)]
pub struct RabbitDeliverySource {
    connection: RabbitConnection,
}

impl RabbitDeliverySource {
    /// Source opening channels on `connection`.
    #[must_use]
    pub const fn new(connection: RabbitConnection) -> Self {
        Self { connection }
    }
}

impl DeliverySource for RabbitDeliverySource {
    fn consume<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<Subscription, BrokerError>> {
        Box::pin(async move {
            let consume_error = |reason: String| BrokerError::Consume {
                queue: topology.queue.clone(),
                reason,
            };

            let channel = self.connection.create_channel().await?;
            channel
                .basic_qos(topology.prefetch(), BasicQosOptions::default())
                .await
                .map_err(|e| consume_error(format!("failed to set prefetch: {e}")))?;

            let consumer = channel
                .basic_consume(
                    &topology.queue,
                    &topology.consumer_name,
                    BasicConsumeOptions {
                        no_ack: false,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| consume_error(e.to_string()))?;

            tracing::info!(
                queue = %topology.queue,
                consumer = %topology.consumer_name,
                prefetch = topology.prefetch(),
                "Subscribed to queue"
            );

            let queue = topology.queue.clone();
            let deliveries = consumer.map(move |item| match item {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(e) => Err(BrokerError::Consume {
                    queue: queue.clone(),
                    reason: e.to_string(),
                }),
            });

            let closer = RabbitCloser {
                channel,
                consumer_tag: topology.consumer_name.clone(),
            };

            Ok(Subscription::new(Box::pin(deliveries), Box::new(closer)))
        })
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    Delivery::new(
        delivery.data,
        delivery.routing_key.as_str(),
        correlation_id,
        delivery.redelivered,
        Box::new(RabbitAcker(delivery.acker)),
    )
}

struct RabbitAcker(Acker);

impl Acknowledger for RabbitAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::Acknowledge(e.to_string()))
        })
    }

    fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            self.0
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map_err(|e| BrokerError::Acknowledge(e.to_string()))
        })
    }
}

struct RabbitCloser {
    channel: Channel,
    consumer_tag: String,
}

impl SubscriptionCloser for RabbitCloser {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            if let Err(e) = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                tracing::debug!(consumer = %self.consumer_tag, error = %e, "Consumer already cancelled");
            }

            // Closing the channel hands any unacknowledged deliveries back to the queue.
            self.channel
                .close(200, "OK")
                .await
                .map_err(|e| BrokerError::Closed(e.to_string()))?;

            tracing::info!(consumer = %self.consumer_tag, "Subscription closed");
            Ok(())
        })
    }
}
