//! Idempotent declaration of exchange, queues and bindings.

use crate::connection::RabbitConnection;
use event_relay_core::broker::TopologyManager;
use event_relay_core::delivery::BoxFuture;
use event_relay_core::error::BrokerError;
use event_relay_core::topology::QueueTopology;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

/// Declares [`QueueTopology`] on a RabbitMQ broker.
///
/// Each `declare` call runs on a short-lived channel: a failed declaration
/// (for example `PRECONDITION_FAILED` on mismatched queue arguments) closes
/// the channel it ran on.
#[derive(Clone)]
pub struct RabbitTopologyManager {
    connection: RabbitConnection,
}

impl RabbitTopologyManager {
    /// Manager opening channels on `connection`.
    #[must_use]
    pub const fn new(connection: RabbitConnection) -> Self {
        Self { connection }
    }
}

/// Arguments routing rejected messages to `dead_letter_queue` through the
/// default exchange.
pub(crate) fn dead_letter_arguments(dead_letter_queue: &str) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("".into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dead_letter_queue.into()),
    );
    arguments
}

pub(crate) async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Declaration {
            entity: exchange.to_string(),
            reason: e.to_string(),
        })
}

async fn declare_on(channel: &Channel, topology: &QueueTopology) -> Result<(), BrokerError> {
    let durable = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };

    declare_exchange(channel, &topology.exchange).await?;

    channel
        .queue_declare(&topology.dead_letter_queue, durable, FieldTable::default())
        .await
        .map_err(|e| BrokerError::Declaration {
            entity: topology.dead_letter_queue.clone(),
            reason: e.to_string(),
        })?;

    channel
        .queue_declare(
            &topology.queue,
            durable,
            dead_letter_arguments(&topology.dead_letter_queue),
        )
        .await
        .map_err(|e| BrokerError::Declaration {
            entity: topology.queue.clone(),
            reason: e.to_string(),
        })?;

    for routing_key in &topology.routing_keys {
        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declaration {
                entity: format!("{} -> {} ({routing_key})", topology.exchange, topology.queue),
                reason: e.to_string(),
            })?;
    }

    Ok(())
}

impl TopologyManager for RabbitTopologyManager {
    fn declare<'a>(&'a self, topology: &'a QueueTopology) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            topology.validate()?;
            let channel = self.connection.create_channel().await?;

            let result = declare_on(&channel, topology).await;
            match &result {
                Ok(()) => {
                    if let Err(e) = channel.close(200, "OK").await {
                        tracing::debug!(error = %e, "Topology channel already closed");
                    }
                    tracing::info!(
                        exchange = %topology.exchange,
                        queue = %topology.queue,
                        dead_letter_queue = %topology.dead_letter_queue,
                        routing_keys = ?topology.routing_keys,
                        "Topology declared"
                    );
                }
                Err(e) => {
                    tracing::error!(queue = %topology.queue, error = %e, "Topology declaration failed");
                }
            }
            result
        })
    }
}
