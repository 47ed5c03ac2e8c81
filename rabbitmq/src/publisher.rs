//! Persistent, time-bounded publishing to the topic exchange.

use crate::connection::RabbitConnection;
use crate::topology::declare_exchange;
use event_relay_core::broker::Publisher;
use event_relay_core::delivery::BoxFuture;
use event_relay_core::error::PublishError;
use event_relay_core::event::CONTENT_TYPE_JSON;
use event_relay_runtime::metrics::PublisherMetrics;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use std::future::Future;
use std::time::{Duration, Instant};

/// AMQP delivery mode for messages written to disk.
const PERSISTENT: u8 = 2;

/// Default bound on handing a single message to the broker.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes to one exchange on a dedicated channel.
///
/// A publish succeeds once the message has been written to the channel.
/// Publisher confirms are not enabled. Nothing is retried: a timeout or
/// channel error goes straight back to the caller.
pub struct RabbitPublisher {
    channel: Channel,
    exchange: String,
    publish_timeout: Duration,
}

impl RabbitPublisher {
    /// Open a channel and declare the durable topic exchange.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Closed`] if any of those steps fails.
    pub async fn new(
        connection: &RabbitConnection,
        exchange: &str,
        publish_timeout: Duration,
    ) -> Result<Self, PublishError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Closed(e.to_string()))?;

        declare_exchange(&channel, exchange)
            .await
            .map_err(|e| PublishError::Closed(e.to_string()))?;

        tracing::info!(
            exchange = %exchange,
            publish_timeout_ms = publish_timeout.as_millis(),
            "RabbitPublisher ready"
        );

        Ok(Self {
            channel,
            exchange: exchange.to_string(),
            publish_timeout,
        })
    }

    /// Exchange messages are published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn send(
        &self,
        routing_key: &str,
        payload: &[u8],
        correlation_id: &str,
    ) -> Result<(), PublishError> {
        // Without confirm mode the returned confirmation resolves immediately.
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                message_properties(correlation_id),
            )
            .await
            .map(drop)
            .map_err(|e| PublishError::Rejected {
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Run `publish`, turning an overrun of `limit` into [`PublishError::Timeout`].
async fn bounded<F>(limit: Duration, routing_key: &str, publish: F) -> Result<(), PublishError>
where
    F: Future<Output = Result<(), PublishError>>,
{
    tokio::time::timeout(limit, publish)
        .await
        .unwrap_or_else(|_| {
            Err(PublishError::Timeout {
                routing_key: routing_key.to_string(),
                after: limit,
            })
        })
}

fn message_properties(correlation_id: &str) -> BasicProperties {
    let timestamp = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(PERSISTENT)
        .with_correlation_id(correlation_id.into())
        .with_timestamp(timestamp)
}

impl Publisher for RabbitPublisher {
    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        payload: &'a [u8],
        correlation_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            let start = Instant::now();
            let outcome = bounded(
                self.publish_timeout,
                routing_key,
                self.send(routing_key, payload, correlation_id),
            )
            .await;

            match &outcome {
                Ok(()) => {
                    PublisherMetrics::record_publish(routing_key, start.elapsed());
                    tracing::debug!(
                        exchange = %self.exchange,
                        routing_key,
                        correlation_id,
                        bytes = payload.len(),
                        "Message published"
                    );
                }
                Err(e) => {
                    PublisherMetrics::record_publish_error(routing_key);
                    tracing::error!(
                        exchange = %self.exchange,
                        routing_key,
                        correlation_id,
                        error = %e,
                        "Failed to publish message"
                    );
                }
            }
            outcome
        })
    }
}
