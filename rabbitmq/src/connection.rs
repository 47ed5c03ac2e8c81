//! Owned broker connection.

use crate::consumer::RabbitDeliverySource;
use crate::publisher::RabbitPublisher;
use crate::topology::RabbitTopologyManager;
use event_relay_core::error::{BrokerError, PublishError};
use event_relay_runtime::retry::{RetryPolicy, retry_with_predicate};
use lapin::{Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;

/// A single AMQP connection shared by every component of one service.
///
/// Components open their own channels from it: the publisher, the topology
/// manager and each subscription never share a channel.
#[derive(Clone)]
pub struct RabbitConnection {
    connection: Arc<Connection>,
    endpoint: String,
}

impl RabbitConnection {
    /// Connect once.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the broker is unreachable or
    /// refuses the credentials.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let endpoint = redact_url(url);
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("{endpoint}: {e}")))?;

        tracing::info!(endpoint = %endpoint, "Connected to RabbitMQ");

        Ok(Self {
            connection: Arc::new(connection),
            endpoint,
        })
    }

    /// Connect, retrying connection failures according to `policy`.
    ///
    /// Brokers usually start alongside the services that use them, so the
    /// first attempts are expected to fail.
    ///
    /// # Errors
    ///
    /// Returns the last [`BrokerError`] once the policy is exhausted.
    pub async fn connect_with_retry(url: &str, policy: &RetryPolicy) -> Result<Self, BrokerError> {
        retry_with_predicate(
            policy.clone(),
            || Self::connect(url),
            |err| matches!(err, BrokerError::Connection(_)),
        )
        .await
    }

    /// Broker endpoint with credentials removed.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the underlying connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Open a fresh channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the connection is gone.
    pub async fn create_channel(&self) -> Result<Channel, BrokerError> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Closed(format!("failed to open channel: {e}")))
    }

    /// Topology manager using this connection.
    #[must_use]
    pub fn topology_manager(&self) -> RabbitTopologyManager {
        RabbitTopologyManager::new(self.clone())
    }

    /// Delivery source using this connection.
    #[must_use]
    pub fn delivery_source(&self) -> RabbitDeliverySource {
        RabbitDeliverySource::new(self.clone())
    }

    /// Publisher on a dedicated channel, declaring `exchange` first.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Closed`] if the channel cannot be opened or the
    /// exchange cannot be declared.
    pub async fn publisher(
        &self,
        exchange: &str,
        publish_timeout: Duration,
    ) -> Result<RabbitPublisher, PublishError> {
        RabbitPublisher::new(self, exchange, publish_timeout).await
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the broker rejects the close.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| BrokerError::Closed(e.to_string()))?;
        tracing::info!(endpoint = %self.endpoint, "RabbitMQ connection closed");
        Ok(())
    }
}

/// Strip the user-info part of an AMQP URL for logging.
#[must_use]
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
