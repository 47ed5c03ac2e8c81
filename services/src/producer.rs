//! Producer-side helper turning domain changes into published events.
//!
//! Publishing is best effort: the producer's own write has already committed
//! when [`EventProducer::emit`] runs, so a broker outage is logged and the
//! event is handed back to the caller rather than failing the request.

use event_relay_core::broker::Publisher;
use event_relay_core::environment::Clock;
use event_relay_core::error::PublishError;
use event_relay_core::event::{Event, EventType, User};
use std::sync::Arc;
use tracing::{error, info};

/// Builds events and publishes them under their event type's routing key.
#[derive(Clone)]
pub struct EventProducer {
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl EventProducer {
    /// Producer publishing through `publisher`, stamping events with `clock`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, clock: Arc<dyn Clock>) -> Self {
        Self { publisher, clock }
    }

    /// Build and publish an event, logging instead of failing on publish errors.
    ///
    /// A fresh correlation id is generated when `correlation_id` is `None`.
    pub async fn emit(
        &self,
        event_type: EventType,
        user: User,
        correlation_id: Option<String>,
    ) -> Event {
        let event = self.build(event_type, user, correlation_id);

        if let Err(e) = self.publish(&event).await {
            error!(
                event_id = %event.event_id,
                routing_key = event.routing_key(),
                correlation_id = %event.correlation_id,
                error = %e,
                "Event not published; continuing without it"
            );
        }
        event
    }

    /// Build and publish an event, returning the publish error to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or publishing fails.
    pub async fn try_emit(
        &self,
        event_type: EventType,
        user: User,
        correlation_id: Option<String>,
    ) -> Result<Event, PublishError> {
        let event = self.build(event_type, user, correlation_id);
        self.publish(&event).await?;
        Ok(event)
    }

    fn build(&self, event_type: EventType, user: User, correlation_id: Option<String>) -> Event {
        let correlation_id = correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Event::new(event_type, user, correlation_id, self.clock.as_ref())
    }

    async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        let routing_key = event.routing_key();
        let payload = event.to_json_bytes().map_err(|e| PublishError::Rejected {
            routing_key: routing_key.to_string(),
            reason: e.to_string(),
        })?;

        self.publisher
            .publish(routing_key, &payload, &event.correlation_id)
            .await?;

        info!(
            event_id = %event.event_id,
            routing_key,
            correlation_id = %event.correlation_id,
            "Event published"
        );
        Ok(())
    }
}
