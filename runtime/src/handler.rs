//! Idempotent handler: duplicate check, side effect, record.
//!
//! ```text
//! event ─► has_processed? ── yes ─► skip (Ok, ack)
//!               │ no
//!               ▼
//!          failure policy ── fail ─► Err (dead-letter)
//!               │ pass
//!               ▼
//!          side effect ───── Err ──► Err (dead-letter)
//!               │ Ok
//!               ▼
//!        record_processed ── Err ──► Err (dead-letter)
//!               │ Ok
//!               ▼
//!              Ok (ack)
//! ```
//!
//! The check and the record are separate calls, so two instances racing on the
//! same event may both apply the effect. Side effects that share storage with
//! the idempotency store close that window by writing the effect and the
//! event id in one transaction; the trailing `record_processed` then finds the
//! id present and does nothing.

use crate::metrics::IdempotencyMetrics;
use event_relay_core::delivery::BoxFuture;
use event_relay_core::error::HandlerError;
use event_relay_core::event::Event;
use event_relay_core::handler::{EventHandler, FailurePolicy, NeverFail, SideEffect};
use event_relay_core::idempotency::IdempotencyStore;
use std::sync::Arc;

/// What [`IdempotentHandler::process`] did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// First sighting: the side effect ran and the id was recorded.
    Applied,
    /// Event id already recorded: nothing ran.
    Duplicate,
}

/// Wraps a [`SideEffect`] with duplicate suppression.
#[derive(Clone)]
pub struct IdempotentHandler {
    store: Arc<dyn IdempotencyStore>,
    effect: Arc<dyn SideEffect>,
    failure_policy: Arc<dyn FailurePolicy>,
}

impl IdempotentHandler {
    /// Handler that never injects failures.
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>, effect: Arc<dyn SideEffect>) -> Self {
        Self {
            store,
            effect,
            failure_policy: Arc::new(NeverFail),
        }
    }

    /// Consult `policy` before applying each new event.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Name of the wrapped side effect.
    #[must_use]
    pub fn name(&self) -> &str {
        self.effect.name()
    }

    /// Run the duplicate check, the side effect and the record for `event`.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::Store`] if the store cannot answer or record
    /// - [`HandlerError::Simulated`] if the failure policy fires
    /// - any error returned by the side effect
    pub async fn process(&self, event: &Event) -> Result<HandleOutcome, HandlerError> {
        let handler = self.effect.name();

        if self.store.has_processed(&event.event_id).await? {
            IdempotencyMetrics::record_duplicate(handler);
            tracing::info!(
                handler,
                event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                "Event already processed, skipping"
            );
            return Ok(HandleOutcome::Duplicate);
        }

        if let Some(reason) = self.failure_policy.should_fail(event) {
            tracing::warn!(
                handler,
                event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                reason = %reason,
                "Injected failure"
            );
            return Err(HandlerError::Simulated(reason));
        }

        self.effect.apply(event).await?;
        self.store.record_processed(&event.event_id).await?;

        tracing::info!(
            handler,
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            "Event processed"
        );
        Ok(HandleOutcome::Applied)
    }
}

impl EventHandler for IdempotentHandler {
    fn handle(&self, event: Event) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(async move { self.process(&event).await.map(|_| ()) })
    }
}
