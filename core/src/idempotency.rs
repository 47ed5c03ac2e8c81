//! Duplicate suppression keyed by event id.
//!
//! Consulted by domain handlers, not by the consumer runtime, so each consumer
//! keeps its own notion of "already done".
//!
//! # Race safety
//!
//! `record_processed` must tolerate being called twice for the same id: a
//! duplicate insert is a successful no-op. Implementations enforce this with a
//! uniqueness constraint rather than a read-then-write check, which keeps the
//! pair safe when several instances of one consumer share a queue.

use crate::delivery::BoxFuture;
use crate::error::StoreError;
use crate::event::EventId;
use chrono::{DateTime, Utc};

/// One processed event. Never updated, never deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// Primary key.
    pub event_id: EventId,
    /// When the handler committed its side effect.
    pub processed_at: DateTime<Utc>,
}

/// Persisted set of processed event ids.
pub trait IdempotencyStore: Send + Sync {
    /// Whether `event_id` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot answer. Callers must not read
    /// an error as "not processed".
    fn has_processed<'a>(&'a self, event_id: &'a EventId) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Remember `event_id`. Recording an already-recorded id succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record could not be persisted.
    fn record_processed<'a>(&'a self, event_id: &'a EventId) -> BoxFuture<'a, Result<(), StoreError>>;
}
