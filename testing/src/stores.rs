//! In-memory idempotency store and side effects.
//!
//! - [`InMemoryIdempotencyStore`]: `HashMap`-backed processed-id set
//! - [`InMemoryDailyMetrics`]: daily counters using the shared merge rule
//! - [`InMemorySyncLog`]: append-only CRM sync log

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, NaiveDate, Utc};
use event_relay_core::aggregation::DailyCounts;
use event_relay_core::delivery::BoxFuture;
use event_relay_core::environment::{Clock, SystemClock};
use event_relay_core::error::{HandlerError, StoreError};
use event_relay_core::event::{Event, EventId, EventType};
use event_relay_core::handler::SideEffect;
use event_relay_core::idempotency::{IdempotencyRecord, IdempotencyStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory idempotency store.
///
/// # Example
///
/// ```
/// use event_relay_core::event::EventId;
/// use event_relay_core::idempotency::IdempotencyStore;
/// use event_relay_testing::InMemoryIdempotencyStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryIdempotencyStore::new();
/// let id = EventId::new("evt-1");
///
/// assert!(!store.has_processed(&id).await?);
/// store.record_processed(&id).await?;
/// store.record_processed(&id).await?; // duplicate insert is a no-op
/// assert!(store.has_processed(&id).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<EventId, DateTime<Utc>>>>,
    unavailable: Arc<AtomicBool>,
    record_failing: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdempotencyStore {
    /// Empty store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            record_failing: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`] while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Make only [`IdempotencyStore::record_processed`] fail while `true`.
    ///
    /// Lookups keep working, so a side effect can commit and then lose its record.
    pub fn set_record_failing(&self, failing: bool) {
        self.record_failing.store(failing, Ordering::Release);
    }

    /// Number of recorded ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Record for `event_id`, if any.
    #[must_use]
    pub fn record(&self, event_id: &EventId) -> Option<IdempotencyRecord> {
        self.records
            .read()
            .unwrap()
            .get(event_id)
            .map(|processed_at| IdempotencyRecord {
                event_id: event_id.clone(),
                processed_at: *processed_at,
            })
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("idempotency store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn has_processed<'a>(&'a self, event_id: &'a EventId) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.records.read().unwrap().contains_key(event_id))
        })
    }

    fn record_processed<'a>(&'a self, event_id: &'a EventId) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.check_available()?;
            if self.record_failing.load(Ordering::Acquire) {
                return Err(StoreError::Database("idempotency insert failed".to_string()));
            }
            let now = self.clock.now();
            self.records
                .write()
                .unwrap()
                .entry(event_id.clone())
                .or_insert(now);
            Ok(())
        })
    }
}

/// Daily counters side effect.
#[derive(Clone, Default)]
pub struct InMemoryDailyMetrics {
    counts: Arc<RwLock<DailyCounts>>,
}

impl InMemoryDailyMetrics {
    /// Empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `(date, event_type)`.
    #[must_use]
    pub fn count(&self, date: NaiveDate, event_type: EventType) -> u64 {
        self.counts.read().unwrap().get(date, event_type)
    }

    /// Copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> DailyCounts {
        self.counts.read().unwrap().clone()
    }
}

impl SideEffect for InMemoryDailyMetrics {
    fn name(&self) -> &str {
        "analytics"
    }

    fn apply<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.counts.write().unwrap().apply(event);
            Ok(())
        })
    }
}

/// One CRM sync log row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncedUser {
    /// Event that caused the sync.
    pub event_id: EventId,
    /// Correlation id of that event.
    pub correlation_id: String,
    /// Event type.
    pub event_type: EventType,
    /// Synced user id.
    pub user_id: String,
    /// Synced user email.
    pub user_email: String,
    /// Synced user name.
    pub user_name: String,
}

impl SyncedUser {
    fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.event_id.clone(),
            correlation_id: event.correlation_id.clone(),
            event_type: event.event_type,
            user_id: event.data.id.clone(),
            user_email: event.data.email.clone(),
            user_name: event.data.name.clone(),
        }
    }
}

/// Append-only CRM sync log side effect.
#[derive(Clone, Default)]
pub struct InMemorySyncLog {
    rows: Arc<RwLock<Vec<SyncedUser>>>,
    failing: Arc<AtomicBool>,
}

impl InMemorySyncLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `apply` fail with a transient effect error while `true`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Copy of all rows in append order.
    #[must_use]
    pub fn rows(&self) -> Vec<SyncedUser> {
        self.rows.read().unwrap().clone()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Whether nothing has been synced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }
}

impl SideEffect for InMemorySyncLog {
    fn name(&self) -> &str {
        "crm"
    }

    fn apply<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::Acquire) {
                return Err(HandlerError::transient("CRM endpoint unavailable"));
            }
            self.rows.write().unwrap().push(SyncedUser::from_event(event));
            Ok(())
        })
    }
}
