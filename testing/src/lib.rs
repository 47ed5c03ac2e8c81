//! # Event Relay Testing
//!
//! Testing utilities for the event relay pipeline.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: topic routing, dead-lettering and prefetch without a
//!   running broker
//! - In-memory idempotency store and side effects
//! - Deterministic clock and failure policies
//! - Event fixtures and an `eventually` polling helper
//!
//! ## Example
//!
//! ```ignore
//! use event_relay_testing::{InMemoryBroker, InMemoryIdempotencyStore, InMemorySyncLog};
//!
//! #[tokio::test]
//! async fn duplicate_is_acknowledged_without_effect() {
//!     let broker = InMemoryBroker::new();
//!     broker.declare(&QueueTopology::for_consumer("crm")).await?;
//!     // ...
//! }
//! ```

pub mod broker;
pub mod failure;
pub mod stores;

/// Mock implementations of Environment traits
pub mod mocks {
    use chrono::{DateTime, Utc};
    pub use event_relay_core::environment::FixedClock;

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and fixtures.
pub mod helpers {
    use crate::mocks::test_clock;
    use event_relay_core::event::{Event, EventType, User};
    use std::future::Future;
    use std::time::Duration;

    /// Event for `user_id` stamped by [`test_clock`].
    #[must_use]
    pub fn user_event(event_type: EventType, user_id: &str) -> Event {
        Event::new(
            event_type,
            User::new(user_id, format!("{user_id}@example.com"), format!("User {user_id}")),
            format!("corr-{user_id}"),
            &test_clock(),
        )
    }

    /// Same as [`user_event`] but with a fixed event id.
    #[must_use]
    pub fn user_event_with_id(event_type: EventType, user_id: &str, event_id: &str) -> Event {
        let mut event = user_event(event_type, user_id);
        event.event_id = event_id.into();
        event
    }

    /// Poll `condition` every few milliseconds until it holds or `timeout` passes.
    ///
    /// Returns whether the condition was met.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Run `future`, panicking if it does not finish within `timeout`.
    ///
    /// # Panics
    ///
    /// Panics on timeout.
    #[allow(clippy::panic)]
    pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
        match tokio::time::timeout(timeout, future).await {
            Ok(value) => value,
            Err(_) => panic!("operation did not complete within {timeout:?}"),
        }
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, StoredMessage};
pub use failure::FailOnEventIds;
pub use helpers::{eventually, user_event, user_event_with_id, within};
pub use mocks::{FixedClock, test_clock};
pub use stores::{InMemoryDailyMetrics, InMemoryIdempotencyStore, InMemorySyncLog, SyncedUser};

#[cfg(test)]
mod tests {
    use super::*;
    use event_relay_core::environment::Clock;
    use event_relay_core::event::EventType;

    #[test]
    fn test_clock_is_fixed() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn fixtures_carry_distinct_ids() {
        let a = user_event(EventType::UserCreated, "u1");
        let b = user_event(EventType::UserCreated, "u1");
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.correlation_id, "corr-u1");
    }
}
