//! Deterministic failure policies.

#![allow(clippy::unwrap_used)]

use event_relay_core::event::{Event, EventId};
use event_relay_core::handler::FailurePolicy;
use std::collections::HashSet;
use std::sync::RwLock;

/// Fails exactly the listed event ids, every time they are seen.
///
/// # Example
///
/// ```
/// use event_relay_core::handler::FailurePolicy;
/// use event_relay_testing::FailOnEventIds;
///
/// let policy = FailOnEventIds::new(["evt-poison"]);
/// assert!(policy.is_targeted(&"evt-poison".into()));
/// ```
#[derive(Debug, Default)]
pub struct FailOnEventIds {
    targets: RwLock<HashSet<EventId>>,
}

impl FailOnEventIds {
    /// Policy failing the given ids.
    #[must_use]
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: RwLock::new(ids.into_iter().map(EventId::new).collect()),
        }
    }

    /// Add `event_id` to the targets.
    pub fn target(&self, event_id: EventId) {
        self.targets.write().unwrap().insert(event_id);
    }

    /// Stop failing `event_id`.
    pub fn clear(&self, event_id: &EventId) {
        self.targets.write().unwrap().remove(event_id);
    }

    /// Whether `event_id` will fail.
    #[must_use]
    pub fn is_targeted(&self, event_id: &EventId) -> bool {
        self.targets.read().unwrap().contains(event_id)
    }
}

impl FailurePolicy for FailOnEventIds {
    fn should_fail(&self, event: &Event) -> Option<String> {
        self.is_targeted(&event.event_id)
            .then(|| format!("forced failure for event {}", event.event_id))
    }
}
