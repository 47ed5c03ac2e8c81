//! Per-day, per-event-type counters.
//!
//! Each newly accepted event increments the counter keyed by the calendar day
//! of its timestamp (UTC) and its event type, starting at 1 for a new key. The
//! merge is commutative, so replaying a set of distinct events in any order
//! yields the same counts. Double increments are prevented upstream by the
//! idempotency check, not here.

use crate::event::{Event, EventType};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Counter key: `(event_date, event_type)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    /// Event timestamp truncated to a calendar day.
    pub date: NaiveDate,
    /// Event type.
    pub event_type: EventType,
}

impl MetricKey {
    /// Key for `event`.
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            date: event.timestamp.date_naive(),
            event_type: event.event_type,
        }
    }
}

/// In-memory daily counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DailyCounts {
    counts: BTreeMap<MetricKey, u64>,
}

impl DailyCounts {
    /// Empty counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `event`'s key.
    pub fn apply(&mut self, event: &Event) {
        *self.counts.entry(MetricKey::from_event(event)).or_insert(0) += 1;
    }

    /// Current count for a key (0 when absent).
    #[must_use]
    pub fn get(&self, date: NaiveDate, event_type: EventType) -> u64 {
        self.counts
            .get(&MetricKey { date, event_type })
            .copied()
            .unwrap_or(0)
    }

    /// All non-zero counters, ordered by date then type.
    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &u64)> {
        self.counts.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::environment::FixedClock;
    use crate::event::User;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn event_at(hour: u32, minute: u32, event_type: EventType) -> Event {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap());
        Event::new(event_type, User::new("u", "u@example.com", "U"), "c", &clock)
    }

    #[test]
    fn timestamp_is_truncated_to_day() {
        let key = MetricKey::from_event(&event_at(23, 59, EventType::UserCreated));
        assert_eq!(key.date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn counts_are_kept_per_type() {
        let mut counts = DailyCounts::new();
        counts.apply(&event_at(1, 0, EventType::UserCreated));
        counts.apply(&event_at(2, 0, EventType::UserCreated));
        counts.apply(&event_at(3, 0, EventType::UserDeleted));

        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(counts.get(day, EventType::UserCreated), 2);
        assert_eq!(counts.get(day, EventType::UserDeleted), 1);
        assert_eq!(counts.get(day, EventType::UserUpdated), 0);
    }

    fn events_and_shuffle() -> impl Strategy<Value = (Vec<Event>, Vec<Event>)> {
        proptest::collection::vec((0u32..(24 * 60), 0usize..3), 1..40).prop_flat_map(|specs| {
            let events: Vec<Event> = specs
                .iter()
                .map(|(m, t)| event_at(m / 60, m % 60, EventType::ALL[*t]))
                .collect();
            (Just(events.clone()), Just(events).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn order_does_not_change_counts((events, shuffled) in events_and_shuffle()) {
            let mut forward = DailyCounts::new();
            events.iter().for_each(|e| forward.apply(e));

            let mut reordered = DailyCounts::new();
            shuffled.iter().for_each(|e| reordered.apply(e));

            let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
            let total: u64 = EventType::ALL.iter().map(|t| forward.get(day, *t)).sum();
            prop_assert_eq!(&forward, &reordered);
            prop_assert_eq!(total, events.len() as u64);
        }
    }
}
