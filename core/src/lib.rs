//! # Event Relay Core
//!
//! Types and seams for propagating domain events from a producing service to
//! independently deployed consumers through a durable message broker, with
//! at-least-once delivery and idempotent consumption.
//!
//! ## Pipeline
//!
//! ```text
//! Publisher ──► Exchange (topic) ──► Queue ──► ConsumerRuntime ──► EventHandler
//!                                      │                               │
//!                                      └──── DLQ ◄── reject ◄── Err ───┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the [`Event`](event::Event) record and its JSON wire format
//! - [`delivery`]: broker envelopes, settlement and subscriptions
//! - [`topology`]: exchange/queue/DLQ description and topic matching
//! - [`broker`]: topology manager, publisher and delivery-source traits
//! - [`idempotency`]: processed-event-id store
//! - [`handler`]: handler, side-effect and failure-policy traits
//! - [`aggregation`]: daily counter merge rule
//! - [`error`]: error taxonomy
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a message is settled only after its handler returns
//! - **Sequential per consumer**: prefetch 1, one handler invocation at a time
//! - **No global ordering** across consumers or routing keys
//! - **Poison isolation**: failures are dead-lettered, never requeued in place

pub mod aggregation;
pub mod broker;
pub mod delivery;
pub mod error;
pub mod event;
pub mod handler;
pub mod idempotency;
pub mod topology;

pub use chrono::{DateTime, Utc};

/// Environment module - Dependency injection traits
///
/// External dependencies that make behaviour time-dependent are abstracted
/// behind traits so tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use event_relay_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }
}

pub use broker::{DeliverySource, Publisher, TopologyManager};
pub use delivery::{Delivery, Subscription};
pub use error::{BrokerError, HandlerError, PublishError, StoreError};
pub use event::{Event, EventId, EventType, User};
pub use handler::{EventHandler, FailurePolicy, NeverFail, SideEffect};
pub use idempotency::IdempotencyStore;
pub use topology::QueueTopology;
