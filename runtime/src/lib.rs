//! # Event Relay Runtime
//!
//! Executes subscriptions: pulls deliveries from a
//! [`DeliverySource`](event_relay_core::broker::DeliverySource), runs the
//! registered handler and settles each message with the broker.
//!
//! ## Core Components
//!
//! - **`ConsumerRuntime`**: one sequential processing loop per subscription
//! - **`IdempotentHandler`**: duplicate check around a service side effect
//! - **Retry**: exponential backoff for connection bootstrap
//! - **Metrics**: Prometheus recorders and exporter
//!
//! ## Example
//!
//! ```ignore
//! use event_relay_runtime::{ConsumerRuntime, IdempotentHandler};
//!
//! let handler = IdempotentHandler::new(store, effect);
//! let handle = ConsumerRuntime::new(source)
//!     .subscribe(QueueTopology::for_consumer("analytics"), handler)
//!     .await?;
//! ```

/// Consumer loop and subscription handles
pub mod consumer;

/// Idempotent handler wrapper
pub mod handler;

/// Prometheus metrics
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

pub use consumer::{ConsumerRuntime, ConsumerStats, DeliveryOutcome, SubscriptionHandle};
pub use handler::{HandleOutcome, IdempotentHandler};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
