//! Error taxonomy for the delivery pipeline.
//!
//! Each error type maps to one recovery policy:
//!
//! | Error            | Where it surfaces             | Recovery                                   |
//! |------------------|-------------------------------|--------------------------------------------|
//! | [`BrokerError`]  | connect, declare, consume     | Fatal at startup; retried only on connect  |
//! | [`PublishError`] | a single publish attempt      | Caller decides (producer logs and proceeds)|
//! | [`HandlerError`] | one handler invocation        | Always dead-lettered, never requeued       |
//! | [`StoreError`]   | idempotency / side-effect I/O | Folded into [`HandlerError::Store`]        |

use std::time::Duration;
use thiserror::Error;

/// Connectivity, declaration and subscription failures.
///
/// Any `BrokerError` raised while declaring topology must be treated as a total
/// failure: the whole declaration sequence is retried, never resumed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not reach the broker or open a channel.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Exchange/queue declaration or binding was refused.
    #[error("Declaration of '{entity}' failed: {reason}")]
    Declaration {
        /// Exchange or queue name
        entity: String,
        /// Broker-supplied reason
        reason: String,
    },

    /// Starting or running a consumer failed.
    #[error("Consume failed on queue '{queue}': {reason}")]
    Consume {
        /// Queue being consumed
        queue: String,
        /// Broker-supplied reason
        reason: String,
    },

    /// Settling a delivery (ack or reject) failed.
    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),

    /// The topology description is not usable.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// The channel or connection was closed.
    #[error("Channel closed: {0}")]
    Closed(String),
}

/// A single publish attempt failed.
///
/// Never retried internally. Retry policy belongs to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker did not accept the message within the publish timeout.
    #[error("Publish of '{routing_key}' timed out after {after:?}")]
    Timeout {
        /// Routing key of the message
        routing_key: String,
        /// Configured publish timeout
        after: Duration,
    },

    /// The broker or client refused the message.
    #[error("Publish of '{routing_key}' rejected: {reason}")]
    Rejected {
        /// Routing key of the message
        routing_key: String,
        /// Reason for rejection
        reason: String,
    },

    /// The publishing channel is gone.
    #[error("Publisher channel closed: {0}")]
    Closed(String),
}

/// Persistence failures in the idempotency store or side-effect storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Query or transaction failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Store is not reachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of one handler invocation.
///
/// Every variant results in the message being rejected without requeue,
/// which routes it to the queue's dead-letter queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload could not be decoded into an event.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Idempotency or side-effect storage failed.
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// The service-specific side effect failed.
    #[error("Side effect failed: {0}")]
    Effect(String),

    /// Injected failure from a failure policy.
    #[error("Simulated failure: {0}")]
    Simulated(String),

    /// The handler exceeded the processing deadline.
    #[error("Handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    /// Shorthand for a transient side-effect failure.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Effect(reason.into())
    }

    /// Short label used for log fields and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Store(_) => "store",
            Self::Effect(_) => "effect",
            Self::Simulated(_) => "simulated",
            Self::TimedOut(_) => "timeout",
        }
    }
}
