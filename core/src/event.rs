//! Domain events and their wire encoding.
//!
//! An [`Event`] is an immutable fact ("user X was created"). It travels between
//! services as a JSON document whose field names form the wire contract shared by
//! every producer and consumer:
//!
//! ```json
//! {
//!   "event_id": "0b6c3f0e-5f0c-4b8e-9a51-8f5d1b9f2a11",
//!   "correlation_id": "req-42",
//!   "event_type": "user.created",
//!   "timestamp": "2024-01-01T09:30:00.123456Z",
//!   "data": { "id": "...", "email": "...", "name": "...", "created_at": "...", "updated_at": "..." }
//! }
//! ```
//!
//! # Identity
//!
//! `event_id` is assigned once, by the producer, when the event is built.
//! Redelivery of the same logical event carries the same id, which is what makes
//! it usable as an idempotency key on the consuming side.
//!
//! # Example
//!
//! ```
//! use event_relay_core::environment::SystemClock;
//! use event_relay_core::event::{Event, EventType, User};
//!
//! let user = User::new("user-1", "ada@example.com", "Ada");
//! let event = Event::new(EventType::UserCreated, user, "corr-1", &SystemClock);
//!
//! let bytes = event.to_json_bytes().unwrap();
//! let decoded = Event::from_json_bytes(&bytes).unwrap();
//! assert_eq!(decoded.event_id, event.event_id);
//! ```

use crate::environment::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Error types for event encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    Deserialization(String),

    /// Event type outside the closed set.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// Closed set of user lifecycle events.
///
/// The serialized name doubles as the routing key on the topic exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A user was created.
    #[serde(rename = "user.created")]
    UserCreated,
    /// A user was updated.
    #[serde(rename = "user.updated")]
    UserUpdated,
    /// A user was deleted.
    #[serde(rename = "user.deleted")]
    UserDeleted,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 3] = [Self::UserCreated, Self::UserUpdated, Self::UserDeleted];

    /// Routing key used when publishing this event type.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.routing_key() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// Producer-assigned, globally unique event identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random (UUID v4) identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Snapshot of a user at the moment the event was published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier
    pub id: String,
    /// Email address
    pub email: String,
    /// Display name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build a user snapshot with both timestamps set to the Unix epoch.
    ///
    /// Mostly useful in tests; producers normally fill the timestamps from their store.
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// An immutable domain event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Idempotency key, assigned once at publish time.
    pub event_id: EventId,
    /// Opaque id threading one causal chain across services and logs.
    pub correlation_id: String,
    /// What happened.
    pub event_type: EventType,
    /// Producer wall-clock time.
    pub timestamp: DateTime<Utc>,
    /// Entity snapshot at publish time.
    pub data: User,
}

impl Event {
    /// Build a new event with a freshly generated id, stamped by `clock`.
    #[must_use]
    pub fn new(
        event_type: EventType,
        data: User,
        correlation_id: impl Into<String>,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            correlation_id: correlation_id.into(),
            event_type,
            timestamp: clock.now(),
            data,
        }
    }

    /// Routing key this event is published under.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        self.event_type.routing_key()
    }

    /// Encode as the JSON wire document.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if encoding fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Decode from the JSON wire document.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the bytes are not a valid event,
    /// including an `event_type` outside the closed set.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Deserialization(e.to_string()))
    }
}
