//! Declarative broker topology for one consumer.
//!
//! A [`QueueTopology`] names the exchange, the consumer's main queue, its
//! dead-letter queue, the routing keys bound to the main queue, and the
//! consumer identity. It is built once at startup and handed to both the
//! topology manager (to declare it) and the consumer runtime (to subscribe).
//!
//! ```text
//!                 user.created ┐
//!  ┌──────────┐   user.updated ├──►┌─────────────────────┐  reject, no requeue  ┌─────────────────────────┐
//!  │  events  │── user.deleted ┘   │ crm.user.events     │─────────────────────►│ dlq.crm.user.events     │
//!  │ (topic)  │                    └─────────────────────┘                      └─────────────────────────┘
//!  └──────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use event_relay_core::topology::QueueTopology;
//!
//! let topology = QueueTopology::for_consumer("crm");
//! assert_eq!(topology.queue, "crm.user.events");
//! assert_eq!(topology.dead_letter_queue, "dlq.crm.user.events");
//! assert!(topology.validate().is_ok());
//! ```

use crate::error::BrokerError;
use crate::event::EventType;

/// Name of the shared topic exchange.
pub const DEFAULT_EXCHANGE: &str = "events";

/// Maximum unacknowledged deliveries per consumer.
pub const PREFETCH: u16 = 1;

/// Exchange, queues and bindings for one consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
    /// Durable topic exchange events are published to.
    pub exchange: String,
    /// Durable main queue the consumer reads.
    pub queue: String,
    /// Durable queue receiving messages rejected from `queue`.
    pub dead_letter_queue: String,
    /// Binding patterns between `exchange` and `queue`.
    pub routing_keys: Vec<String>,
    /// Consumer tag / service identity.
    pub consumer_name: String,
}

impl QueueTopology {
    /// Start building a topology for the given main queue.
    #[must_use]
    pub fn builder(queue: impl Into<String>) -> QueueTopologyBuilder {
        QueueTopologyBuilder {
            queue: queue.into(),
            exchange: None,
            dead_letter_queue: None,
            routing_keys: Vec::new(),
            consumer_name: None,
        }
    }

    /// Conventional topology for a service consuming every user event.
    ///
    /// `for_consumer("analytics")` yields queue `analytics.user.events`,
    /// dead-letter queue `dlq.analytics.user.events` and consumer
    /// `analytics-consumer`, bound to all user routing keys on [`DEFAULT_EXCHANGE`].
    #[must_use]
    pub fn for_consumer(service: &str) -> Self {
        Self::builder(format!("{service}.user.events"))
            .routing_keys(EventType::ALL.iter().map(|t| t.routing_key()))
            .consumer_name(format!("{service}-consumer"))
            .build()
    }

    /// Prefetch limit applied when subscribing.
    #[must_use]
    pub const fn prefetch(&self) -> u16 {
        PREFETCH
    }

    /// Check that the topology can be declared.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidTopology`] when a name is empty, no routing key
    /// is bound, the dead-letter queue equals the main queue, or a routing pattern
    /// contains an empty word.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let invalid = |reason: String| Err(BrokerError::InvalidTopology(reason));

        for (field, value) in [
            ("exchange", &self.exchange),
            ("queue", &self.queue),
            ("dead_letter_queue", &self.dead_letter_queue),
            ("consumer_name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("{field} cannot be empty"));
            }
        }

        if self.queue == self.dead_letter_queue {
            return invalid(format!(
                "dead-letter queue must differ from main queue '{}'",
                self.queue
            ));
        }

        if self.routing_keys.is_empty() {
            return invalid(format!("queue '{}' has no routing keys", self.queue));
        }

        if let Some(key) = self
            .routing_keys
            .iter()
            .find(|key| key.split('.').any(str::is_empty))
        {
            return invalid(format!("malformed routing key '{key}'"));
        }

        Ok(())
    }

    /// Whether a message published with `routing_key` lands in this topology's queue.
    #[must_use]
    pub fn accepts(&self, routing_key: &str) -> bool {
        self.routing_keys
            .iter()
            .any(|pattern| topic_matches(pattern, routing_key))
    }
}

/// Builder for [`QueueTopology`].
#[derive(Debug, Clone)]
pub struct QueueTopologyBuilder {
    queue: String,
    exchange: Option<String>,
    dead_letter_queue: Option<String>,
    routing_keys: Vec<String>,
    consumer_name: Option<String>,
}

impl QueueTopologyBuilder {
    /// Exchange to bind to. Default: [`DEFAULT_EXCHANGE`].
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Dead-letter queue. Default: `dlq.{queue}`.
    #[must_use]
    pub fn dead_letter_queue(mut self, dlq: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(dlq.into());
        self
    }

    /// Add one binding pattern.
    #[must_use]
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    /// Add several binding patterns.
    #[must_use]
    pub fn routing_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.routing_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Consumer identity. Default: the queue name.
    #[must_use]
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    /// Build the topology. Duplicate routing keys are collapsed.
    ///
    /// Call [`QueueTopology::validate`] before declaring it.
    #[must_use]
    pub fn build(self) -> QueueTopology {
        let mut routing_keys = Vec::with_capacity(self.routing_keys.len());
        for key in self.routing_keys {
            if !routing_keys.contains(&key) {
                routing_keys.push(key);
            }
        }

        QueueTopology {
            exchange: self.exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            dead_letter_queue: self
                .dead_letter_queue
                .unwrap_or_else(|| format!("dlq.{}", self.queue)),
            consumer_name: self.consumer_name.unwrap_or_else(|| self.queue.clone()),
            queue: self.queue,
            routing_keys,
        }
    }
}

/// AMQP topic matching.
///
/// Words are dot-separated; `*` matches exactly one word and `#` matches zero
/// or more words.
///
/// ```
/// use event_relay_core::topology::topic_matches;
///
/// assert!(topic_matches("user.*", "user.created"));
/// assert!(topic_matches("#", "user.created"));
/// assert!(topic_matches("user.#", "user"));
/// assert!(!topic_matches("user.*", "user.created.v2"));
/// ```
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                match_words(rest, key_rest)
            }
            _ => false,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let topology = QueueTopology::builder("crm.user.events")
            .routing_key("user.created")
            .routing_key("user.created")
            .build();

        assert_eq!(topology.exchange, DEFAULT_EXCHANGE);
        assert_eq!(topology.dead_letter_queue, "dlq.crm.user.events");
        assert_eq!(topology.consumer_name, "crm.user.events");
        assert_eq!(topology.routing_keys, vec!["user.created".to_string()]);
        assert_eq!(topology.prefetch(), 1);
    }

    #[test]
    fn for_consumer_binds_all_user_events() {
        let topology = QueueTopology::for_consumer("analytics");

        assert_eq!(topology.consumer_name, "analytics-consumer");
        assert_eq!(
            topology.routing_keys,
            vec!["user.created", "user.updated", "user.deleted"]
        );
        assert!(topology.accepts("user.deleted"));
        assert!(!topology.accepts("order.created"));
    }

    #[test]
    fn validate_rejects_missing_routing_keys() {
        let topology = QueueTopology::builder("q").build();
        assert!(matches!(
            topology.validate(),
            Err(BrokerError::InvalidTopology(_))
        ));
    }

    #[test]
    fn validate_rejects_dlq_equal_to_queue() {
        let topology = QueueTopology::builder("q")
            .dead_letter_queue("q")
            .routing_key("user.created")
            .build();
        assert!(topology.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_words() {
        let topology = QueueTopology::builder("q").routing_key("user..created").build();
        assert!(topology.validate().is_err());
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.updated"));
        assert!(topic_matches("*.created", "user.created"));
        assert!(!topic_matches("*", "user.created"));
        assert!(topic_matches("user.#", "user.created.v2"));
        assert!(topic_matches("#.created", "user.created"));
        assert!(topic_matches("#.created", "created"));
        assert!(!topic_matches("#.created", "user.created.v2"));
    }
}
