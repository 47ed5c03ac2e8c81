//! Prometheus metrics for the delivery pipeline.
//!
//! Counters and histograms are recorded through the `metrics` facade from
//! everywhere in the workspace; [`MetricsServer`] installs the Prometheus
//! recorder and serves `/metrics` for scraping.
//!
//! # Example
//!
//! ```rust,no_run
//! use event_relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or another
    /// recorder rejects installation. An already-installed recorder (common in
    /// tests) is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "consumer_messages_acknowledged_total",
        "Deliveries acknowledged after their handler succeeded"
    );
    describe_counter!(
        "consumer_messages_dead_lettered_total",
        "Deliveries rejected to the dead-letter queue"
    );
    describe_counter!(
        "consumer_settlement_errors_total",
        "Ack or reject calls the broker did not accept"
    );
    describe_histogram!(
        "consumer_handler_duration_seconds",
        "Time from delivery receipt to handler completion"
    );

    describe_counter!(
        "idempotency_duplicates_skipped_total",
        "Events skipped because their id was already recorded"
    );

    describe_counter!(
        "publisher_messages_published_total",
        "Messages written to the broker channel"
    );
    describe_counter!(
        "publisher_publish_errors_total",
        "Publish attempts that failed or timed out"
    );
    describe_histogram!(
        "publisher_publish_duration_seconds",
        "Time taken to publish a message"
    );

    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after retrying"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted max retries"
    );
}

/// Consumer-side recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record an acknowledged delivery.
    pub fn record_acknowledged(queue: &str) {
        counter!("consumer_messages_acknowledged_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_lettered(queue: &str, reason: &'static str) {
        counter!(
            "consumer_messages_dead_lettered_total",
            "queue" => queue.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a failed ack or reject.
    pub fn record_settlement_error(queue: &str) {
        counter!("consumer_settlement_errors_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record how long one delivery took to process.
    pub fn record_handler_duration(queue: &str, duration: Duration) {
        histogram!("consumer_handler_duration_seconds", "queue" => queue.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Idempotency recorder.
pub struct IdempotencyMetrics;

impl IdempotencyMetrics {
    /// Record a skipped duplicate.
    pub fn record_duplicate(handler: &str) {
        counter!("idempotency_duplicates_skipped_total", "handler" => handler.to_string())
            .increment(1);
    }
}

/// Publisher recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a successful publish.
    pub fn record_publish(routing_key: &str, duration: Duration) {
        counter!("publisher_messages_published_total", "routing_key" => routing_key.to_string())
            .increment(1);
        histogram!("publisher_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_publish_error(routing_key: &str) {
        counter!("publisher_publish_errors_total", "routing_key" => routing_key.to_string())
            .increment(1);
    }
}

/// Retry recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a success after at least one retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_server_has_no_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn start_is_tolerant_of_existing_recorder() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
    }

    #[test]
    fn recorders_do_not_panic_without_exporter() {
        ConsumerMetrics::record_acknowledged("crm.user.events");
        ConsumerMetrics::record_dead_lettered("crm.user.events", "decode");
        ConsumerMetrics::record_handler_duration("crm.user.events", Duration::from_millis(3));
        PublisherMetrics::record_publish("user.created", Duration::from_millis(1));
        PublisherMetrics::record_publish_error("user.created");
        IdempotencyMetrics::record_duplicate("analytics");
        RetryMetrics::record_attempt();
    }
}
