//! Process lifecycle: tracing setup, shutdown signals and graceful stop.
//!
//! When a shutdown signal is received (Ctrl+C or SIGTERM):
//! 1. The consumer stops taking new deliveries
//! 2. The in-flight handler finishes and its message is settled (10s timeout)
//! 3. The subscription closes, returning anything unacknowledged to the queue
//! 4. The broker connection closes

use event_relay_runtime::{ConsumerStats, SubscriptionHandle};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for the in-flight message during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // A subscriber may already be installed when embedded in tests.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Returns when the process receives SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Run `handle` until `shutdown` resolves or the consumer stops on its own.
///
/// Returns the final stats, or `None` if the consumer failed or did not stop
/// within [`SHUTDOWN_TIMEOUT`].
pub async fn run_until<F>(handle: SubscriptionHandle, shutdown: F) -> Option<ConsumerStats>
where
    F: Future<Output = ()>,
{
    let consumer = handle.consumer_name().to_string();

    tokio::select! {
        () = shutdown => {}
        () = wait_finished(&handle) => {
            warn!(consumer = %consumer, "Consumer stopped without a shutdown signal");
        }
    }

    info!(consumer = %consumer, "Shutting down consumer");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.cancel()).await {
        Ok(Ok(stats)) => {
            info!(
                consumer = %consumer,
                acknowledged = stats.acknowledged,
                dead_lettered = stats.dead_lettered,
                "Consumer stopped"
            );
            Some(stats)
        }
        Ok(Err(e)) => {
            error!(consumer = %consumer, error = %e, "Consumer stopped with error");
            None
        }
        Err(_) => {
            warn!(consumer = %consumer, "Consumer did not stop within timeout");
            None
        }
    }
}

async fn wait_finished(handle: &SubscriptionHandle) {
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    while !handle.is_finished() {
        poll.tick().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use event_relay_core::broker::TopologyManager;
    use event_relay_core::event::EventType;
    use event_relay_core::topology::QueueTopology;
    use event_relay_runtime::{ConsumerRuntime, IdempotentHandler};
    use event_relay_testing::{
        InMemoryBroker, InMemoryIdempotencyStore, InMemorySyncLog, eventually, user_event,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_settles_processed_messages() {
        let broker = InMemoryBroker::new();
        let topology = QueueTopology::for_consumer("crm");
        broker.declare(&topology).await.unwrap();

        let sync_log = InMemorySyncLog::new();
        let handler = IdempotentHandler::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(sync_log.clone()),
        );
        let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
            .subscribe(topology.clone(), handler)
            .await
            .unwrap();

        broker
            .publish_event(&user_event(EventType::UserCreated, "u1"))
            .await
            .unwrap();
        assert!(eventually(Duration::from_secs(2), || sync_log.len() == 1).await);

        let stats = run_until(handle, async {}).await.unwrap();

        assert_eq!(stats.acknowledged, 1);
        assert_eq!(broker.queue_len(&topology.queue), 0);
        assert_eq!(broker.consumer_count(&topology.queue), 0);
    }
}
