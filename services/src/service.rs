//! Consumer service wiring shared by the `crm-consumer` and
//! `analytics-consumer` binaries.

use crate::config::Config;
use crate::failure::RandomFailure;
use crate::lifecycle::{run_until, shutdown_signal};
use anyhow::Context;
use event_relay_core::broker::TopologyManager;
use event_relay_core::handler::SideEffect;
use event_relay_core::topology::QueueTopology;
use event_relay_postgres::{PgCrmSyncLog, PgDailyMetrics, PgIdempotencyStore, PgPool, Schema};
use event_relay_rabbitmq::{RabbitConnection, redact_url};
use event_relay_runtime::metrics::MetricsServer;
use event_relay_runtime::{ConsumerRuntime, IdempotentHandler};
use std::sync::Arc;
use tracing::{info, warn};

/// The two consuming services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerService {
    /// Mirrors user changes into the CRM sync log.
    Crm,
    /// Counts user events per day and type.
    Analytics,
}

impl ConsumerService {
    /// Service name used for queue names and `{SERVICE}_DATABASE_URL`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::Analytics => "analytics",
        }
    }

    /// Tables this service owns.
    #[must_use]
    pub const fn schema(self) -> Schema {
        match self {
            Self::Crm => Schema::Crm,
            Self::Analytics => Schema::Analytics,
        }
    }

    /// Broker topology this service consumes from.
    #[must_use]
    pub fn topology(self) -> QueueTopology {
        QueueTopology::for_consumer(self.name())
    }

    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_filter(self) -> String {
        format!(
            "info,event_relay_services=info,event_relay_runtime=info,{}_consumer=info",
            self.name()
        )
    }

    fn side_effect(self, pool: PgPool) -> Arc<dyn SideEffect> {
        match self {
            Self::Crm => Arc::new(PgCrmSyncLog::new(pool)),
            Self::Analytics => Arc::new(PgDailyMetrics::new(pool)),
        }
    }

    /// Idempotent handler over the service's store and side effect.
    ///
    /// A positive `simulated_failure_rate` injects [`RandomFailure`].
    #[must_use]
    pub fn handler(self, pool: PgPool, simulated_failure_rate: f64) -> IdempotentHandler {
        let effect = self.side_effect(pool.clone());
        let store = PgIdempotencyStore::new(pool, effect.name());
        let handler = IdempotentHandler::new(Arc::new(store), effect);

        if simulated_failure_rate > 0.0 {
            warn!(
                service = self.name(),
                rate = simulated_failure_rate,
                "Simulated failures enabled"
            );
            handler.with_failure_policy(Arc::new(RandomFailure::new(simulated_failure_rate)))
        } else {
            handler
        }
    }

    /// Run the service until Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if any startup step fails: metrics exporter, broker
    /// connection, database connection or migration, topology declaration or
    /// subscription.
    pub async fn run(self, config: Config) -> anyhow::Result<()> {
        let name = self.name();
        info!(
            service = name,
            rabbitmq = %redact_url(&config.rabbitmq_url),
            database = %redact_url(&config.database_url),
            metrics_port = config.metrics_port,
            "Configuration loaded"
        );

        let mut metrics = MetricsServer::new(config.metrics_addr());
        metrics.start().context("Failed to start metrics exporter")?;

        let connection =
            RabbitConnection::connect_with_retry(&config.rabbitmq_url, &config.retry_policy())
                .await
                .context("Failed to connect to RabbitMQ")?;

        let pool = event_relay_postgres::connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;
        self.schema()
            .migrate(&pool)
            .await
            .context("Failed to apply migrations")?;

        let topology = self.topology();
        connection
            .topology_manager()
            .declare(&topology)
            .await
            .context("Failed to declare topology")?;

        let mut runtime = ConsumerRuntime::new(Arc::new(connection.delivery_source()));
        if let Some(deadline) = config.handler_timeout {
            runtime = runtime.with_processing_deadline(deadline);
        }

        let handle = runtime
            .subscribe(topology, self.handler(pool.clone(), config.simulated_failure_rate))
            .await
            .context("Failed to start consumer")?;

        info!(service = name, "Consumer service running");
        run_until(handle, shutdown_signal()).await;

        if let Err(e) = connection.close().await {
            warn!(error = %e, "Error closing RabbitMQ connection");
        }
        pool.close().await;
        info!(service = name, "Shutdown complete");
        Ok(())
    }
}
