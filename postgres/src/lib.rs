//! `PostgreSQL` storage for event relay consumers.
//!
//! This crate provides sqlx-based implementations of:
//!
//! - [`PgIdempotencyStore`]: processed event ids (`idempotency_keys`)
//! - [`PgCrmSyncLog`]: CRM sync side effect (`crm_sync_log`)
//! - [`PgDailyMetrics`]: daily counters side effect (`analytics_metrics`)
//!
//! Both side effects write their row and the event id in one transaction, and
//! skip the write when the id is already present, so a redelivered or
//! concurrently delivered event changes nothing.
//!
//! # Example
//!
//! ```ignore
//! use event_relay_postgres::{PgDailyMetrics, PgIdempotencyStore, Schema, connect};
//!
//! let pool = connect("postgres://localhost/analytics").await?;
//! Schema::Analytics.migrate(&pool).await?;
//!
//! let metrics = PgDailyMetrics::new(pool.clone());
//! let handler = IdempotentHandler::new(
//!     Arc::new(PgIdempotencyStore::new(pool, metrics.name())),
//!     Arc::new(metrics),
//! );
//! ```

pub mod crm_sync;
pub mod daily_metrics;
pub mod idempotency;

pub use crm_sync::{CrmSyncRecord, PgCrmSyncLog};
pub use daily_metrics::PgDailyMetrics;
pub use idempotency::PgIdempotencyStore;
pub use sqlx::PgPool;

use event_relay_core::error::{HandlerError, StoreError};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

/// Per-service table set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schema {
    /// `idempotency_keys` and `crm_sync_log`.
    Crm,
    /// `idempotency_keys` and `analytics_metrics`.
    Analytics,
}

impl Schema {
    /// Apply pending migrations for this service.
    ///
    /// Both services may share one database: `idempotency_keys` is keyed by
    /// `(consumer, event_id)` and the other version numbers do not collide.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(self, pool: &PgPool) -> Result<(), StoreError> {
        let mut migrator: Migrator = match self {
            Self::Crm => sqlx::migrate!("./migrations/crm"),
            Self::Analytics => sqlx::migrate!("./migrations/analytics"),
        };
        migrator
            .set_ignore_missing(true)
            .run(pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;

        tracing::info!(schema = ?self, "Database migrations applied");
        Ok(())
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))
}

pub(crate) fn database_error(e: sqlx::Error) -> HandlerError {
    HandlerError::Store(StoreError::Database(e.to_string()))
}
