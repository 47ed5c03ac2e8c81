//! CRM sync log side effect.
//!
//! Every newly seen user event appends one row describing the user snapshot
//! that would be pushed to the CRM. The row and the idempotency key commit in
//! the same transaction.

use crate::database_error;
use crate::idempotency::PgIdempotencyStore;
use chrono::{DateTime, Utc};
use event_relay_core::delivery::BoxFuture;
use event_relay_core::error::{HandlerError, StoreError};
use event_relay_core::event::Event;
use event_relay_core::handler::SideEffect;
use sqlx::PgPool;

/// One row of `crm_sync_log`.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct CrmSyncRecord {
    /// Row id.
    pub id: i64,
    /// Event that caused the sync.
    pub event_id: String,
    /// Correlation id of that event.
    pub correlation_id: Option<String>,
    /// Routing key form of the event type.
    pub event_type: String,
    /// Synced user id.
    pub user_id: String,
    /// Synced user email.
    pub user_email: Option<String>,
    /// Synced user name.
    pub user_name: Option<String>,
    /// When the row was written.
    pub synced_at: DateTime<Utc>,
}

/// Writes user snapshots to `crm_sync_log`.
#[derive(Clone, Debug)]
pub struct PgCrmSyncLog {
    pool: PgPool,
}

impl PgCrmSyncLog {
    /// Side effect using an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All rows for `user_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn rows_for_user(&self, user_id: &str) -> Result<Vec<CrmSyncRecord>, StoreError> {
        sqlx::query_as::<_, CrmSyncRecord>(
            "SELECT id, event_id, correlation_id, event_type, user_id, user_email, user_name, synced_at
             FROM crm_sync_log
             WHERE user_id = $1
             ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Total number of rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM crm_sync_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(count)
    }
}

impl SideEffect for PgCrmSyncLog {
    fn name(&self) -> &str {
        "crm"
    }

    fn apply<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(database_error)?;

            let recorded =
                PgIdempotencyStore::record_in_transaction(&mut *tx, self.name(), &event.event_id)
                    .await?;
            if !recorded {
                tx.rollback().await.map_err(database_error)?;
                tracing::info!(
                    event_id = %event.event_id,
                    correlation_id = %event.correlation_id,
                    "User already synced by a concurrent delivery"
                );
                return Ok(());
            }

            sqlx::query(
                "INSERT INTO crm_sync_log
                     (event_id, correlation_id, event_type, user_id, user_email, user_name, synced_at)
                 VALUES ($1, $2, $3, $4, $5, $6, now())",
            )
            .bind(event.event_id.as_str())
            .bind(&event.correlation_id)
            .bind(event.event_type.routing_key())
            .bind(&event.data.id)
            .bind(&event.data.email)
            .bind(&event.data.name)
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;

            tx.commit().await.map_err(database_error)?;

            metrics::counter!("crm_sync_rows_written_total", "event_type" => event.event_type.routing_key())
                .increment(1);
            tracing::info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                user_id = %event.data.id,
                correlation_id = %event.correlation_id,
                "User synced to CRM"
            );
            Ok(())
        })
    }
}
