//! `PostgreSQL` idempotency store.
//!
//! Keys are scoped by consumer name, so each service keeps its own record of
//! the ids it has handled even when several services share a database.
//! Duplicate inserts are absorbed by the primary key (`ON CONFLICT DO NOTHING`).

use chrono::{DateTime, Utc};
use event_relay_core::delivery::BoxFuture;
use event_relay_core::error::StoreError;
use event_relay_core::event::EventId;
use event_relay_core::idempotency::IdempotencyStore;
use sqlx::{PgConnection, PgPool};

/// Idempotency store backed by the `idempotency_keys` table.
#[derive(Clone, Debug)]
pub struct PgIdempotencyStore {
    pool: PgPool,
    consumer: String,
}

impl PgIdempotencyStore {
    /// Store for `consumer`'s keys using an existing pool.
    ///
    /// `consumer` must match the name the side effect records under.
    #[must_use]
    pub fn new(pool: PgPool, consumer: impl Into<String>) -> Self {
        Self {
            pool,
            consumer: consumer.into(),
        }
    }

    /// Consumer whose keys this store reads and writes.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Record `event_id` for `consumer` on an open connection or transaction.
    ///
    /// Returns `true` if the id was newly inserted, `false` if it was already
    /// present. Side effects call this first inside their own transaction and
    /// skip their write on `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn record_in_transaction(
        conn: &mut PgConnection,
        consumer: &str,
        event_id: &EventId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO idempotency_keys (consumer, event_id, processed_at)
             VALUES ($1, $2, now())
             ON CONFLICT (consumer, event_id) DO NOTHING",
        )
        .bind(consumer)
        .bind(event_id.as_str())
        .execute(conn)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    /// When `event_id` was recorded, if it was.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn processed_at(&self, event_id: &EventId) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT processed_at FROM idempotency_keys WHERE consumer = $1 AND event_id = $2",
        )
        .bind(&self.consumer)
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|(processed_at,)| processed_at))
    }

    /// Number of ids recorded for this consumer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM idempotency_keys WHERE consumer = $1")
                .bind(&self.consumer)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(count)
    }
}

impl IdempotencyStore for PgIdempotencyStore {
    fn has_processed<'a>(&'a self, event_id: &'a EventId) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS(
                    SELECT 1 FROM idempotency_keys WHERE consumer = $1 AND event_id = $2
                 )",
            )
            .bind(&self.consumer)
            .bind(event_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(exists)
        })
    }

    fn record_processed<'a>(&'a self, event_id: &'a EventId) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            if !Self::record_in_transaction(&mut *conn, &self.consumer, event_id).await? {
                tracing::debug!(
                    consumer = %self.consumer,
                    event_id = %event_id,
                    "Event id already recorded"
                );
            }
            Ok(())
        })
    }
}
