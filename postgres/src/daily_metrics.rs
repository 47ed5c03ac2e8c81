//! Daily event counters.
//!
//! Same merge rule as [`DailyCounts`](event_relay_core::aggregation::DailyCounts):
//! insert 1 for a new `(metric_date, event_type)` key, otherwise add 1. The
//! upsert and the idempotency key commit together.

use crate::database_error;
use crate::idempotency::PgIdempotencyStore;
use chrono::NaiveDate;
use event_relay_core::aggregation::MetricKey;
use event_relay_core::delivery::BoxFuture;
use event_relay_core::error::{HandlerError, StoreError};
use event_relay_core::event::{Event, EventType};
use event_relay_core::handler::SideEffect;
use sqlx::PgPool;

/// Maintains `analytics_metrics`.
#[derive(Clone, Debug)]
pub struct PgDailyMetrics {
    pool: PgPool,
}

impl PgDailyMetrics {
    /// Side effect using an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Counter for `(date, event_type)`, 0 when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count(&self, date: NaiveDate, event_type: EventType) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT count FROM analytics_metrics WHERE metric_date = $1 AND event_type = $2",
        )
        .bind(date)
        .bind(event_type.routing_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map_or(0, |(count,)| count))
    }
}

impl SideEffect for PgDailyMetrics {
    fn name(&self) -> &str {
        "analytics"
    }

    fn apply<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let key = MetricKey::from_event(event);
            let mut tx = self.pool.begin().await.map_err(database_error)?;

            let recorded =
                PgIdempotencyStore::record_in_transaction(&mut *tx, self.name(), &event.event_id)
                    .await?;
            if !recorded {
                tx.rollback().await.map_err(database_error)?;
                tracing::info!(
                    event_id = %event.event_id,
                    correlation_id = %event.correlation_id,
                    "Event already counted by a concurrent delivery"
                );
                return Ok(());
            }

            let (count,): (i64,) = sqlx::query_as(
                "INSERT INTO analytics_metrics (metric_date, event_type, count)
                 VALUES ($1, $2, 1)
                 ON CONFLICT (metric_date, event_type)
                 DO UPDATE SET count = analytics_metrics.count + 1
                 RETURNING count",
            )
            .bind(key.date)
            .bind(key.event_type.routing_key())
            .fetch_one(&mut *tx)
            .await
            .map_err(database_error)?;

            tx.commit().await.map_err(database_error)?;

            tracing::info!(
                event_id = %event.event_id,
                metric_date = %key.date,
                event_type = %key.event_type,
                count,
                correlation_id = %event.correlation_id,
                "Daily metric updated"
            );
            Ok(())
        })
    }
}
