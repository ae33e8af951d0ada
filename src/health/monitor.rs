use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::models::{HealthMetric, MetricType, PipelineOverview};
use crate::error::AppResult;

/// Samples and aggregates pipeline health. Metric rows are append-only.
pub struct HealthMonitor {
    pool: PgPool,
    /// Sagas idle in processing/compensating past this are stuck
    stuck_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(pool: PgPool, stuck_threshold: Duration) -> Self {
        Self {
            pool,
            stuck_threshold,
        }
    }

    pub async fn record(
        &self,
        metric_type: MetricType,
        metric_name: &str,
        metric_value: Decimal,
        metadata: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO health_metrics (id, metric_type, metric_name, metric_value, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(metric_type)
        .bind(metric_name)
        .bind(metric_value)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Periodic DLQ depth sample
    pub async fn sample_dlq_depth(&self) -> AppResult<i64> {
        let (depth,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        self.record(
            MetricType::DlqSize,
            "dlq_depth",
            Decimal::from(depth),
            serde_json::json!({}),
        )
        .await?;
        debug!(depth, "DLQ depth sampled");
        Ok(depth)
    }

    pub async fn record_stuck_count(&self, count: usize) -> AppResult<()> {
        self.record(
            MetricType::StuckTransactions,
            "stuck_sagas",
            Decimal::from(count as i64),
            serde_json::json!({ "threshold_seconds": self.stuck_threshold.as_secs() }),
        )
        .await
    }

    /// On-demand aggregate across sagas, the recovery queue, the DLQ and
    /// pending compensations.
    pub async fn overview(&self) -> AppResult<PipelineOverview> {
        let (recovery_pending, recovery_processing): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'pending'),
                   COUNT(*) FILTER (WHERE status = 'processing')
            FROM recovery_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (dlq_depth,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        let (pending_compensations,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM compensation_actions WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        let (stuck_sagas,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM sagas
            WHERE current_state IN ('processing', 'compensating')
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(self.stuck_threshold.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        let (completed_sagas_24h, failed_sagas_24h): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE current_state = 'completed'),
                   COUNT(*) FILTER (WHERE current_state IN ('failed', 'dlq'))
            FROM sagas
            WHERE updated_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let finished = completed_sagas_24h + failed_sagas_24h;
        let success_rate = if finished > 0 {
            Some(Decimal::from(completed_sagas_24h * 100) / Decimal::from(finished))
        } else {
            None
        };

        let (avg_seconds,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (completed_at - created_at)))::float8
            FROM sagas
            WHERE current_state = 'completed'
              AND completed_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let avg_processing_seconds = avg_seconds.and_then(Decimal::from_f64_retain);

        Ok(PipelineOverview {
            recovery_pending,
            recovery_processing,
            dlq_depth,
            stuck_sagas,
            pending_compensations,
            completed_sagas_24h,
            failed_sagas_24h,
            success_rate,
            avg_processing_seconds,
            generated_at: Utc::now(),
        })
    }

    /// Recent samples of one metric family, newest first
    pub async fn recent(
        &self,
        metric_type: MetricType,
        limit: i64,
    ) -> AppResult<Vec<HealthMetric>> {
        let metrics = sqlx::query_as::<_, HealthMetric>(
            r#"
            SELECT id, metric_type, metric_name, metric_value, metadata, recorded_at
            FROM health_metrics
            WHERE metric_type = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(metric_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(metrics)
    }
}
