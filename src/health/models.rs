use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

/// Health metric families sampled by the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "metric_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    SuccessRate,
    RetryCount,
    DlqSize,
    AvgProcessingTime,
    StuckTransactions,
    CompensationRate,
    ErrorRate,
}

/// Append-only metric sample
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HealthMetric {
    pub id: Uuid,
    pub metric_type: MetricType,
    pub metric_name: String,
    pub metric_value: Decimal,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated view of the pipeline for the (out of scope) status surface
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOverview {
    pub recovery_pending: i64,
    pub recovery_processing: i64,
    pub dlq_depth: i64,
    pub stuck_sagas: i64,
    pub pending_compensations: i64,
    pub completed_sagas_24h: i64,
    pub failed_sagas_24h: i64,
    pub success_rate: Option<Decimal>,
    pub avg_processing_seconds: Option<Decimal>,
    pub generated_at: DateTime<Utc>,
}
