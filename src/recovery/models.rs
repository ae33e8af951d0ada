use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::saga::OperationType;

/// Recovery queue entry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "recovery_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One retryable operation waiting for the recovery worker. Keyed by
/// correlation id: repeated failures replace the row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecoveryEntry {
    pub correlation_id: Uuid,
    pub operation_type: OperationType,
    pub operation_data: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: RecoveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compensation progress on a DLQ entry or action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "compensation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Terminal resting place for operations that exhausted their retries.
/// Rows are append-only except for operator resolution updates.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DlqEntry {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub operation_type: OperationType,
    pub operation_data: serde_json::Value,
    pub failure_reason: String,
    pub retry_count: i32,
    pub requires_compensation: bool,
    pub compensation_status: CompensationStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Operator-driven reversal of visible external side effects
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CompensationAction {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub action_type: String,
    pub action_data: serde_json::Value,
    pub status: CompensationStatus,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Exponential backoff: `min(2^retry_count, cap)` minutes. The first
/// retry waits one minute, doubling up to the cap.
pub fn backoff_delay(retry_count: u32, cap_minutes: u32) -> Duration {
    let minutes = 1u64
        .checked_shl(retry_count)
        .unwrap_or(u64::MAX)
        .min(cap_minutes as u64);
    Duration::minutes(minutes as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        assert_eq!(backoff_delay(0, 60), Duration::minutes(1));
        assert_eq!(backoff_delay(1, 60), Duration::minutes(2));
        assert_eq!(backoff_delay(2, 60), Duration::minutes(4));
        assert_eq!(backoff_delay(5, 60), Duration::minutes(32));
        assert_eq!(backoff_delay(6, 60), Duration::minutes(60));
        assert_eq!(backoff_delay(10, 60), Duration::minutes(60));
    }

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let mut previous = Duration::zero();
        for retry in 0..64u32 {
            let delay = backoff_delay(retry, 60);
            assert!(delay >= Duration::minutes(1));
            assert!(delay <= Duration::minutes(60));
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        // Shift amounts past 63 would overflow a u64 without the check
        assert_eq!(backoff_delay(200, 60), Duration::minutes(60));
    }
}
