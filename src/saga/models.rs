use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::error::{AppResult, SagaError};

/// Durable step names recorded in the saga log. A worker resuming a saga
/// consults these to skip effects that already committed.
pub mod steps {
    /// The external ledger transaction was submitted and accepted
    pub const BLOCKCHAIN_TX: &str = "BLOCKCHAIN_TX";
    /// The internal mirror/state-of-record write committed
    pub const DB_UPDATE: &str = "DB_UPDATE";
    /// The audit trail entry was written
    pub const AUDIT_LOG: &str = "AUDIT_LOG";
    /// External liquidity moved (financing pipeline)
    pub const LIQUIDITY_TRANSFER: &str = "LIQUIDITY_TRANSFER";
    /// The ledger event was applied to the mirror
    pub const EVENT_MIRROR: &str = "EVENT_MIRROR";
}

/// Multi-step operations tracked by the saga manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "operation_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    EscrowRelease,
    EscrowDispute,
    EventProcessing,
    Tokenization,
    FinancingPipeline,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::EscrowRelease => "escrow_release",
            OperationType::EscrowDispute => "escrow_dispute",
            OperationType::EventProcessing => "event_processing",
            OperationType::Tokenization => "tokenization",
            OperationType::FinancingPipeline => "financing_pipeline",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Saga lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "saga_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SagaState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dlq,
    Compensating,
    Compensated,
}

impl SagaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Pending => "pending",
            SagaState::Processing => "processing",
            SagaState::Completed => "completed",
            SagaState::Failed => "failed",
            SagaState::Dlq => "dlq",
            SagaState::Compensating => "compensating",
            SagaState::Compensated => "compensated",
        }
    }

    /// No transitions leave a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Compensated)
    }

    /// States that stamp `completed_at` on entry
    pub fn is_resting(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::Dlq
        )
    }
}

/// Validate a saga state transition.
///
/// The happy path is pending → processing → completed. Failures go
/// failed → dlq, or back through processing when the recovery worker
/// re-drives the operation. Compensation leaves from processing, failed
/// or dlq and ends in compensated.
pub fn validate_transition(from: SagaState, to: SagaState) -> AppResult<()> {
    use SagaState::*;

    let allowed = match from {
        Pending => matches!(to, Processing),
        // Processing → Processing lets a crashed tick reclaim its work
        Processing => matches!(to, Processing | Completed | Failed | Compensating),
        Failed => matches!(to, Processing | Dlq | Compensating),
        Dlq => matches!(to, Compensating),
        Compensating => matches!(to, Compensated | Failed),
        Completed | Compensated => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(SagaError::IllegalTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }
        .into())
    }
}

/// A durable, step-logged record of one multi-step operation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Saga {
    pub correlation_id: Uuid,
    pub operation_type: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    pub current_state: SagaState,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    pub context_data: serde_json::Value,
    pub initiated_by: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Saga {
    pub fn step_completed(&self, step: &str) -> bool {
        self.steps_completed.iter().any(|s| s == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(validate_transition(SagaState::Pending, SagaState::Processing).is_ok());
        assert!(validate_transition(SagaState::Processing, SagaState::Completed).is_ok());
        assert!(validate_transition(SagaState::Processing, SagaState::Failed).is_ok());
        assert!(validate_transition(SagaState::Failed, SagaState::Dlq).is_ok());
    }

    #[test]
    fn test_retry_reenters_processing() {
        assert!(validate_transition(SagaState::Failed, SagaState::Processing).is_ok());
        assert!(validate_transition(SagaState::Processing, SagaState::Processing).is_ok());
    }

    #[test]
    fn test_compensation_path() {
        assert!(validate_transition(SagaState::Processing, SagaState::Compensating).is_ok());
        assert!(validate_transition(SagaState::Failed, SagaState::Compensating).is_ok());
        assert!(validate_transition(SagaState::Dlq, SagaState::Compensating).is_ok());
        assert!(validate_transition(SagaState::Compensating, SagaState::Compensated).is_ok());
    }

    #[test]
    fn test_terminal_states_are_sealed() {
        for to in [
            SagaState::Pending,
            SagaState::Processing,
            SagaState::Failed,
            SagaState::Dlq,
            SagaState::Compensating,
        ] {
            assert!(validate_transition(SagaState::Completed, to).is_err());
            assert!(validate_transition(SagaState::Compensated, to).is_err());
        }
    }

    #[test]
    fn test_no_skipping_pending() {
        assert!(validate_transition(SagaState::Pending, SagaState::Completed).is_err());
        assert!(validate_transition(SagaState::Pending, SagaState::Dlq).is_err());
    }
}
