use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the entire core
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors surfaced by the external ledger client
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transient ledger error: {0}")]
    Transient(String),

    #[error("Ledger reverted: {0}")]
    Reverted(String),

    #[error("Ledger event stream closed")]
    StreamClosed,

    #[error("Invalid ledger key: {0}")]
    InvalidKey(String),
}

/// Saga lifecycle errors
#[derive(Error, Debug)]
pub enum SagaError {
    #[error("Saga not found: {0}")]
    NotFound(Uuid),

    #[error("Illegal saga transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("Malformed saga context for {correlation_id}: {message}")]
    MalformedContext {
        correlation_id: Uuid,
        message: String,
    },
}

/// Escrow protocol errors. Everything here is a precondition failure:
/// fail fast, never retried, never compensated.
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Escrow not found: {0}")]
    NotFound(Uuid),

    #[error("Escrow already exists for invoice {0}")]
    AlreadyExists(Uuid),

    #[error("Escrow {invoice_id} in invalid state: {current}, expected: {expected}")]
    InvalidState {
        invoice_id: Uuid,
        current: String,
        expected: String,
    },

    #[error("Amount {amount} below minimum escrow amount {minimum}")]
    BelowMinimum { amount: String, minimum: String },

    #[error("Computed fee is zero for amount {0}")]
    ZeroFee(String),

    #[error("Discount rate {0} exceeds 10000 basis points")]
    InvalidDiscount(u32),

    #[error("Caller {caller} is not authorized: {required}")]
    NotAuthorized { caller: String, required: String },

    #[error("Escrow {0} has expired")]
    Expired(Uuid),

    #[error("Escrow {0} has not expired yet")]
    NotExpired(Uuid),

    #[error("No registered arbitrators")]
    NoArbitrators,

    #[error("Arbitrator {0} has already voted")]
    AlreadyVoted(String),

    #[error("Dispute for {0} is already resolved")]
    DisputeResolved(Uuid),

    #[error("No dispute open for escrow {0}")]
    NoDispute(Uuid),

    #[error("Quorum is still reachable: {live} live arbitrators, {required} required")]
    QuorumReachable { live: u32, required: u32 },
}

/// Reconciliation engine errors
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Batch size {0} exceeds maximum {1}")]
    BatchTooLarge(u32, u32),
}

/// Wire shape for error reporting to the (out of scope) API layer
#[derive(Serialize)]
pub struct ErrorReport {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl AppError {
    /// Whether the recovery pipeline should retry this failure with
    /// backoff. Permanent reverts, validation failures and state machine
    /// violations are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Ledger(LedgerError::Transient(_)) => true,
            AppError::Ledger(LedgerError::StreamClosed) => true,
            AppError::Database(e) => is_contention(e) || is_io(e),
            AppError::Internal(_) => true,
            _ => false,
        }
    }

    /// Whether this is a store serialization/deadlock failure that should
    /// be retried in place (unit-of-work retry, not the recovery queue).
    pub fn is_contention(&self) -> bool {
        matches!(self, AppError::Database(e) if is_contention(e))
    }

    /// Stable code for the API layer's error mapping
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "STORE_ERROR",
            AppError::Ledger(LedgerError::Transient(_)) => "LEDGER_TRANSIENT",
            AppError::Ledger(_) => "LEDGER_ERROR",
            AppError::Saga(SagaError::IllegalTransition { .. }) => "ILLEGAL_TRANSITION",
            AppError::Saga(_) => "SAGA_ERROR",
            AppError::Escrow(EscrowError::InvalidState { .. }) => "ESCROW_INVALID_STATE",
            AppError::Escrow(_) => "ESCROW_ERROR",
            AppError::Reconciliation(_) => "RECONCILIATION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
        }
    }

    pub fn report(&self, correlation_id: Option<Uuid>) -> ErrorReport {
        ErrorReport {
            error: self.to_string(),
            error_code: self.code().to_string(),
            correlation_id,
        }
    }
}

/// Serialization failure (40001) or deadlock (40P01)
fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

fn is_io(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("{error:?}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON error: {error}"))
    }
}

/// Result type alias for the core
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_ledger_errors_are_retryable() {
        let err = AppError::Ledger(LedgerError::Transient("rpc timeout".into()));
        assert!(err.is_retryable());
    }

    #[test]
    fn reverts_are_terminal() {
        let err = AppError::Ledger(LedgerError::Reverted("Already disputed".into()));
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "LEDGER_ERROR");
    }

    #[test]
    fn state_violations_are_terminal() {
        let err = AppError::Escrow(EscrowError::InvalidState {
            invoice_id: Uuid::new_v4(),
            current: "created".into(),
            expected: "funded".into(),
        });
        assert!(!err.is_retryable());
        assert!(!err.is_contention());
    }

    #[test]
    fn validation_never_enqueues() {
        let err = AppError::Validation("bad input".into());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
