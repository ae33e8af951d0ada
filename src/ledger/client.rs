use async_trait::async_trait;
use futures::stream::BoxStream;

use super::models::{LedgerEscrow, LedgerEvent, LedgerOperation, MultiSigState};
use crate::error::LedgerError;
use crate::ledger::encoding::KEY_LEN;

/// Capability handle onto the external ledger. The concrete binding
/// (contract ABI, signer, RPC transport) lives outside the core; every
/// implementation must already enforce signature checks and nonce
/// management.
///
/// Submission is at-least-once: callers carry idempotency through the
/// invoice key and reconcile divergence afterwards.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Read escrow state for a 32-byte invoice key. `None` when the
    /// client can positively distinguish absence; implementations may
    /// instead return a zero-seller record (see `LedgerEscrow::is_absent`).
    async fn read_escrow(&self, key: [u8; KEY_LEN])
        -> Result<Option<LedgerEscrow>, LedgerError>;

    /// Submit an operation and return its transaction hash
    async fn submit(&self, operation: LedgerOperation) -> Result<String, LedgerError>;

    /// Subscribe to the ledger event stream, starting at the current head
    async fn events(&self) -> Result<BoxStream<'static, LedgerEvent>, LedgerError>;

    /// Read multi-signature approval state for a funded escrow
    async fn read_multisig_approvals(
        &self,
        key: [u8; KEY_LEN],
    ) -> Result<MultiSigState, LedgerError>;
}
