use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// On-ledger escrow status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerStatus {
    Created,
    Funded,
    Disputed,
    Released,
    Expired,
}

impl LedgerStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LedgerStatus::Created),
            1 => Some(LedgerStatus::Funded),
            2 => Some(LedgerStatus::Disputed),
            3 => Some(LedgerStatus::Released),
            4 => Some(LedgerStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Created => "created",
            LedgerStatus::Funded => "funded",
            LedgerStatus::Disputed => "disputed",
            LedgerStatus::Released => "released",
            LedgerStatus::Expired => "expired",
        }
    }
}

/// Escrow account state as read back from the ledger
#[derive(Debug, Clone)]
pub struct LedgerEscrow {
    pub seller: String,
    pub buyer: String,
    pub amount: BigInt,
    pub token: String,
    pub status: LedgerStatus,
    pub seller_confirmed: bool,
    pub buyer_confirmed: bool,
    pub dispute_raised: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LedgerEscrow {
    /// The ledger reports deleted/never-created records with a zeroed
    /// seller address.
    pub fn is_absent(&self) -> bool {
        is_zero_address(&self.seller)
    }
}

pub fn is_zero_address(address: &str) -> bool {
    let hex = address.strip_prefix("0x").unwrap_or(address);
    !hex.is_empty() && hex.chars().all(|c| c == '0')
}

/// Multi-signature approval state for a funded escrow
#[derive(Debug, Clone)]
pub struct MultiSigState {
    pub approvers: Vec<String>,
    pub required: u32,
    pub count: u32,
}

/// One decoded event from the ledger stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub name: String,
    pub args: serde_json::Value,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

impl LedgerEvent {
    /// Stable identity used for duplicate suppression
    pub fn identity(&self) -> (&str, &str, u64) {
        (&self.name, &self.tx_hash, self.log_index)
    }
}

/// Typed submit operations. The client binding turns these into contract
/// calls; the core only cares that submission yields a tx hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOperation {
    CreateEscrow {
        key: String,
        seller: String,
        buyer: String,
        amount: String,
        token: String,
        duration_seconds: u64,
        rwa_nft_contract: Option<String>,
        rwa_token_id: Option<String>,
        discount_bps: u32,
        discount_deadline: Option<DateTime<Utc>>,
    },
    Deposit {
        key: String,
        amount: String,
    },
    ConfirmRelease {
        key: String,
        party: String,
    },
    ReclaimExpired {
        key: String,
    },
    RaiseDispute {
        key: String,
        party: String,
    },
    VoteOnDispute {
        key: String,
        arbitrator: String,
        vote_for_buyer: bool,
    },
    SafeEscape {
        key: String,
        seller_wins: bool,
    },
    AddApproval {
        key: String,
        approver: String,
    },
    FundInvoice {
        key: String,
        amount: String,
        funder: String,
    },
    MintRwaToken {
        key: String,
        token_id: String,
        supply: String,
        face_value: String,
    },
}

impl LedgerOperation {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerOperation::CreateEscrow { .. } => "create_escrow",
            LedgerOperation::Deposit { .. } => "deposit",
            LedgerOperation::ConfirmRelease { .. } => "confirm_release",
            LedgerOperation::ReclaimExpired { .. } => "reclaim_expired",
            LedgerOperation::RaiseDispute { .. } => "raise_dispute",
            LedgerOperation::VoteOnDispute { .. } => "vote_on_dispute",
            LedgerOperation::SafeEscape { .. } => "safe_escape",
            LedgerOperation::AddApproval { .. } => "add_approval",
            LedgerOperation::FundInvoice { .. } => "fund_invoice",
            LedgerOperation::MintRwaToken { .. } => "mint_rwa_token",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(LedgerStatus::from_code(0), Some(LedgerStatus::Created));
        assert_eq!(LedgerStatus::from_code(3), Some(LedgerStatus::Released));
        assert_eq!(LedgerStatus::from_code(4), Some(LedgerStatus::Expired));
        assert_eq!(LedgerStatus::from_code(5), None);
    }

    #[test]
    fn test_zero_address() {
        assert!(is_zero_address(
            "0x0000000000000000000000000000000000000000"
        ));
        assert!(is_zero_address("0000000000000000000000000000000000000000"));
        assert!(!is_zero_address(
            "0x00000000000000000000000000000000000000a1"
        ));
        assert!(!is_zero_address(""));
    }
}
