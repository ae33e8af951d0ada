use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::ledger::LedgerStatus;

/// What triggered a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reconciliation_run_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Full,
    Partial,
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reconciliation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Running,
    Completed,
    Failed,
}

/// Classification of one (invoice, run) comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "discrepancy_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    None,
    AmountMismatch,
    StatusMismatch,
    MissingChain,
    MissingDb,
    Error,
}

impl DiscrepancyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyType::None => "none",
            DiscrepancyType::AmountMismatch => "amount_mismatch",
            DiscrepancyType::StatusMismatch => "status_mismatch",
            DiscrepancyType::MissingChain => "missing_chain",
            DiscrepancyType::MissingDb => "missing_db",
            DiscrepancyType::Error => "error",
        }
    }
}

/// Canonical status vocabulary both sides are mapped into before
/// comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Created,
    Funded,
    Disputed,
    Released,
    Expired,
    NotFound,
}

impl CanonicalStatus {
    pub fn from_ledger(status: LedgerStatus) -> Self {
        match status {
            LedgerStatus::Created => CanonicalStatus::Created,
            LedgerStatus::Funded => CanonicalStatus::Funded,
            LedgerStatus::Disputed => CanonicalStatus::Disputed,
            LedgerStatus::Released => CanonicalStatus::Released,
            LedgerStatus::Expired => CanonicalStatus::Expired,
        }
    }

    /// Fixed mapping from mirror status strings, including the legacy
    /// vocabulary older rows may still carry.
    pub fn from_mirror(status: &str) -> Self {
        match status {
            "created" | "pending" | "payment_pending" => CanonicalStatus::Created,
            "escrow_locked" | "funded" => CanonicalStatus::Funded,
            "released" | "settled" => CanonicalStatus::Released,
            "disputed" => CanonicalStatus::Disputed,
            "cancelled" | "failed" | "expired" => CanonicalStatus::Expired,
            _ => CanonicalStatus::NotFound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Created => "created",
            CanonicalStatus::Funded => "funded",
            CanonicalStatus::Disputed => "disputed",
            CanonicalStatus::Released => "released",
            CanonicalStatus::Expired => "expired",
            CanonicalStatus::NotFound => "not_found",
        }
    }
}

/// Chain-side view of one invoice for the diff
#[derive(Debug, Clone)]
pub struct ChainSide {
    pub status: CanonicalStatus,
    pub amount: BigInt,
    pub seller: String,
    pub buyer: String,
}

/// Store-side view of one invoice for the diff
#[derive(Debug, Clone)]
pub struct MirrorSide {
    pub status: CanonicalStatus,
    pub amount: BigInt,
    pub seller: String,
    pub buyer: String,
}

/// Outcome of the per-invoice diff
#[derive(Debug, Clone)]
pub struct Classification {
    pub discrepancy_type: DiscrepancyType,
    /// Signed difference `chain − db`, when both amounts are known
    pub discrepancy_amount: Option<BigInt>,
    pub notes: Vec<String>,
}

/// Compare the two views of one invoice. Status mismatch outranks amount
/// mismatch; counterparty drift annotates the notes and only upgrades a
/// clean row to `status_mismatch`.
pub fn classify(chain: Option<&ChainSide>, db: Option<&MirrorSide>) -> Classification {
    match (chain, db) {
        (None, None) => Classification {
            discrepancy_type: DiscrepancyType::None,
            discrepancy_amount: None,
            notes: Vec::new(),
        },
        (None, Some(_)) => Classification {
            discrepancy_type: DiscrepancyType::MissingChain,
            discrepancy_amount: None,
            notes: vec!["Escrow missing on chain".to_string()],
        },
        (Some(_), None) => Classification {
            discrepancy_type: DiscrepancyType::MissingDb,
            discrepancy_amount: None,
            notes: vec!["Escrow missing in database".to_string()],
        },
        (Some(chain), Some(db)) => {
            let mut discrepancy_type = DiscrepancyType::None;
            let mut notes = Vec::new();

            if chain.status != db.status {
                discrepancy_type = DiscrepancyType::StatusMismatch;
                notes.push(format!(
                    "Status mismatch: chain={} db={}",
                    chain.status.as_str(),
                    db.status.as_str()
                ));
            }

            let diff = &chain.amount - &db.amount;
            if chain.amount != db.amount {
                if discrepancy_type == DiscrepancyType::None {
                    discrepancy_type = DiscrepancyType::AmountMismatch;
                }
                notes.push(format!(
                    "Amount mismatch: chain={} db={} diff={}",
                    chain.amount, db.amount, diff
                ));
            }

            if !chain.seller.eq_ignore_ascii_case(&db.seller)
                || !chain.buyer.eq_ignore_ascii_case(&db.buyer)
            {
                notes.push("Counterparty mismatch".to_string());
                if discrepancy_type == DiscrepancyType::None {
                    discrepancy_type = DiscrepancyType::StatusMismatch;
                }
            }

            Classification {
                discrepancy_type,
                discrepancy_amount: Some(diff),
                notes,
            }
        }
    }
}

/// One row per (invoice, run)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub invoice_id: Uuid,
    pub chain_status: String,
    pub db_status: String,
    pub chain_amount: Option<String>,
    pub db_amount: Option<String>,
    pub discrepancy_amount: Option<String>,
    pub discrepancy_type: DiscrepancyType,
    pub chain_seller: Option<String>,
    pub chain_buyer: Option<String>,
    pub db_seller: Option<String>,
    pub db_buyer: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row per run; counts and the absolute-value discrepancy total
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationSummary {
    pub run_id: Uuid,
    pub run_type: RunType,
    pub total_count: i32,
    pub matched_count: i32,
    pub discrepancy_count: i32,
    pub missing_chain_count: i32,
    pub missing_db_count: i32,
    pub total_discrepancy_amount: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SummaryStatus,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(status: CanonicalStatus, amount: i64) -> ChainSide {
        ChainSide {
            status,
            amount: BigInt::from(amount),
            seller: "0xSeller".to_string(),
            buyer: "0xBuyer".to_string(),
        }
    }

    fn db(status: CanonicalStatus, amount: i64) -> MirrorSide {
        MirrorSide {
            status,
            amount: BigInt::from(amount),
            seller: "0xseller".to_string(),
            buyer: "0xbuyer".to_string(),
        }
    }

    #[test]
    fn test_matched_rows_are_clean() {
        let result = classify(
            Some(&chain(CanonicalStatus::Funded, 500)),
            Some(&db(CanonicalStatus::Funded, 500)),
        );
        assert_eq!(result.discrepancy_type, DiscrepancyType::None);
        assert_eq!(result.discrepancy_amount, Some(BigInt::from(0)));
        assert!(result.notes.is_empty());
    }

    #[test]
    fn test_status_mismatch() {
        // Chain released, mirror still funded, same amount
        let result = classify(
            Some(&chain(CanonicalStatus::Released, 500)),
            Some(&db(CanonicalStatus::Funded, 500)),
        );
        assert_eq!(result.discrepancy_type, DiscrepancyType::StatusMismatch);
        assert!(result.notes.iter().any(|n| n.contains("Status mismatch")));
        assert!(result.notes.iter().any(|n| n.contains("chain=released")));
        assert!(result.notes.iter().any(|n| n.contains("db=funded")));
    }

    #[test]
    fn test_amount_mismatch_is_signed() {
        let result = classify(
            Some(&chain(CanonicalStatus::Funded, 400)),
            Some(&db(CanonicalStatus::Funded, 500)),
        );
        assert_eq!(result.discrepancy_type, DiscrepancyType::AmountMismatch);
        assert_eq!(result.discrepancy_amount, Some(BigInt::from(-100)));
    }

    #[test]
    fn test_status_outranks_amount() {
        let result = classify(
            Some(&chain(CanonicalStatus::Released, 400)),
            Some(&db(CanonicalStatus::Funded, 500)),
        );
        assert_eq!(result.discrepancy_type, DiscrepancyType::StatusMismatch);
        // The signed diff is still recorded
        assert_eq!(result.discrepancy_amount, Some(BigInt::from(-100)));
    }

    #[test]
    fn test_counterparty_compare_is_case_insensitive() {
        // Same addresses with different casing already covered by the
        // fixtures; a genuinely different buyer flags the row
        let mut mirror = db(CanonicalStatus::Funded, 500);
        mirror.buyer = "0xsomeoneelse".to_string();
        let result = classify(Some(&chain(CanonicalStatus::Funded, 500)), Some(&mirror));
        assert_eq!(result.discrepancy_type, DiscrepancyType::StatusMismatch);
        assert!(result.notes.iter().any(|n| n.contains("Counterparty")));
    }

    #[test]
    fn test_missing_sides() {
        let result = classify(None, Some(&db(CanonicalStatus::Funded, 500)));
        assert_eq!(result.discrepancy_type, DiscrepancyType::MissingChain);

        let result = classify(Some(&chain(CanonicalStatus::Funded, 500)), None);
        assert_eq!(result.discrepancy_type, DiscrepancyType::MissingDb);
    }

    #[test]
    fn test_mirror_status_map() {
        assert_eq!(
            CanonicalStatus::from_mirror("payment_pending"),
            CanonicalStatus::Created
        );
        assert_eq!(
            CanonicalStatus::from_mirror("escrow_locked"),
            CanonicalStatus::Funded
        );
        assert_eq!(
            CanonicalStatus::from_mirror("settled"),
            CanonicalStatus::Released
        );
        assert_eq!(
            CanonicalStatus::from_mirror("cancelled"),
            CanonicalStatus::Expired
        );
        assert_eq!(
            CanonicalStatus::from_mirror("garbage"),
            CanonicalStatus::NotFound
        );
    }
}
