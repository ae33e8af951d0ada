use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::error::{AppError, AppResult, EscrowError};

/// Mirror escrow status. The ledger owns the state machine; the mirror
/// follows it and keeps released escrows terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "escrow_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Created,
    Funded,
    Disputed,
    Released,
    Expired,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Created => "created",
            EscrowStatus::Funded => "funded",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Released => "released",
            EscrowStatus::Expired => "expired",
        }
    }
}

/// Validate a mirror status transition. Expired escrows may still be
/// released when both parties choose to complete late.
pub fn validate_status_transition(
    invoice_id: Uuid,
    from: EscrowStatus,
    to: EscrowStatus,
) -> AppResult<()> {
    use EscrowStatus::*;

    let allowed = match from {
        Created => matches!(to, Funded | Expired),
        Funded => matches!(to, Released | Disputed | Expired),
        Disputed => matches!(to, Released | Expired),
        Expired => matches!(to, Released),
        Released => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(EscrowError::InvalidState {
            invoice_id,
            current: from.as_str().to_string(),
            expected: to.as_str().to_string(),
        }
        .into())
    }
}

/// Internal mirror of one on-ledger escrow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub invoice_id: Uuid,
    pub seller: String,
    pub buyer: String,
    /// Authoritative amount; after a discounted deposit this is the
    /// payable, not the face value
    pub amount: BigInt,
    pub token: String,
    pub status: EscrowStatus,
    pub seller_confirmed: bool,
    pub buyer_confirmed: bool,
    pub dispute_raised: bool,
    pub fee_amount: BigInt,
    pub discount_rate_bps: i32,
    pub discount_deadline: Option<DateTime<Utc>>,
    pub rwa_nft_contract: Option<String>,
    pub rwa_token_id: Option<String>,
    pub release_tx_hash: Option<String>,
    pub released_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    /// Build from a database row. Amounts are stored as decimal strings
    /// and parsed into big integers.
    pub fn from_row(row: &sqlx::postgres::PgRow) -> AppResult<Self> {
        use sqlx::Row;

        let amount: String = row.try_get("amount")?;
        let amount = amount
            .parse::<BigInt>()
            .map_err(|_| AppError::Internal(format!("Invalid stored amount: {amount}")))?;

        let fee_amount: String = row.try_get("fee_amount")?;
        let fee_amount = fee_amount
            .parse::<BigInt>()
            .map_err(|_| AppError::Internal(format!("Invalid stored fee: {fee_amount}")))?;

        Ok(Escrow {
            invoice_id: row.try_get("invoice_id")?,
            seller: row.try_get("seller")?,
            buyer: row.try_get("buyer")?,
            amount,
            token: row.try_get("token")?,
            status: row.try_get("status")?,
            seller_confirmed: row.try_get("seller_confirmed")?,
            buyer_confirmed: row.try_get("buyer_confirmed")?,
            dispute_raised: row.try_get("dispute_raised")?,
            fee_amount,
            discount_rate_bps: row.try_get("discount_rate_bps")?,
            discount_deadline: row.try_get("discount_deadline")?,
            rwa_nft_contract: row.try_get("rwa_nft_contract")?,
            rwa_token_id: row.try_get("rwa_token_id")?,
            release_tx_hash: row.try_get("release_tx_hash")?,
            released_to: row.try_get("released_to")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_party(&self, address: &str) -> bool {
        addresses_equal(&self.seller, address) || addresses_equal(&self.buyer, address)
    }

    /// Active discount: deadline not passed and a nonzero rate
    pub fn discount_active_at(&self, now: DateTime<Utc>) -> bool {
        self.discount_rate_bps > 0
            && self
                .discount_deadline
                .map(|deadline| now <= deadline)
                .unwrap_or(false)
    }
}

/// Ledger addresses compare case-insensitively
pub fn addresses_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// fee = floor(amount * fee_bps / 10000)
pub fn compute_fee(amount: &BigInt, fee_bps: u32) -> BigInt {
    (amount * BigInt::from(fee_bps)) / BigInt::from(10_000u32)
}

/// payable = amount - floor(amount * discount_bps / 10000)
pub fn discounted_payable(amount: &BigInt, discount_bps: u32) -> BigInt {
    amount - (amount * BigInt::from(discount_bps)) / BigInt::from(10_000u32)
}

/// Split the escrowed amount into (treasury fee, winner payout). The two
/// always sum back to the full amount.
pub fn release_split(amount: &BigInt, fee_amount: &BigInt) -> (BigInt, BigInt) {
    let fee = if fee_amount > amount {
        amount.clone()
    } else {
        fee_amount.clone()
    };
    let payout = amount - &fee;
    (fee, payout)
}

/// quorum = ceil(snapshot * quorum_pct / 100), never below one vote
pub fn quorum_threshold(snapshot: u32, quorum_pct: u32) -> u32 {
    let threshold = (snapshot as u64 * quorum_pct as u64).div_ceil(100) as u32;
    threshold.max(1)
}

/// What caused a release; decides where the collateral NFT goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// Both parties confirmed (or the multi-sig threshold was met)
    MutualConfirmation,
    DisputeSellerWins,
    DisputeBuyerWins,
}

/// NFT recipient: buyer on a normal release, buyer when the seller wins
/// the dispute (buyer paid, seller keeps the funds), seller when the
/// buyer wins (funds go back, seller keeps the asset).
pub fn nft_recipient<'a>(cause: ReleaseCause, seller: &'a str, buyer: &'a str) -> &'a str {
    match cause {
        ReleaseCause::MutualConfirmation => buyer,
        ReleaseCause::DisputeSellerWins => buyer,
        ReleaseCause::DisputeBuyerWins => seller,
    }
}

/// Multi-signature approval set for a funded escrow. Release fires
/// automatically once the approver set reaches the threshold.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MultiSigApproval {
    pub invoice_id: Uuid,
    pub approvers: Vec<String>,
    pub required: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MultiSigApproval {
    pub fn count(&self) -> u32 {
        self.approvers.len() as u32
    }

    pub fn satisfied(&self) -> bool {
        self.count() >= self.required.max(0) as u32
    }

    pub fn has_approved(&self, approver: &str) -> bool {
        self.approvers.iter().any(|a| addresses_equal(a, approver))
    }
}

/// Outcome of one dispute vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Pending,
    Resolved { seller_wins: bool },
}

/// Per-dispute voting record. `snapshot_arbitrator_count` only ever
/// shrinks: arbitrator departures tighten the quorum, they never loosen
/// it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DisputeVote {
    pub invoice_id: Uuid,
    pub snapshot_arbitrator_count: i32,
    pub votes_for_buyer: i32,
    pub votes_for_seller: i32,
    pub voted: Vec<String>,
    pub resolved: bool,
    pub seller_wins: Option<bool>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DisputeVote {
    pub fn open(invoice_id: Uuid, arbitrator_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            invoice_id,
            snapshot_arbitrator_count: arbitrator_count as i32,
            votes_for_buyer: 0,
            votes_for_seller: 0,
            voted: Vec::new(),
            resolved: false,
            seller_wins: None,
            opened_at: now,
            resolved_at: None,
        }
    }

    pub fn has_voted(&self, arbitrator: &str) -> bool {
        self.voted.iter().any(|v| addresses_equal(v, arbitrator))
    }

    /// Record one arbitrator vote. Shrinks the snapshot to the live
    /// count, tallies, and resolves once the quorum is met: ties go to
    /// the buyer, the seller needs a strict majority.
    pub fn apply_vote(
        &mut self,
        arbitrator: &str,
        vote_for_buyer: bool,
        live_count: u32,
        quorum_pct: u32,
        now: DateTime<Utc>,
    ) -> AppResult<VoteOutcome> {
        if self.resolved {
            return Err(EscrowError::DisputeResolved(self.invoice_id).into());
        }
        if self.has_voted(arbitrator) {
            return Err(EscrowError::AlreadyVoted(arbitrator.to_string()).into());
        }

        self.snapshot_arbitrator_count = self.snapshot_arbitrator_count.min(live_count as i32);
        self.voted.push(arbitrator.to_string());
        if vote_for_buyer {
            self.votes_for_buyer += 1;
        } else {
            self.votes_for_seller += 1;
        }

        let threshold = quorum_threshold(self.snapshot_arbitrator_count as u32, quorum_pct);
        let total = (self.votes_for_buyer + self.votes_for_seller) as u32;
        if total >= threshold {
            let seller_wins = self.votes_for_seller > self.votes_for_buyer;
            self.resolved = true;
            self.seller_wins = Some(seller_wins);
            self.resolved_at = Some(now);
            return Ok(VoteOutcome::Resolved { seller_wins });
        }
        Ok(VoteOutcome::Pending)
    }

    /// The admin escape hatch applies only when the quorum is provably
    /// unreachable against the current (shrunken) snapshot.
    pub fn quorum_unreachable(&self, live_count: u32, quorum_pct: u32) -> bool {
        live_count < quorum_threshold(self.snapshot_arbitrator_count as u32, quorum_pct)
    }

    pub fn resolve_by_escape(&mut self, seller_wins: bool, now: DateTime<Utc>) {
        self.resolved = true;
        self.seller_wins = Some(seller_wins);
        self.resolved_at = Some(now);
    }
}

/// Validate amount against the fee schedule at creation time
pub fn validate_creation_amount(
    amount: &BigInt,
    minimum: &BigInt,
    fee_bps: u32,
) -> AppResult<BigInt> {
    if amount < minimum {
        return Err(EscrowError::BelowMinimum {
            amount: amount.to_string(),
            minimum: minimum.to_string(),
        }
        .into());
    }
    let fee = compute_fee(amount, fee_bps);
    if fee.is_zero() {
        return Err(EscrowError::ZeroFee(amount.to_string()).into());
    }
    Ok(fee)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_fee_math() {
        // 1000 at 50 bps = 5
        assert_eq!(compute_fee(&BigInt::from(1000), 50), BigInt::from(5));
        // Below the minimum the fee floors to zero
        assert_eq!(compute_fee(&BigInt::from(199), 50), BigInt::from(0));
        assert_eq!(compute_fee(&BigInt::from(200), 50), BigInt::from(1));
    }

    #[test]
    fn test_validate_creation_amount() {
        let minimum = BigInt::from(200);
        assert!(validate_creation_amount(&BigInt::from(199), &minimum, 50).is_err());
        let fee = validate_creation_amount(&BigInt::from(1000), &minimum, 50).unwrap();
        assert_eq!(fee, BigInt::from(5));
    }

    #[test]
    fn test_release_split_conserves_amount() {
        for (amount, fee) in [(1000u32, 5u32), (200, 1), (7, 7), (1_000_000, 500)] {
            let amount = BigInt::from(amount);
            let fee = BigInt::from(fee);
            let (treasury, payout) = release_split(&amount, &fee);
            assert_eq!(&treasury + &payout, amount);
        }
    }

    #[test]
    fn test_release_split_caps_fee_at_amount() {
        let (fee, payout) = release_split(&BigInt::from(3), &BigInt::from(10));
        assert_eq!(fee, BigInt::from(3));
        assert_eq!(payout, BigInt::from(0));
    }

    #[test]
    fn test_discounted_payable() {
        // 2% on 1000 leaves 980
        assert_eq!(discounted_payable(&BigInt::from(1000), 200), BigInt::from(980));
        // Flooring favors the payer of the full remainder
        assert_eq!(discounted_payable(&BigInt::from(999), 100), BigInt::from(990));
        assert_eq!(discounted_payable(&BigInt::from(1000), 0), BigInt::from(1000));
    }

    #[test]
    fn test_quorum_threshold() {
        assert_eq!(quorum_threshold(10, 51), 6);
        assert_eq!(quorum_threshold(5, 51), 3);
        assert_eq!(quorum_threshold(1, 51), 1);
        // Never below one, even for an empty snapshot
        assert_eq!(quorum_threshold(0, 51), 1);
        assert_eq!(quorum_threshold(3, 100), 3);
    }

    #[test]
    fn test_status_transitions() {
        let id = Uuid::new_v4();
        assert!(validate_status_transition(id, EscrowStatus::Created, EscrowStatus::Funded).is_ok());
        assert!(
            validate_status_transition(id, EscrowStatus::Funded, EscrowStatus::Disputed).is_ok()
        );
        assert!(
            validate_status_transition(id, EscrowStatus::Disputed, EscrowStatus::Released).is_ok()
        );
        // Late completion of an expired escrow is allowed
        assert!(
            validate_status_transition(id, EscrowStatus::Expired, EscrowStatus::Released).is_ok()
        );
        // Released is terminal
        assert!(
            validate_status_transition(id, EscrowStatus::Released, EscrowStatus::Funded).is_err()
        );
        assert!(
            validate_status_transition(id, EscrowStatus::Created, EscrowStatus::Released).is_err()
        );
    }

    #[test]
    fn test_dispute_quorum_shrink() {
        // Snapshot 10, quorum 51% -> threshold 6
        let mut vote = DisputeVote::open(Uuid::new_v4(), 10, now());

        assert_eq!(
            vote.apply_vote("arb-1", false, 10, 51, now()).unwrap(),
            VoteOutcome::Pending
        );
        assert_eq!(
            vote.apply_vote("arb-2", false, 10, 51, now()).unwrap(),
            VoteOutcome::Pending
        );
        assert_eq!(
            vote.apply_vote("arb-3", true, 10, 51, now()).unwrap(),
            VoteOutcome::Pending
        );

        // Five arbitrators removed: live = 5, snapshot shrinks on the
        // next vote, threshold becomes ceil(5 * 51 / 100) = 3, and the
        // fourth vote resolves 3-1 for the seller.
        let outcome = vote.apply_vote("arb-4", false, 5, 51, now()).unwrap();
        assert_eq!(vote.snapshot_arbitrator_count, 5);
        assert_eq!(outcome, VoteOutcome::Resolved { seller_wins: true });
        assert_eq!(vote.votes_for_seller, 3);
        assert_eq!(vote.votes_for_buyer, 1);
    }

    #[test]
    fn test_snapshot_never_grows() {
        let mut vote = DisputeVote::open(Uuid::new_v4(), 10, now());
        vote.apply_vote("arb-1", true, 4, 51, now()).unwrap();
        assert_eq!(vote.snapshot_arbitrator_count, 4);
        // Arbitrators rejoining must not loosen the quorum
        vote.apply_vote("arb-2", false, 12, 51, now()).unwrap();
        assert_eq!(vote.snapshot_arbitrator_count, 4);
    }

    #[test]
    fn test_tie_goes_to_buyer() {
        // Snapshot 2, quorum 51% -> threshold 2; a 1-1 split resolves
        // for the buyer because the seller needs a strict majority
        let mut vote = DisputeVote::open(Uuid::new_v4(), 2, now());
        assert_eq!(
            vote.apply_vote("arb-1", false, 2, 51, now()).unwrap(),
            VoteOutcome::Pending
        );
        let outcome = vote.apply_vote("arb-2", true, 2, 51, now()).unwrap();
        assert_eq!(outcome, VoteOutcome::Resolved { seller_wins: false });
    }

    #[test]
    fn test_double_vote_rejected() {
        let mut vote = DisputeVote::open(Uuid::new_v4(), 10, now());
        vote.apply_vote("arb-1", true, 10, 51, now()).unwrap();
        assert!(vote.apply_vote("ARB-1", false, 10, 51, now()).is_err());
    }

    #[test]
    fn test_safe_escape_precondition() {
        // Snapshot 10, threshold 6, everyone removed: 2/2 votes frozen
        let mut vote = DisputeVote::open(Uuid::new_v4(), 10, now());
        vote.apply_vote("arb-1", true, 10, 51, now()).unwrap();
        vote.apply_vote("arb-2", true, 10, 51, now()).unwrap();
        vote.apply_vote("arb-3", false, 10, 51, now()).unwrap();
        vote.apply_vote("arb-4", false, 10, 51, now()).unwrap();
        assert!(!vote.resolved);

        // Quorum still reachable while enough arbitrators remain
        assert!(!vote.quorum_unreachable(10, 51));
        // All removed: provably unreachable, escape allowed
        assert!(vote.quorum_unreachable(0, 51));

        vote.resolve_by_escape(true, now());
        assert!(vote.resolved);
        assert_eq!(vote.seller_wins, Some(true));
    }

    #[test]
    fn test_nft_recipient() {
        assert_eq!(
            nft_recipient(ReleaseCause::MutualConfirmation, "s", "b"),
            "b"
        );
        assert_eq!(nft_recipient(ReleaseCause::DisputeSellerWins, "s", "b"), "b");
        assert_eq!(nft_recipient(ReleaseCause::DisputeBuyerWins, "s", "b"), "s");
    }
}
