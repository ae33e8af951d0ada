use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::models::{
    validate_status_transition, DisputeVote, Escrow, EscrowStatus, MultiSigApproval,
};
use crate::error::{AppResult, EscrowError};

/// Persistence for the escrow mirror. Per-invoice writes serialize on a
/// row lock so API-driven sagas and event-driven updates cannot split-
/// brain the mirror.
pub struct EscrowRepository {
    pub pool: PgPool,
}

const ESCROW_COLUMNS: &str = r#"
    invoice_id, seller, buyer, amount, token, status,
    seller_confirmed, buyer_confirmed, dispute_raised,
    fee_amount, discount_rate_bps, discount_deadline,
    rwa_nft_contract, rwa_token_id, release_tx_hash, released_to,
    created_at, expires_at, updated_at
"#;

impl EscrowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ========== MIRROR ROWS ==========

    pub async fn insert(&self, escrow: &Escrow) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrows (
                invoice_id, seller, buyer, amount, token, status,
                seller_confirmed, buyer_confirmed, dispute_raised,
                fee_amount, discount_rate_bps, discount_deadline,
                rwa_nft_contract, rwa_token_id, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(escrow.invoice_id)
        .bind(&escrow.seller)
        .bind(&escrow.buyer)
        .bind(escrow.amount.to_string())
        .bind(&escrow.token)
        .bind(escrow.status)
        .bind(escrow.seller_confirmed)
        .bind(escrow.buyer_confirmed)
        .bind(escrow.dispute_raised)
        .bind(escrow.fee_amount.to_string())
        .bind(escrow.discount_rate_bps)
        .bind(escrow.discount_deadline)
        .bind(&escrow.rwa_nft_contract)
        .bind(&escrow.rwa_token_id)
        .bind(escrow.created_at)
        .bind(escrow.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn exists(&self, invoice_id: Uuid) -> AppResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM escrows WHERE invoice_id = $1)")
                .bind(invoice_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub async fn get(&self, invoice_id: Uuid) -> AppResult<Option<Escrow>> {
        let row = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrows WHERE invoice_id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Escrow::from_row(&r)).transpose()
    }

    pub async fn get_required(&self, invoice_id: Uuid) -> AppResult<Escrow> {
        self.get(invoice_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(invoice_id).into())
    }

    /// Row-locked read; the serialization point for per-invoice writes
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> AppResult<Escrow> {
        let row = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrows WHERE invoice_id = $1 FOR UPDATE"
        ))
        .bind(invoice_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|r| Escrow::from_row(&r))
            .transpose()?
            .ok_or_else(|| EscrowError::NotFound(invoice_id).into())
    }

    /// Status-guarded transition inside a caller-owned transaction
    pub async fn update_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
    ) -> AppResult<()> {
        validate_status_transition(invoice_id, from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE escrows
            SET status = $3, updated_at = NOW()
            WHERE invoice_id = $1 AND status = $2
            "#,
        )
        .bind(invoice_id)
        .bind(from)
        .bind(to)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: "changed concurrently".to_string(),
                expected: from.as_str().to_string(),
            }
            .into());
        }
        debug!(invoice_id = %invoice_id, from = from.as_str(), to = to.as_str(), "Escrow status updated");
        Ok(())
    }

    /// Funding: the payable (after any discount) becomes the
    /// authoritative amount.
    pub async fn record_deposit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
        payable: &BigInt,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET status = 'funded', amount = $2, updated_at = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(payable.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_confirmation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
        seller_side: bool,
    ) -> AppResult<()> {
        let column = if seller_side {
            "seller_confirmed"
        } else {
            "buyer_confirmed"
        };
        sqlx::query(&format!(
            "UPDATE escrows SET {column} = TRUE, updated_at = NOW() WHERE invoice_id = $1"
        ))
        .bind(invoice_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_disputed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET status = 'disputed', dispute_raised = TRUE, updated_at = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_expired(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET status = 'expired', updated_at = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Terminal release on the mirror. Idempotent so retry handlers can
    /// re-apply it; the ledger deletes released escrows, the mirror keeps
    /// the row.
    pub async fn mark_released(
        &self,
        invoice_id: Uuid,
        winner: &str,
        tx_hash: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET status = 'released',
                released_to = $2,
                release_tx_hash = COALESCE($3, release_tx_hash),
                updated_at = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(winner)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Financing funds the escrow without a buyer deposit; idempotent on
    /// the status guard.
    pub async fn record_financing(
        &self,
        invoice_id: Uuid,
        funder: &str,
        amount: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET status = 'funded', updated_at = NOW()
            WHERE invoice_id = $1 AND status = 'created'
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;

        self.record_audit(
            "invoice_financed",
            Some(invoice_id),
            serde_json::json!({ "funder": funder, "amount": amount }),
        )
        .await
    }

    /// Attach minted RWA collateral to the mirror; idempotent
    pub async fn record_collateral(
        &self,
        invoice_id: Uuid,
        token_id: &str,
        face_value: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET rwa_token_id = $2, updated_at = NOW()
            WHERE invoice_id = $1 AND (rwa_token_id IS NULL OR rwa_token_id = $2)
            "#,
        )
        .bind(invoice_id)
        .bind(token_id)
        .execute(&self.pool)
        .await?;

        self.record_audit(
            "invoice_tokenized",
            Some(invoice_id),
            serde_json::json!({ "token_id": token_id, "face_value": face_value }),
        )
        .await
    }

    /// Page through the mirror for reconciliation
    pub async fn page(&self, limit: i64, offset: i64) -> AppResult<Vec<Escrow>> {
        let rows = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrows ORDER BY created_at ASC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Escrow::from_row).collect()
    }

    pub async fn count(&self) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM escrows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========== MULTI-SIG APPROVALS ==========

    pub async fn init_multisig(&self, invoice_id: Uuid, required: u32) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_multisig (invoice_id, approvers, required)
            VALUES ($1, '{}', $2)
            ON CONFLICT (invoice_id) DO NOTHING
            "#,
        )
        .bind(invoice_id)
        .bind(required as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_multisig(&self, invoice_id: Uuid) -> AppResult<Option<MultiSigApproval>> {
        let approval = sqlx::query_as::<_, MultiSigApproval>(
            r#"
            SELECT invoice_id, approvers, required, created_at, updated_at
            FROM escrow_multisig
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(approval)
    }

    /// Append an approver (once) and return the updated set
    pub async fn add_approver(
        &self,
        invoice_id: Uuid,
        approver: &str,
    ) -> AppResult<MultiSigApproval> {
        let approval = sqlx::query_as::<_, MultiSigApproval>(
            r#"
            UPDATE escrow_multisig
            SET approvers = CASE
                    WHEN approvers @> ARRAY[$2] THEN approvers
                    ELSE array_append(approvers, $2)
                END,
                updated_at = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, approvers, required, created_at, updated_at
            "#,
        )
        .bind(invoice_id)
        .bind(approver)
        .fetch_optional(&self.pool)
        .await?;

        approval.ok_or_else(|| EscrowError::NotFound(invoice_id).into())
    }

    // ========== ARBITRATORS ==========

    pub async fn add_arbitrator(&self, address: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO arbitrators (address, active)
            VALUES ($1, TRUE)
            ON CONFLICT (address) DO UPDATE SET active = TRUE
            "#,
        )
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_arbitrator(&self, address: &str) -> AppResult<()> {
        sqlx::query("UPDATE arbitrators SET active = FALSE WHERE address = $1")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn arbitrator_count(&self) -> AppResult<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM arbitrators WHERE active = TRUE")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }

    pub async fn is_arbitrator(&self, address: &str) -> AppResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM arbitrators WHERE LOWER(address) = LOWER($1) AND active = TRUE)",
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    // ========== DISPUTE VOTES ==========

    pub async fn insert_dispute(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        vote: &DisputeVote,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dispute_votes (
                invoice_id, snapshot_arbitrator_count, votes_for_buyer,
                votes_for_seller, voted, resolved, opened_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(vote.invoice_id)
        .bind(vote.snapshot_arbitrator_count)
        .bind(vote.votes_for_buyer)
        .bind(vote.votes_for_seller)
        .bind(&vote.voted)
        .bind(vote.resolved)
        .bind(vote.opened_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_dispute(&self, invoice_id: Uuid) -> AppResult<Option<DisputeVote>> {
        let vote = sqlx::query_as::<_, DisputeVote>(
            r#"
            SELECT invoice_id, snapshot_arbitrator_count, votes_for_buyer,
                   votes_for_seller, voted, resolved, seller_wins,
                   opened_at, resolved_at
            FROM dispute_votes
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(vote)
    }

    pub async fn get_dispute_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> AppResult<DisputeVote> {
        let vote = sqlx::query_as::<_, DisputeVote>(
            r#"
            SELECT invoice_id, snapshot_arbitrator_count, votes_for_buyer,
                   votes_for_seller, voted, resolved, seller_wins,
                   opened_at, resolved_at
            FROM dispute_votes
            WHERE invoice_id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut **tx)
        .await?;

        vote.ok_or_else(|| EscrowError::NoDispute(invoice_id).into())
    }

    pub async fn save_dispute(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        vote: &DisputeVote,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE dispute_votes
            SET snapshot_arbitrator_count = $2, votes_for_buyer = $3,
                votes_for_seller = $4, voted = $5, resolved = $6,
                seller_wins = $7, resolved_at = $8
            WHERE invoice_id = $1
            "#,
        )
        .bind(vote.invoice_id)
        .bind(vote.snapshot_arbitrator_count)
        .bind(vote.votes_for_buyer)
        .bind(vote.votes_for_seller)
        .bind(&vote.voted)
        .bind(vote.resolved)
        .bind(vote.seller_wins)
        .bind(vote.resolved_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ========== AUDIT LOG ==========

    pub async fn record_audit(
        &self,
        event_type: &str,
        invoice_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (event_type, invoice_id, details)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(event_type)
        .bind(invoice_id)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Timestamps for a freshly created mirror row
pub fn escrow_window(now: DateTime<Utc>, duration_seconds: u64) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        now,
        now + chrono::Duration::seconds(duration_seconds as i64),
    )
}
