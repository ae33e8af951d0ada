use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::{
    classify, CanonicalStatus, ChainSide, Classification, DiscrepancyType, MirrorSide,
    ReconciliationLog, ReconciliationSummary, RunType, SummaryStatus,
};
use crate::config::{Config, MAX_RECONCILIATION_BATCH};
use crate::error::{AppResult, ReconciliationError};
use crate::escrow::models::Escrow;
use crate::escrow::repository::EscrowRepository;
use crate::ledger::encoding::invoice_key;
use crate::ledger::LedgerClient;

/// Batched diff of ledger state against the mirror for every
/// escrow-bearing invoice. Individual invoice failures become `error`
/// rows and the run continues; only engine-level faults fail the run.
#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: PgPool,
    ledger: Arc<dyn LedgerClient>,
    escrows: Arc<EscrowRepository>,
    default_batch_size: u32,
}

/// Running tallies folded into the summary at completion
#[derive(Debug, Default)]
struct RunCounts {
    total: i32,
    matched: i32,
    discrepancy: i32,
    missing_chain: i32,
    missing_db: i32,
    total_abs_discrepancy: BigInt,
}

impl RunCounts {
    fn absorb(&mut self, classification: &Classification) {
        self.total += 1;
        match classification.discrepancy_type {
            DiscrepancyType::None => self.matched += 1,
            DiscrepancyType::MissingChain => self.missing_chain += 1,
            DiscrepancyType::MissingDb => self.missing_db += 1,
            DiscrepancyType::AmountMismatch
            | DiscrepancyType::StatusMismatch
            | DiscrepancyType::Error => self.discrepancy += 1,
        }
        if let Some(diff) = &classification.discrepancy_amount {
            // The summary aggregates absolute values; the signed
            // per-row diff stays on the log row
            self.total_abs_discrepancy += diff.abs();
        }
    }
}

impl ReconciliationEngine {
    pub fn new(
        pool: PgPool,
        ledger: Arc<dyn LedgerClient>,
        escrows: Arc<EscrowRepository>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            ledger,
            escrows,
            default_batch_size: config.reconciliation_batch_size,
        }
    }

    /// Start a run. The `running` summary row is inserted synchronously
    /// and its id returned; the batch loop continues in the background.
    pub async fn run(&self, run_type: RunType, batch_size: Option<u32>) -> AppResult<Uuid> {
        let batch_size = batch_size.unwrap_or(self.default_batch_size);
        if batch_size == 0 || batch_size > MAX_RECONCILIATION_BATCH {
            return Err(
                ReconciliationError::BatchTooLarge(batch_size, MAX_RECONCILIATION_BATCH).into(),
            );
        }

        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO reconciliation_summaries (
                run_id, run_type, total_count, matched_count,
                discrepancy_count, missing_chain_count, missing_db_count,
                total_discrepancy_amount, started_at, status
            )
            VALUES ($1, $2, 0, 0, 0, 0, 0, '0', NOW(), 'running')
            "#,
        )
        .bind(run_id)
        .bind(run_type)
        .execute(&self.pool)
        .await?;

        info!(run_id = %run_id, run_type = ?run_type, batch_size, "🔍 Reconciliation run started");

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run_batches(run_id, batch_size as i64).await {
                Ok(counts) => {
                    if let Err(e) = engine.finish_run(run_id, &counts, None).await {
                        error!(run_id = %run_id, "Failed to finalize reconciliation run: {e}");
                    }
                }
                Err(e) => {
                    error!(run_id = %run_id, "Reconciliation run failed: {e}");
                    let counts = RunCounts::default();
                    if let Err(e) = engine.finish_run(run_id, &counts, Some(&e.to_string())).await {
                        error!(run_id = %run_id, "Failed to mark reconciliation run failed: {e}");
                    }
                }
            }
        });

        Ok(run_id)
    }

    async fn run_batches(&self, run_id: Uuid, batch_size: i64) -> AppResult<RunCounts> {
        let mut counts = RunCounts::default();
        let mut offset = 0i64;

        loop {
            let page = self.escrows.page(batch_size, offset).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len() as i64;

            for escrow in &page {
                let classification = self.reconcile_invoice(run_id, escrow).await;
                counts.absorb(&classification);
            }

            offset += page_len;
            if page_len < batch_size {
                break;
            }
        }

        // Chain-present / mirror-absent rows: invoice ids already seen in
        // ledger events with no mirror row behind them
        let orphans: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT pe.invoice_id
            FROM processed_events pe
            WHERE NOT EXISTS (SELECT 1 FROM escrows e WHERE e.invoice_id = pe.invoice_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for (invoice_id,) in orphans {
            let classification = self.reconcile_orphan(run_id, invoice_id).await;
            if let Some(classification) = classification {
                counts.absorb(&classification);
            }
        }

        Ok(counts)
    }

    /// Diff one mirrored invoice against the ledger and persist the log
    /// row. Errors classify as `error` and never abort the run.
    async fn reconcile_invoice(&self, run_id: Uuid, escrow: &Escrow) -> Classification {
        let chain_result = self.ledger.read_escrow(invoice_key(escrow.invoice_id)).await;

        let mirror_side = MirrorSide {
            status: CanonicalStatus::from_mirror(escrow.status.as_str()),
            amount: escrow.amount.clone(),
            seller: escrow.seller.clone(),
            buyer: escrow.buyer.clone(),
        };

        let (classification, chain_side) = match chain_result {
            Ok(record) => {
                let chain_side = record.filter(|r| !r.is_absent()).map(|r| ChainSide {
                    status: CanonicalStatus::from_ledger(r.status),
                    amount: r.amount,
                    seller: r.seller,
                    buyer: r.buyer,
                });
                (classify(chain_side.as_ref(), Some(&mirror_side)), chain_side)
            }
            Err(e) => {
                warn!(invoice_id = %escrow.invoice_id, "Ledger read failed during reconciliation: {e}");
                (
                    Classification {
                        discrepancy_type: DiscrepancyType::Error,
                        discrepancy_amount: None,
                        notes: vec![format!("Ledger read error: {e}")],
                    },
                    None,
                )
            }
        };

        if let Err(e) = self
            .insert_log(
                run_id,
                escrow.invoice_id,
                &classification,
                chain_side.as_ref(),
                Some(&mirror_side),
            )
            .await
        {
            error!(invoice_id = %escrow.invoice_id, "Failed to persist reconciliation log: {e}");
        }
        classification
    }

    /// A chain-side check for an invoice the mirror has no row for.
    /// Absent on both sides produces nothing.
    async fn reconcile_orphan(&self, run_id: Uuid, invoice_id: Uuid) -> Option<Classification> {
        let chain_side = match self.ledger.read_escrow(invoice_key(invoice_id)).await {
            Ok(record) => record.filter(|r| !r.is_absent()).map(|r| ChainSide {
                status: CanonicalStatus::from_ledger(r.status),
                amount: r.amount,
                seller: r.seller,
                buyer: r.buyer,
            }),
            Err(e) => {
                warn!(invoice_id = %invoice_id, "Ledger read failed for orphan check: {e}");
                let classification = Classification {
                    discrepancy_type: DiscrepancyType::Error,
                    discrepancy_amount: None,
                    notes: vec![format!("Ledger read error: {e}")],
                };
                if let Err(e) = self
                    .insert_log(run_id, invoice_id, &classification, None, None)
                    .await
                {
                    error!(invoice_id = %invoice_id, "Failed to persist reconciliation log: {e}");
                }
                return Some(classification);
            }
        };

        let chain_side = chain_side?;
        let classification = classify(Some(&chain_side), None);
        if let Err(e) = self
            .insert_log(run_id, invoice_id, &classification, Some(&chain_side), None)
            .await
        {
            error!(invoice_id = %invoice_id, "Failed to persist reconciliation log: {e}");
        }
        Some(classification)
    }

    async fn insert_log(
        &self,
        run_id: Uuid,
        invoice_id: Uuid,
        classification: &Classification,
        chain: Option<&ChainSide>,
        db: Option<&MirrorSide>,
    ) -> AppResult<()> {
        let notes = if classification.notes.is_empty() {
            None
        } else {
            Some(classification.notes.join("; "))
        };

        sqlx::query(
            r#"
            INSERT INTO reconciliation_logs (
                id, run_id, invoice_id, chain_status, db_status,
                chain_amount, db_amount, discrepancy_amount,
                discrepancy_type, chain_seller, chain_buyer,
                db_seller, db_buyer, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(invoice_id)
        .bind(chain.map(|c| c.status.as_str()).unwrap_or("not_found"))
        .bind(db.map(|d| d.status.as_str()).unwrap_or("not_found"))
        .bind(chain.map(|c| c.amount.to_string()))
        .bind(db.map(|d| d.amount.to_string()))
        .bind(
            classification
                .discrepancy_amount
                .as_ref()
                .map(|d| d.to_string()),
        )
        .bind(classification.discrepancy_type)
        .bind(chain.map(|c| c.seller.clone()))
        .bind(chain.map(|c| c.buyer.clone()))
        .bind(db.map(|d| d.seller.clone()))
        .bind(db.map(|d| d.buyer.clone()))
        .bind(notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        counts: &RunCounts,
        error_message: Option<&str>,
    ) -> AppResult<()> {
        let status = if error_message.is_some() {
            SummaryStatus::Failed
        } else {
            SummaryStatus::Completed
        };

        sqlx::query(
            r#"
            UPDATE reconciliation_summaries
            SET total_count = $2, matched_count = $3, discrepancy_count = $4,
                missing_chain_count = $5, missing_db_count = $6,
                total_discrepancy_amount = $7, completed_at = NOW(),
                status = $8, error_message = $9
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(counts.total)
        .bind(counts.matched)
        .bind(counts.discrepancy)
        .bind(counts.missing_chain)
        .bind(counts.missing_db)
        .bind(counts.total_abs_discrepancy.to_string())
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if error_message.is_none() {
            info!(
                run_id = %run_id,
                total = counts.total,
                matched = counts.matched,
                discrepancies = counts.discrepancy,
                missing_chain = counts.missing_chain,
                missing_db = counts.missing_db,
                "✓ Reconciliation run completed"
            );
            if !counts.total_abs_discrepancy.is_zero() {
                warn!(
                    run_id = %run_id,
                    total_discrepancy = %counts.total_abs_discrepancy,
                    "⚠️  Reconciliation found value discrepancies"
                );
            }
        }
        Ok(())
    }

    // ========== QUERIES ==========

    /// Most recent run summary
    pub async fn status(&self) -> AppResult<Option<ReconciliationSummary>> {
        let summary = sqlx::query_as::<_, ReconciliationSummary>(
            r#"
            SELECT run_id, run_type, total_count, matched_count,
                   discrepancy_count, missing_chain_count, missing_db_count,
                   total_discrepancy_amount, started_at, completed_at,
                   status, error_message
            FROM reconciliation_summaries
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(summary)
    }

    pub async fn summary(&self, run_id: Uuid) -> AppResult<ReconciliationSummary> {
        let summary = sqlx::query_as::<_, ReconciliationSummary>(
            r#"
            SELECT run_id, run_type, total_count, matched_count,
                   discrepancy_count, missing_chain_count, missing_db_count,
                   total_discrepancy_amount, started_at, completed_at,
                   status, error_message
            FROM reconciliation_summaries
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        summary.ok_or_else(|| ReconciliationError::RunNotFound(run_id).into())
    }

    /// Page through non-clean log rows, optionally filtered by type
    pub async fn discrepancies(
        &self,
        discrepancy_type: Option<DiscrepancyType>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<ReconciliationLog>> {
        let logs = sqlx::query_as::<_, ReconciliationLog>(
            r#"
            SELECT id, run_id, invoice_id, chain_status, db_status,
                   chain_amount, db_amount, discrepancy_amount,
                   discrepancy_type, chain_seller, chain_buyer,
                   db_seller, db_buyer, notes, created_at
            FROM reconciliation_logs
            WHERE discrepancy_type != 'none'
              AND ($1::discrepancy_type IS NULL OR discrepancy_type = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(discrepancy_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    /// Page through run summaries, newest first
    pub async fn history(&self, limit: i64, offset: i64) -> AppResult<Vec<ReconciliationSummary>> {
        let summaries = sqlx::query_as::<_, ReconciliationSummary>(
            r#"
            SELECT run_id, run_type, total_count, matched_count,
                   discrepancy_count, missing_chain_count, missing_db_count,
                   total_discrepancy_amount, started_at, completed_at,
                   status, error_message
            FROM reconciliation_summaries
            ORDER BY started_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(summaries)
    }
}
