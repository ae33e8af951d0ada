use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::handlers::HandlerRegistry;
use super::models::{backoff_delay, CompensationAction, DlqEntry, RecoveryEntry};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::saga::{steps, OperationType, SagaManager, SagaState, SagaUpdate};

/// Whether a failed saga left externally visible side effects that an
/// idempotent retry cannot undo. Those promotions carry a pending
/// compensation action for an operator.
pub fn requires_compensation(operation_type: OperationType, steps_completed: &[String]) -> bool {
    match operation_type {
        OperationType::EscrowRelease => {
            steps_completed.iter().any(|s| s == steps::BLOCKCHAIN_TX)
        }
        OperationType::FinancingPipeline => steps_completed
            .iter()
            .any(|s| s == steps::LIQUIDITY_TRANSFER),
        _ => false,
    }
}

/// The operator-facing reversal recorded for a compensatable failure
pub fn compensation_action_type(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::EscrowRelease => "refund_escrow",
        OperationType::FinancingPipeline => "reverse_liquidity_transfer",
        _ => "manual_review",
    }
}

/// Outcome of one recovery tick
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub promoted: usize,
}

/// Durable retry queue with exponential backoff, DLQ promotion and the
/// operator-driven compensation executor.
pub struct RecoveryPipeline {
    pool: PgPool,
    sagas: Arc<SagaManager>,
    registry: Arc<HandlerRegistry>,
    max_retries: u32,
    backoff_cap_minutes: u32,
    batch_size: u32,
}

impl RecoveryPipeline {
    pub fn new(
        pool: PgPool,
        sagas: Arc<SagaManager>,
        registry: Arc<HandlerRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            sagas,
            registry,
            max_retries: config.recovery_max_retries,
            backoff_cap_minutes: config.recovery_backoff_cap_minutes,
            batch_size: config.recovery_batch_size,
        }
    }

    /// Upsert a retryable failure. Repeated failures for the same saga
    /// replace the row, so there is at most one queue entry per
    /// correlation id.
    pub async fn enqueue(
        &self,
        correlation_id: Uuid,
        operation_type: OperationType,
        operation_data: serde_json::Value,
        retry_count: u32,
        last_error: &str,
    ) -> AppResult<()> {
        let next_retry_at = Utc::now() + backoff_delay(retry_count, self.backoff_cap_minutes);

        sqlx::query(
            r#"
            INSERT INTO recovery_queue (
                correlation_id, operation_type, operation_data,
                retry_count, max_retries, next_retry_at, last_error, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (correlation_id) DO UPDATE SET
                operation_data = EXCLUDED.operation_data,
                retry_count = EXCLUDED.retry_count,
                next_retry_at = EXCLUDED.next_retry_at,
                last_error = EXCLUDED.last_error,
                status = 'pending',
                updated_at = NOW()
            "#,
        )
        .bind(correlation_id)
        .bind(operation_type)
        .bind(&operation_data)
        .bind(retry_count as i32)
        .bind(self.max_retries as i32)
        .bind(next_retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        info!(
            correlation_id = %correlation_id,
            operation = %operation_type,
            retry_count,
            next_retry_at = %next_retry_at,
            "Recovery entry enqueued"
        );
        Ok(())
    }

    /// Move a terminally failed operation to the DLQ: insert the DLQ row,
    /// advance the saga to `dlq`, drop the recovery entry, and record the
    /// pending compensation action when one is required. One transaction.
    pub async fn promote_to_dlq(
        &self,
        correlation_id: Uuid,
        operation_type: OperationType,
        operation_data: serde_json::Value,
        failure_reason: &str,
        retry_count: u32,
        needs_compensation: bool,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (
                id, correlation_id, operation_type, operation_data,
                failure_reason, retry_count, requires_compensation,
                compensation_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(correlation_id)
        .bind(operation_type)
        .bind(&operation_data)
        .bind(failure_reason)
        .bind(retry_count as i32)
        .bind(needs_compensation)
        .execute(&mut *tx)
        .await?;

        if needs_compensation {
            sqlx::query(
                r#"
                INSERT INTO compensation_actions (id, correlation_id, action_type, action_data, status)
                VALUES ($1, $2, $3, $4, 'pending')
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(correlation_id)
            .bind(compensation_action_type(operation_type))
            .bind(&operation_data)
            .execute(&mut *tx)
            .await?;
        }

        self.sagas
            .advance_tx(&mut tx, correlation_id, SagaState::Dlq, &SagaUpdate::default())
            .await?;

        sqlx::query("DELETE FROM recovery_queue WHERE correlation_id = $1")
            .bind(correlation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        warn!(
            correlation_id = %correlation_id,
            operation = %operation_type,
            retry_count,
            needs_compensation,
            "⚠️  Operation promoted to DLQ: {failure_reason}"
        );
        Ok(())
    }

    /// One worker tick: claim due entries, re-execute each through the
    /// handler registry, and settle the outcome.
    pub async fn tick(&self) -> AppResult<TickSummary> {
        let due = sqlx::query_as::<_, RecoveryEntry>(
            r#"
            SELECT correlation_id, operation_type, operation_data,
                   retry_count, max_retries, next_retry_at, last_error,
                   status, created_at, updated_at
            FROM recovery_queue
            WHERE status = 'pending' AND next_retry_at <= NOW()
            ORDER BY next_retry_at ASC
            LIMIT $1
            "#,
        )
        .bind(self.batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = TickSummary::default();

        for entry in due {
            // Pessimistic claim; a concurrent worker loses the race here
            let claimed = sqlx::query(
                r#"
                UPDATE recovery_queue
                SET status = 'processing', updated_at = NOW()
                WHERE correlation_id = $1 AND status = 'pending'
                "#,
            )
            .bind(entry.correlation_id)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }
            summary.claimed += 1;

            match self.process_entry(&entry).await {
                Ok(()) => summary.succeeded += 1,
                Err(Outcome::Retried) => summary.failed += 1,
                Err(Outcome::Promoted) => {
                    summary.failed += 1;
                    summary.promoted += 1;
                }
                Err(Outcome::Abandoned) => summary.failed += 1,
            }
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                promoted = summary.promoted,
                "Recovery tick completed"
            );
        }
        Ok(summary)
    }

    async fn process_entry(&self, entry: &RecoveryEntry) -> Result<(), Outcome> {
        let correlation_id = entry.correlation_id;

        if let Err(e) = self
            .sagas
            .advance(correlation_id, SagaState::Processing, SagaUpdate::default())
            .await
        {
            error!(correlation_id = %correlation_id, "Cannot re-drive saga: {e}");
            let _ = self.mark_recovery_failed(correlation_id, &e.to_string()).await;
            return Err(Outcome::Abandoned);
        }

        let saga = match self.sagas.read(correlation_id).await {
            Ok(saga) => saga,
            Err(e) => {
                error!(correlation_id = %correlation_id, "Saga vanished mid-tick: {e}");
                let _ = self.mark_recovery_failed(correlation_id, &e.to_string()).await;
                return Err(Outcome::Abandoned);
            }
        };

        match self.registry.execute(&saga, &entry.operation_data).await {
            Ok(()) => {
                if let Err(e) = self.settle_success(correlation_id).await {
                    error!(correlation_id = %correlation_id, "Failed to settle successful retry: {e}");
                    return Err(Outcome::Abandoned);
                }
                info!(correlation_id = %correlation_id, "✓ Recovery retry succeeded");
                Ok(())
            }
            Err(e) => self.settle_failure(entry, e).await,
        }
    }

    async fn settle_success(&self, correlation_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM recovery_queue WHERE correlation_id = $1")
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;

        self.sagas
            .advance(
                correlation_id,
                SagaState::Completed,
                SagaUpdate {
                    steps_remaining: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await
    }

    async fn settle_failure(&self, entry: &RecoveryEntry, failure: AppError) -> Result<(), Outcome> {
        let correlation_id = entry.correlation_id;
        let reason = failure.to_string();
        let new_retry_count = entry.retry_count as u32 + 1;

        if let Err(e) = self
            .sagas
            .advance(correlation_id, SagaState::Failed, SagaUpdate::default())
            .await
        {
            error!(correlation_id = %correlation_id, "Failed to mark saga failed: {e}");
            return Err(Outcome::Abandoned);
        }

        // Consult the durable step log for the compensation decision
        let steps_completed = match self.sagas.read(correlation_id).await {
            Ok(saga) => saga.steps_completed,
            Err(_) => Vec::new(),
        };
        let needs_compensation =
            requires_compensation(entry.operation_type, &steps_completed);

        let terminal = !failure.is_retryable() || new_retry_count >= entry.max_retries as u32;

        if terminal {
            if !failure.is_retryable() && !needs_compensation {
                // Permanent failure with nothing to undo: park it as
                // failed without occupying the DLQ
                warn!(
                    correlation_id = %correlation_id,
                    "Permanent failure, no compensation required: {reason}"
                );
                let _ = self.mark_recovery_failed(correlation_id, &reason).await;
                return Err(Outcome::Abandoned);
            }

            match self
                .promote_to_dlq(
                    correlation_id,
                    entry.operation_type,
                    entry.operation_data.clone(),
                    &reason,
                    new_retry_count,
                    needs_compensation,
                )
                .await
            {
                Ok(()) => Err(Outcome::Promoted),
                Err(e) => {
                    error!(correlation_id = %correlation_id, "DLQ promotion failed: {e}");
                    Err(Outcome::Abandoned)
                }
            }
        } else {
            match self
                .enqueue(
                    correlation_id,
                    entry.operation_type,
                    entry.operation_data.clone(),
                    new_retry_count,
                    &reason,
                )
                .await
            {
                Ok(()) => {
                    warn!(
                        correlation_id = %correlation_id,
                        retry_count = new_retry_count,
                        "Retry failed, re-enqueued: {reason}"
                    );
                    Err(Outcome::Retried)
                }
                Err(e) => {
                    error!(correlation_id = %correlation_id, "Re-enqueue failed: {e}");
                    Err(Outcome::Abandoned)
                }
            }
        }
    }

    async fn mark_recovery_failed(&self, correlation_id: Uuid, reason: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE recovery_queue
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========== DLQ ADMIN ==========

    pub async fn unresolved_dlq(&self, limit: i64, offset: i64) -> AppResult<Vec<DlqEntry>> {
        let entries = sqlx::query_as::<_, DlqEntry>(
            r#"
            SELECT id, correlation_id, operation_type, operation_data,
                   failure_reason, retry_count, requires_compensation,
                   compensation_status, resolved_at, resolved_by,
                   resolution_notes, created_at
            FROM dead_letter_queue
            WHERE resolved_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Operator sign-off on a DLQ entry
    pub async fn resolve_dlq(
        &self,
        correlation_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET resolved_at = NOW(), resolved_by = $2, resolution_notes = $3
            WHERE correlation_id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(correlation_id)
        .bind(resolved_by)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "No unresolved DLQ entry for {correlation_id}"
            )));
        }
        info!(correlation_id = %correlation_id, resolved_by, "DLQ entry resolved");
        Ok(())
    }

    pub async fn dlq_depth(&self) -> AppResult<i64> {
        let (depth,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM dead_letter_queue WHERE resolved_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }

    /// (pending, processing) recovery queue depths
    pub async fn queue_depths(&self) -> AppResult<(i64, i64)> {
        let (pending, processing): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'pending'),
                   COUNT(*) FILTER (WHERE status = 'processing')
            FROM recovery_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((pending, processing))
    }

    pub async fn pending_entry(&self, correlation_id: Uuid) -> AppResult<Option<RecoveryEntry>> {
        let entry = sqlx::query_as::<_, RecoveryEntry>(
            r#"
            SELECT correlation_id, operation_type, operation_data,
                   retry_count, max_retries, next_retry_at, last_error,
                   status, created_at, updated_at
            FROM recovery_queue
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    // ========== COMPENSATION EXECUTOR (operator-driven) ==========

    pub async fn compensation_actions(
        &self,
        correlation_id: Uuid,
    ) -> AppResult<Vec<CompensationAction>> {
        let actions = sqlx::query_as::<_, CompensationAction>(
            r#"
            SELECT id, correlation_id, action_type, action_data, status,
                   result, created_at, executed_at
            FROM compensation_actions
            WHERE correlation_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actions)
    }

    pub async fn pending_compensations(&self, limit: i64) -> AppResult<Vec<CompensationAction>> {
        let actions = sqlx::query_as::<_, CompensationAction>(
            r#"
            SELECT id, correlation_id, action_type, action_data, status,
                   result, created_at, executed_at
            FROM compensation_actions
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(actions)
    }

    /// Operator claims a pending compensation. The saga moves to
    /// `compensating`; the DLQ row tracks progress.
    pub async fn start_compensation(&self, action_id: Uuid) -> AppResult<CompensationAction> {
        let mut tx = self.pool.begin().await?;

        let action = sqlx::query_as::<_, CompensationAction>(
            r#"
            UPDATE compensation_actions
            SET status = 'in_progress'
            WHERE id = $1 AND status = 'pending'
            RETURNING id, correlation_id, action_type, action_data, status,
                      result, created_at, executed_at
            "#,
        )
        .bind(action_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No pending compensation {action_id}")))?;

        sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET compensation_status = 'in_progress'
            WHERE correlation_id = $1
            "#,
        )
        .bind(action.correlation_id)
        .execute(&mut *tx)
        .await?;

        self.sagas
            .advance_tx(
                &mut tx,
                action.correlation_id,
                SagaState::Compensating,
                &SagaUpdate::default(),
            )
            .await?;

        tx.commit().await?;
        info!(
            correlation_id = %action.correlation_id,
            action = %action.action_type,
            "Compensation started"
        );
        Ok(action)
    }

    pub async fn complete_compensation(
        &self,
        action_id: Uuid,
        result: serde_json::Value,
    ) -> AppResult<()> {
        self.finish_compensation(action_id, result, true).await
    }

    pub async fn fail_compensation(
        &self,
        action_id: Uuid,
        result: serde_json::Value,
    ) -> AppResult<()> {
        self.finish_compensation(action_id, result, false).await
    }

    async fn finish_compensation(
        &self,
        action_id: Uuid,
        result: serde_json::Value,
        success: bool,
    ) -> AppResult<()> {
        let (action_status, saga_state) = if success {
            ("completed", SagaState::Compensated)
        } else {
            ("failed", SagaState::Failed)
        };

        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE compensation_actions
            SET status = $2::compensation_status, result = $3, executed_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            RETURNING correlation_id
            "#,
        )
        .bind(action_id)
        .bind(action_status)
        .bind(&result)
        .fetch_optional(&mut *tx)
        .await?;

        let (correlation_id,) = row.ok_or_else(|| {
            AppError::NotFound(format!("No in-progress compensation {action_id}"))
        })?;

        sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET compensation_status = $2::compensation_status
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .bind(action_status)
        .execute(&mut *tx)
        .await?;

        self.sagas
            .advance_tx(&mut tx, correlation_id, saga_state, &SagaUpdate::default())
            .await?;

        tx.commit().await?;
        info!(
            correlation_id = %correlation_id,
            success,
            "Compensation finished"
        );
        Ok(())
    }
}

/// Internal settle outcome for tick accounting
enum Outcome {
    Retried,
    Promoted,
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_with_committed_tx_requires_compensation() {
        let completed = vec![steps::BLOCKCHAIN_TX.to_string()];
        assert!(requires_compensation(
            OperationType::EscrowRelease,
            &completed
        ));
    }

    #[test]
    fn test_release_before_tx_retries_cleanly() {
        assert!(!requires_compensation(OperationType::EscrowRelease, &[]));
        let only_db = vec![steps::DB_UPDATE.to_string()];
        assert!(!requires_compensation(
            OperationType::EscrowRelease,
            &only_db
        ));
    }

    #[test]
    fn test_financing_after_liquidity_moved_requires_compensation() {
        let completed = vec![steps::LIQUIDITY_TRANSFER.to_string()];
        assert!(requires_compensation(
            OperationType::FinancingPipeline,
            &completed
        ));
        assert!(!requires_compensation(OperationType::FinancingPipeline, &[]));
    }

    #[test]
    fn test_event_processing_never_compensates() {
        let completed = vec![
            steps::BLOCKCHAIN_TX.to_string(),
            steps::EVENT_MIRROR.to_string(),
        ];
        assert!(!requires_compensation(
            OperationType::EventProcessing,
            &completed
        ));
    }

    #[test]
    fn test_action_types() {
        assert_eq!(
            compensation_action_type(OperationType::EscrowRelease),
            "refund_escrow"
        );
        assert_eq!(
            compensation_action_type(OperationType::FinancingPipeline),
            "reverse_liquidity_transfer"
        );
        assert_eq!(
            compensation_action_type(OperationType::Tokenization),
            "manual_review"
        );
    }
}
