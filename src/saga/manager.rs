use std::time::Duration;

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{validate_transition, OperationType, Saga, SagaState};
use crate::error::{AppResult, SagaError};

/// In-place retries for serialization/deadlock failures before escalating
const CONTENTION_RETRIES: u32 = 3;

/// Parameters for starting a saga
#[derive(Debug, Clone)]
pub struct NewSaga {
    pub operation_type: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    pub steps_remaining: Vec<String>,
    pub context: serde_json::Value,
    pub initiated_by: String,
    /// Caller-supplied idempotency key; `begin` returns the existing
    /// correlation id when a saga with the same key already exists.
    pub idempotency_key: Option<String>,
}

/// Optional field updates applied together with a state transition
#[derive(Debug, Clone, Default)]
pub struct SagaUpdate {
    pub steps_completed: Option<Vec<String>>,
    pub steps_remaining: Option<Vec<String>>,
    pub context: Option<serde_json::Value>,
}

/// Tracks multi-step transaction state: one row per saga, one write per
/// step, so the log is durable and replayable.
pub struct SagaManager {
    pool: PgPool,
}

impl SagaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a saga in `pending` and return its correlation id
    pub async fn begin(&self, new_saga: NewSaga) -> AppResult<Uuid> {
        let correlation_id = Uuid::new_v4();

        if let Some(key) = &new_saga.idempotency_key {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO sagas (
                    correlation_id, operation_type, entity_type, entity_id,
                    current_state, steps_completed, steps_remaining,
                    context_data, initiated_by, idempotency_key
                )
                VALUES ($1, $2, $3, $4, 'pending', '{}', $5, $6, $7, $8)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING correlation_id
                "#,
            )
            .bind(correlation_id)
            .bind(new_saga.operation_type)
            .bind(&new_saga.entity_type)
            .bind(&new_saga.entity_id)
            .bind(&new_saga.steps_remaining)
            .bind(&new_saga.context)
            .bind(&new_saga.initiated_by)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = inserted {
                info!(correlation_id = %id, operation = %new_saga.operation_type, "Saga started");
                return Ok(id);
            }

            // Same key raced or replayed: hand back the existing saga
            let (existing,): (Uuid,) =
                sqlx::query_as("SELECT correlation_id FROM sagas WHERE idempotency_key = $1")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await?;
            debug!(correlation_id = %existing, "Saga begin deduplicated on idempotency key");
            return Ok(existing);
        }

        sqlx::query(
            r#"
            INSERT INTO sagas (
                correlation_id, operation_type, entity_type, entity_id,
                current_state, steps_completed, steps_remaining,
                context_data, initiated_by
            )
            VALUES ($1, $2, $3, $4, 'pending', '{}', $5, $6, $7)
            "#,
        )
        .bind(correlation_id)
        .bind(new_saga.operation_type)
        .bind(&new_saga.entity_type)
        .bind(&new_saga.entity_id)
        .bind(&new_saga.steps_remaining)
        .bind(&new_saga.context)
        .bind(&new_saga.initiated_by)
        .execute(&self.pool)
        .await?;

        info!(correlation_id = %correlation_id, operation = %new_saga.operation_type, "Saga started");
        Ok(correlation_id)
    }

    /// Atomic state transition. Rejects illegal transitions and stamps
    /// `completed_at` when the saga reaches a resting state.
    pub async fn advance(
        &self,
        correlation_id: Uuid,
        new_state: SagaState,
        update: SagaUpdate,
    ) -> AppResult<()> {
        let mut attempt = 0u32;
        loop {
            let result = self.try_advance(correlation_id, new_state, &update).await;
            match result {
                Err(e) if e.is_contention() && attempt + 1 < CONTENTION_RETRIES => {
                    attempt += 1;
                    debug!(correlation_id = %correlation_id, attempt, "Retrying contended saga advance");
                }
                other => return other,
            }
        }
    }

    async fn try_advance(
        &self,
        correlation_id: Uuid,
        new_state: SagaState,
        update: &SagaUpdate,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        self.advance_tx(&mut tx, correlation_id, new_state, update)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transition inside a caller-owned transaction, so DLQ promotion can
    /// advance the saga and touch the queue atomically.
    pub async fn advance_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: Uuid,
        new_state: SagaState,
        update: &SagaUpdate,
    ) -> AppResult<()> {
        let current: Option<(SagaState,)> =
            sqlx::query_as("SELECT current_state FROM sagas WHERE correlation_id = $1 FOR UPDATE")
                .bind(correlation_id)
                .fetch_optional(&mut **tx)
                .await?;

        let (current_state,) = current.ok_or(SagaError::NotFound(correlation_id))?;
        validate_transition(current_state, new_state)?;

        let completed_at = new_state.is_resting().then(Utc::now);

        sqlx::query(
            r#"
            UPDATE sagas
            SET current_state = $2,
                steps_completed = COALESCE($3, steps_completed),
                steps_remaining = COALESCE($4, steps_remaining),
                context_data = COALESCE($5, context_data),
                completed_at = COALESCE($6, completed_at),
                updated_at = NOW()
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .bind(new_state)
        .bind(update.steps_completed.as_ref())
        .bind(update.steps_remaining.as_ref())
        .bind(update.context.as_ref())
        .bind(completed_at)
        .execute(&mut **tx)
        .await?;

        debug!(
            correlation_id = %correlation_id,
            from = current_state.as_str(),
            to = new_state.as_str(),
            "Saga advanced"
        );
        Ok(())
    }

    /// Record one completed step: append to the log, drop it from the
    /// remaining list. Idempotent, so a resumed worker can re-record.
    pub async fn record_step(&self, correlation_id: Uuid, step: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET steps_completed = CASE
                    WHEN steps_completed @> ARRAY[$2] THEN steps_completed
                    ELSE array_append(steps_completed, $2)
                END,
                steps_remaining = array_remove(steps_remaining, $2),
                updated_at = NOW()
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .bind(step)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::NotFound(correlation_id).into());
        }
        debug!(correlation_id = %correlation_id, step, "Saga step recorded");
        Ok(())
    }

    /// Merge fields into the saga context without a state transition
    pub async fn merge_context(
        &self,
        correlation_id: Uuid,
        patch: serde_json::Value,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET context_data = context_data || $2, updated_at = NOW()
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .bind(patch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::NotFound(correlation_id).into());
        }
        Ok(())
    }

    pub async fn read(&self, correlation_id: Uuid) -> AppResult<Saga> {
        let saga = sqlx::query_as::<_, Saga>(
            r#"
            SELECT correlation_id, operation_type, entity_type, entity_id,
                   current_state, steps_completed, steps_remaining,
                   context_data, initiated_by, idempotency_key,
                   created_at, updated_at, completed_at
            FROM sagas
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        saga.ok_or_else(|| SagaError::NotFound(correlation_id).into())
    }

    /// Sagas that have sat in `processing` or `compensating` past the
    /// threshold without an update; candidates for the recovery pipeline
    /// or operator attention.
    pub async fn stuck(&self, threshold: Duration) -> AppResult<Vec<Saga>> {
        let sagas = sqlx::query_as::<_, Saga>(
            r#"
            SELECT correlation_id, operation_type, entity_type, entity_id,
                   current_state, steps_completed, steps_remaining,
                   context_data, initiated_by, idempotency_key,
                   created_at, updated_at, completed_at
            FROM sagas
            WHERE current_state IN ('processing', 'compensating')
              AND updated_at < NOW() - make_interval(secs => $1)
            ORDER BY updated_at ASC
            "#,
        )
        .bind(threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(sagas)
    }
}
