use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::escrow::repository::EscrowRepository;
use crate::ledger::encoding::key_from_hex;
use crate::ledger::models::LedgerEvent;
use crate::ledger::LedgerClient;
use crate::recovery::handlers::EventContext;
use crate::recovery::pipeline::RecoveryPipeline;
use crate::saga::{steps, NewSaga, OperationType, SagaManager};

/// Consumes the ledger event stream and keeps the mirror fresh. Events
/// are applied per invoice in ledger order; duplicates are suppressed on
/// the `(event_name, tx_hash, log_index)` identity. A failed mirror
/// update becomes an `event_processing` recovery saga carrying the
/// payload.
pub struct EventIngestor {
    ledger: Arc<dyn LedgerClient>,
    escrows: Arc<EscrowRepository>,
    sagas: Arc<SagaManager>,
    recovery: Arc<RecoveryPipeline>,
}

impl EventIngestor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        escrows: Arc<EscrowRepository>,
        sagas: Arc<SagaManager>,
        recovery: Arc<RecoveryPipeline>,
    ) -> Self {
        Self {
            ledger,
            escrows,
            sagas,
            recovery,
        }
    }

    /// Long-running ingestion loop. Returns when the shutdown signal
    /// fires or the stream closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("📥 Event ingestion started");
        let mut stream = match self.ledger.events().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot open ledger event stream: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(event) => self.ingest(&event).await,
                        None => {
                            warn!("Ledger event stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Event ingestion stopping");
                    break;
                }
            }
        }
    }

    async fn ingest(&self, event: &LedgerEvent) {
        let invoice_id = match invoice_from_args(&event.args) {
            Some(id) => id,
            None => {
                debug!(event = %event.name, tx_hash = %event.tx_hash, "Skipping event without invoice id");
                return;
            }
        };

        match apply_mirror_update(&self.escrows, invoice_id, event).await {
            Ok(applied) => {
                if applied {
                    debug!(
                        event = %event.name,
                        invoice_id = %invoice_id,
                        tx_hash = %event.tx_hash,
                        log_index = event.log_index,
                        "Event applied to mirror"
                    );
                }
            }
            Err(e) => {
                warn!(
                    event = %event.name,
                    invoice_id = %invoice_id,
                    "Mirror update failed, starting recovery saga: {e}"
                );
                if let Err(e) = self.start_recovery_saga(invoice_id, event, &e).await {
                    error!(invoice_id = %invoice_id, "Could not start event recovery saga: {e}");
                }
            }
        }
    }

    async fn start_recovery_saga(
        &self,
        invoice_id: Uuid,
        event: &LedgerEvent,
        failure: &AppError,
    ) -> AppResult<()> {
        let context = EventContext {
            invoice_id,
            event: event.clone(),
        };
        let context_json = serde_json::to_value(&context)?;

        let correlation_id = self
            .sagas
            .begin(NewSaga {
                operation_type: OperationType::EventProcessing,
                entity_type: "ledger_event".to_string(),
                entity_id: format!("{}:{}", event.tx_hash, event.log_index),
                steps_remaining: vec![steps::EVENT_MIRROR.to_string()],
                context: context_json.clone(),
                initiated_by: "event-ingestor".to_string(),
                idempotency_key: Some(format!(
                    "event:{}:{}:{}",
                    event.name, event.tx_hash, event.log_index
                )),
            })
            .await?;

        self.recovery
            .enqueue(
                correlation_id,
                OperationType::EventProcessing,
                context_json,
                1,
                &failure.to_string(),
            )
            .await
    }
}

/// Pull the invoice id out of event args: either a UUID `invoice_id` or
/// a 32-byte `invoice_key` in hex.
pub fn invoice_from_args(args: &serde_json::Value) -> Option<Uuid> {
    if let Some(id) = args.get("invoice_id").and_then(|v| v.as_str()) {
        if let Ok(id) = Uuid::parse_str(id) {
            return Some(id);
        }
    }
    if let Some(key) = args.get("invoice_key").and_then(|v| v.as_str()) {
        if let Ok(key) = key_from_hex(key) {
            if let Ok(id) = crate::ledger::encoding::invoice_id(&key) {
                return Some(id);
            }
        }
    }
    None
}

/// Apply one ledger event to the mirror inside a single transaction.
/// Inserting the event identity first makes the whole update idempotent:
/// a duplicate identity commits nothing and returns `false`.
pub async fn apply_mirror_update(
    escrows: &EscrowRepository,
    invoice_id: Uuid,
    event: &LedgerEvent,
) -> AppResult<bool> {
    let mut tx = escrows.pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO processed_events (event_name, tx_hash, log_index, invoice_id, block_number)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (event_name, tx_hash, log_index) DO NOTHING
        "#,
    )
    .bind(&event.name)
    .bind(&event.tx_hash)
    .bind(event.log_index as i64)
    .bind(invoice_id)
    .bind(event.block_number as i64)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(false);
    }

    match event.name.as_str() {
        "EscrowCreated" => {
            let seller = str_arg(&event.args, "seller");
            let buyer = str_arg(&event.args, "buyer");
            let amount = str_arg(&event.args, "amount");
            let token = str_arg(&event.args, "token");
            sqlx::query(
                r#"
                INSERT INTO escrows (
                    invoice_id, seller, buyer, amount, token, status,
                    seller_confirmed, buyer_confirmed, dispute_raised,
                    fee_amount, discount_rate_bps, expires_at
                )
                VALUES ($1, $2, $3, $4, $5, 'created', FALSE, FALSE, FALSE, '0', 0,
                        COALESCE($6, NOW() + INTERVAL '30 days'))
                ON CONFLICT (invoice_id) DO NOTHING
                "#,
            )
            .bind(invoice_id)
            .bind(seller)
            .bind(buyer)
            .bind(amount)
            .bind(token)
            .bind(
                event
                    .args
                    .get("expires_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok()),
            )
            .execute(&mut *tx)
            .await?;
        }
        "EscrowFunded" => {
            let amount = str_arg(&event.args, "amount");
            sqlx::query(
                r#"
                UPDATE escrows
                SET status = 'funded',
                    amount = COALESCE(NULLIF($2, ''), amount),
                    updated_at = NOW()
                WHERE invoice_id = $1 AND status = 'created'
                "#,
            )
            .bind(invoice_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        }
        "ReleaseConfirmed" => {
            let seller_side = event
                .args
                .get("seller_side")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let column = if seller_side {
                "seller_confirmed"
            } else {
                "buyer_confirmed"
            };
            sqlx::query(&format!(
                "UPDATE escrows SET {column} = TRUE, updated_at = NOW() WHERE invoice_id = $1"
            ))
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        }
        "EscrowReleased" => {
            let winner = str_arg(&event.args, "winner");
            sqlx::query(
                r#"
                UPDATE escrows
                SET status = 'released',
                    released_to = NULLIF($2, ''),
                    release_tx_hash = COALESCE(release_tx_hash, $3),
                    updated_at = NOW()
                WHERE invoice_id = $1
                "#,
            )
            .bind(invoice_id)
            .bind(winner)
            .bind(&event.tx_hash)
            .execute(&mut *tx)
            .await?;
        }
        "DisputeRaised" => {
            sqlx::query(
                r#"
                UPDATE escrows
                SET status = 'disputed', dispute_raised = TRUE, updated_at = NOW()
                WHERE invoice_id = $1 AND status = 'funded'
                "#,
            )
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        }
        "EscrowExpired" => {
            sqlx::query(
                r#"
                UPDATE escrows
                SET status = 'expired', updated_at = NOW()
                WHERE invoice_id = $1 AND status IN ('created', 'funded')
                "#,
            )
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        }
        "InvoiceTokenized" => {
            let token_id = str_arg(&event.args, "token_id");
            sqlx::query(
                r#"
                UPDATE escrows
                SET rwa_token_id = NULLIF($2, ''), updated_at = NOW()
                WHERE invoice_id = $1
                "#,
            )
            .bind(invoice_id)
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        }
        "ApprovalAdded" => {
            let approver = str_arg(&event.args, "approver");
            if !approver.is_empty() {
                sqlx::query(
                    r#"
                    UPDATE escrow_multisig
                    SET approvers = CASE
                            WHEN approvers @> ARRAY[$2] THEN approvers
                            ELSE array_append(approvers, $2)
                        END,
                        updated_at = NOW()
                    WHERE invoice_id = $1
                    "#,
                )
                .bind(invoice_id)
                .bind(approver)
                .execute(&mut *tx)
                .await?;
            }
        }
        other => {
            debug!(event = other, invoice_id = %invoice_id, "Ignoring unrecognized ledger event");
        }
    }

    tx.commit().await?;
    Ok(true)
}

fn str_arg(args: &serde_json::Value, name: &str) -> String {
    args.get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::encoding::invoice_key_hex;

    #[test]
    fn test_invoice_from_args_uuid() {
        let id = Uuid::new_v4();
        let args = serde_json::json!({ "invoice_id": id.to_string() });
        assert_eq!(invoice_from_args(&args), Some(id));
    }

    #[test]
    fn test_invoice_from_args_key() {
        let id = Uuid::new_v4();
        let args = serde_json::json!({ "invoice_key": invoice_key_hex(id) });
        assert_eq!(invoice_from_args(&args), Some(id));
    }

    #[test]
    fn test_invoice_from_args_missing() {
        let args = serde_json::json!({ "other": 1 });
        assert_eq!(invoice_from_args(&args), None);
        let args = serde_json::json!({ "invoice_id": "not-a-uuid" });
        assert_eq!(invoice_from_args(&args), None);
    }
}
