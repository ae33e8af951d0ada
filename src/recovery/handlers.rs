use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppResult, SagaError};
use crate::escrow::repository::EscrowRepository;
use crate::events::apply_mirror_update;
use crate::ledger::models::LedgerEvent;
use crate::ledger::{LedgerClient, LedgerOperation};
use crate::publish::{DomainEvent, EventPublisher};
use crate::saga::{steps, OperationType, Saga, SagaManager};

/// Durable context for an escrow release saga. Carries everything a
/// worker needs to re-drive the operation from the step log alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseContext {
    pub invoice_id: Uuid,
    pub winner: String,
    /// Where the RWA NFT goes, when one is held in custody
    pub nft_recipient: Option<String>,
    pub amount: String,
    pub fee_amount: String,
    /// Treasury address the fee is paid to, ahead of the winner payout
    pub fee_recipient: String,
    pub token: String,
    /// The ledger operation whose submission is the BLOCKCHAIN_TX step
    pub operation: LedgerOperation,
    pub tx_hash: Option<String>,
}

/// Durable context for a financing pipeline saga
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancingContext {
    pub invoice_id: Uuid,
    pub funder: String,
    pub amount: String,
    pub tx_hash: Option<String>,
}

/// Durable context for replaying a ledger event into the mirror
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub invoice_id: Uuid,
    pub event: LedgerEvent,
}

/// Durable context for an invoice tokenization saga
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizationContext {
    pub invoice_id: Uuid,
    pub token_id: String,
    pub supply: String,
    pub face_value: String,
    pub operation: LedgerOperation,
    pub tx_hash: Option<String>,
}

/// A state-aware re-execution handler for one operation type. Handlers
/// consult the saga's completed steps before acting, so a retry never
/// repeats an effect that already committed.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn operation_type(&self) -> OperationType;

    async fn execute(&self, saga: &Saga, operation_data: &serde_json::Value) -> AppResult<()>;
}

/// operation_type → handler. The registry is the only coupling point
/// between the recovery pipeline and the domain services.
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        let operation_type = handler.operation_type();
        info!("Registering operation handler: {operation_type}");
        self.handlers.insert(operation_type, handler);
    }

    pub fn get(&self, operation_type: OperationType) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&operation_type).cloned()
    }

    /// Dispatch to the registered handler. Unknown operation types log
    /// and fail without retrying.
    pub async fn execute(
        &self,
        saga: &Saga,
        operation_data: &serde_json::Value,
    ) -> AppResult<()> {
        match self.get(saga.operation_type) {
            Some(handler) => handler.execute(saga, operation_data).await,
            None => {
                warn!(
                    correlation_id = %saga.correlation_id,
                    operation = %saga.operation_type,
                    "No handler registered for operation type"
                );
                Err(SagaError::UnknownOperation(saga.operation_type.to_string()).into())
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-drives an escrow release: submit the ledger transaction unless it
/// already committed, then the mirror update, then the audit entry.
pub struct EscrowReleaseHandler {
    ledger: Arc<dyn LedgerClient>,
    escrows: Arc<EscrowRepository>,
    sagas: Arc<SagaManager>,
    publisher: EventPublisher,
}

impl EscrowReleaseHandler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        escrows: Arc<EscrowRepository>,
        sagas: Arc<SagaManager>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            ledger,
            escrows,
            sagas,
            publisher,
        }
    }
}

#[async_trait]
impl OperationHandler for EscrowReleaseHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::EscrowRelease
    }

    async fn execute(&self, saga: &Saga, operation_data: &serde_json::Value) -> AppResult<()> {
        let mut context: ReleaseContext = serde_json::from_value(operation_data.clone())
            .map_err(|e| SagaError::MalformedContext {
                correlation_id: saga.correlation_id,
                message: e.to_string(),
            })?;

        if !saga.step_completed(steps::BLOCKCHAIN_TX) {
            let tx_hash = self.ledger.submit(context.operation.clone()).await?;
            context.tx_hash = Some(tx_hash.clone());
            self.sagas
                .merge_context(
                    saga.correlation_id,
                    serde_json::json!({ "tx_hash": tx_hash }),
                )
                .await?;
            self.sagas
                .record_step(saga.correlation_id, steps::BLOCKCHAIN_TX)
                .await?;
        }

        if !saga.step_completed(steps::DB_UPDATE) {
            self.escrows
                .mark_released(
                    context.invoice_id,
                    &context.winner,
                    context.tx_hash.as_deref(),
                )
                .await?;
            self.sagas
                .record_step(saga.correlation_id, steps::DB_UPDATE)
                .await?;
        }

        if !saga.step_completed(steps::AUDIT_LOG) {
            self.escrows
                .record_audit(
                    "escrow_released",
                    Some(context.invoice_id),
                    serde_json::json!({
                        "correlation_id": saga.correlation_id,
                        "winner": context.winner,
                        "amount": context.amount,
                        "fee_amount": context.fee_amount,
                        "fee_recipient": context.fee_recipient,
                        "nft_recipient": context.nft_recipient,
                        "tx_hash": context.tx_hash,
                    }),
                )
                .await?;
            self.sagas
                .record_step(saga.correlation_id, steps::AUDIT_LOG)
                .await?;
        }

        self.publisher.publish(DomainEvent::EscrowReleased {
            invoice_id: context.invoice_id,
            winner: context.winner.clone(),
            amount: context.amount.clone(),
            fee_amount: context.fee_amount.clone(),
            tx_hash: context.tx_hash.clone().unwrap_or_default(),
            at: Utc::now(),
        });

        info!(
            correlation_id = %saga.correlation_id,
            invoice_id = %context.invoice_id,
            "✓ Escrow release re-executed"
        );
        Ok(())
    }
}

/// Re-submits the funding call with the original parameters. Safe to
/// repeat: the ledger contract is idempotent on the invoice hash.
pub struct FinancingPipelineHandler {
    ledger: Arc<dyn LedgerClient>,
    escrows: Arc<EscrowRepository>,
    sagas: Arc<SagaManager>,
}

impl FinancingPipelineHandler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        escrows: Arc<EscrowRepository>,
        sagas: Arc<SagaManager>,
    ) -> Self {
        Self {
            ledger,
            escrows,
            sagas,
        }
    }
}

#[async_trait]
impl OperationHandler for FinancingPipelineHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::FinancingPipeline
    }

    async fn execute(&self, saga: &Saga, operation_data: &serde_json::Value) -> AppResult<()> {
        let context: FinancingContext = serde_json::from_value(operation_data.clone())
            .map_err(|e| SagaError::MalformedContext {
                correlation_id: saga.correlation_id,
                message: e.to_string(),
            })?;

        let operation = LedgerOperation::FundInvoice {
            key: crate::ledger::encoding::invoice_key_hex(context.invoice_id),
            amount: context.amount.clone(),
            funder: context.funder.clone(),
        };
        let tx_hash = self.ledger.submit(operation).await?;
        self.sagas
            .merge_context(
                saga.correlation_id,
                serde_json::json!({ "tx_hash": tx_hash }),
            )
            .await?;
        if !saga.step_completed(steps::BLOCKCHAIN_TX) {
            self.sagas
                .record_step(saga.correlation_id, steps::BLOCKCHAIN_TX)
                .await?;
        }

        if !saga.step_completed(steps::DB_UPDATE) {
            self.escrows
                .record_financing(context.invoice_id, &context.funder, &context.amount)
                .await?;
            self.sagas
                .record_step(saga.correlation_id, steps::DB_UPDATE)
                .await?;
        }

        info!(
            correlation_id = %saga.correlation_id,
            invoice_id = %context.invoice_id,
            "✓ Financing call re-submitted"
        );
        Ok(())
    }
}

/// Re-runs the event mirror update. Idempotent under the event identity
/// `(tx_hash, log_index)`.
pub struct EventProcessingHandler {
    escrows: Arc<EscrowRepository>,
    sagas: Arc<SagaManager>,
}

impl EventProcessingHandler {
    pub fn new(escrows: Arc<EscrowRepository>, sagas: Arc<SagaManager>) -> Self {
        Self { escrows, sagas }
    }
}

#[async_trait]
impl OperationHandler for EventProcessingHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::EventProcessing
    }

    async fn execute(&self, saga: &Saga, operation_data: &serde_json::Value) -> AppResult<()> {
        let context: EventContext = serde_json::from_value(operation_data.clone())
            .map_err(|e| SagaError::MalformedContext {
                correlation_id: saga.correlation_id,
                message: e.to_string(),
            })?;

        apply_mirror_update(&self.escrows, context.invoice_id, &context.event).await?;

        if !saga.step_completed(steps::EVENT_MIRROR) {
            self.sagas
                .record_step(saga.correlation_id, steps::EVENT_MIRROR)
                .await?;
        }

        info!(
            correlation_id = %saga.correlation_id,
            event = %context.event.name,
            tx_hash = %context.event.tx_hash,
            "✓ Event replayed into mirror"
        );
        Ok(())
    }
}

/// Re-drives an invoice tokenization: mint the RWA token unless already
/// committed, then record the collateral on the mirror.
pub struct TokenizationHandler {
    ledger: Arc<dyn LedgerClient>,
    escrows: Arc<EscrowRepository>,
    sagas: Arc<SagaManager>,
}

impl TokenizationHandler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        escrows: Arc<EscrowRepository>,
        sagas: Arc<SagaManager>,
    ) -> Self {
        Self {
            ledger,
            escrows,
            sagas,
        }
    }
}

#[async_trait]
impl OperationHandler for TokenizationHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::Tokenization
    }

    async fn execute(&self, saga: &Saga, operation_data: &serde_json::Value) -> AppResult<()> {
        let mut context: TokenizationContext = serde_json::from_value(operation_data.clone())
            .map_err(|e| SagaError::MalformedContext {
                correlation_id: saga.correlation_id,
                message: e.to_string(),
            })?;

        if !saga.step_completed(steps::BLOCKCHAIN_TX) {
            let tx_hash = self.ledger.submit(context.operation.clone()).await?;
            context.tx_hash = Some(tx_hash.clone());
            self.sagas
                .merge_context(
                    saga.correlation_id,
                    serde_json::json!({ "tx_hash": tx_hash }),
                )
                .await?;
            self.sagas
                .record_step(saga.correlation_id, steps::BLOCKCHAIN_TX)
                .await?;
        }

        if !saga.step_completed(steps::DB_UPDATE) {
            self.escrows
                .record_collateral(context.invoice_id, &context.token_id, &context.face_value)
                .await?;
            self.sagas
                .record_step(saga.correlation_id, steps::DB_UPDATE)
                .await?;
        }

        info!(
            correlation_id = %saga.correlation_id,
            invoice_id = %context.invoice_id,
            token_id = %context.token_id,
            "✓ Tokenization re-executed"
        );
        Ok(())
    }
}
