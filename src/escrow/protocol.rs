use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{
    addresses_equal, discounted_payable, nft_recipient, release_split, validate_creation_amount,
    DisputeVote, Escrow, EscrowStatus, ReleaseCause, VoteOutcome,
};
use super::repository::{escrow_window, EscrowRepository};
use crate::config::Config;
use crate::error::{AppResult, EscrowError};
use crate::ledger::encoding::invoice_key_hex;
use crate::ledger::{LedgerClient, LedgerOperation};
use crate::publish::{DomainEvent, EventPublisher};
use crate::recovery::handlers::{
    EscrowReleaseHandler, FinancingContext, ReleaseContext, TokenizationContext,
};
use crate::recovery::pipeline::{requires_compensation, RecoveryPipeline};
use crate::saga::{steps, NewSaga, OperationType, SagaManager, SagaState, SagaUpdate};

/// Approvals needed before a multi-sig release fires. The approver set
/// is drawn from {seller, buyer, admin}.
pub const MULTISIG_REQUIRED: u32 = 2;

/// Authenticated actor principal handed in by the (out of scope) API
/// layer.
#[derive(Debug, Clone)]
pub struct Actor {
    pub address: String,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_admin: false,
        }
    }

    pub fn admin(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_admin: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateEscrowParams {
    pub invoice_id: Uuid,
    pub seller: String,
    pub buyer: String,
    pub amount: BigInt,
    pub token: String,
    pub duration_seconds: u64,
    pub rwa_nft_contract: Option<String>,
    pub rwa_token_id: Option<String>,
    pub discount_bps: u32,
    pub discount_deadline: Option<DateTime<Utc>>,
}

/// What a confirmation call led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    AwaitingCounterparty,
    ReleaseStarted { correlation_id: Uuid },
}

/// Drives the escrow state machine: funding, confirmation, multi-sig
/// approval, dispute voting, expiry and release. The ledger owns the
/// protocol; this service validates preconditions against the mirror,
/// submits, and keeps the mirror and saga log in step.
pub struct EscrowProtocol {
    ledger: Arc<dyn LedgerClient>,
    escrows: Arc<EscrowRepository>,
    sagas: Arc<SagaManager>,
    recovery: Arc<RecoveryPipeline>,
    publisher: EventPublisher,
    release_handler: EscrowReleaseHandler,
    quorum_pct: u32,
    fee_bps: u32,
    minimum_amount: BigInt,
    treasury: String,
}

impl EscrowProtocol {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        escrows: Arc<EscrowRepository>,
        sagas: Arc<SagaManager>,
        recovery: Arc<RecoveryPipeline>,
        publisher: EventPublisher,
        config: &Config,
    ) -> Self {
        let release_handler = EscrowReleaseHandler::new(
            ledger.clone(),
            escrows.clone(),
            sagas.clone(),
            publisher.clone(),
        );
        Self {
            ledger,
            escrows,
            sagas,
            recovery,
            publisher,
            release_handler,
            quorum_pct: config.quorum_percentage,
            fee_bps: config.fee_basis_points(),
            minimum_amount: config.minimum_escrow_amount(),
            treasury: config.treasury_address.clone(),
        }
    }

    // ========== CREATE ==========

    /// Admin-only escrow creation. Rejects duplicates, amounts below the
    /// fee-derived minimum, and zero fees. When an RWA NFT is supplied
    /// the ledger takes custody (the seller must have pre-approved).
    pub async fn create(&self, actor: &Actor, params: CreateEscrowParams) -> AppResult<Escrow> {
        self.require_admin(actor)?;

        if params.discount_bps > 10_000 {
            return Err(EscrowError::InvalidDiscount(params.discount_bps).into());
        }
        if self.escrows.exists(params.invoice_id).await? {
            return Err(EscrowError::AlreadyExists(params.invoice_id).into());
        }
        let fee_amount =
            validate_creation_amount(&params.amount, &self.minimum_amount, self.fee_bps)?;

        let tx_hash = self
            .ledger
            .submit(LedgerOperation::CreateEscrow {
                key: invoice_key_hex(params.invoice_id),
                seller: params.seller.clone(),
                buyer: params.buyer.clone(),
                amount: params.amount.to_string(),
                token: params.token.clone(),
                duration_seconds: params.duration_seconds,
                rwa_nft_contract: params.rwa_nft_contract.clone(),
                rwa_token_id: params.rwa_token_id.clone(),
                discount_bps: params.discount_bps,
                discount_deadline: params.discount_deadline,
            })
            .await?;

        let (created_at, expires_at) = escrow_window(Utc::now(), params.duration_seconds);
        let escrow = Escrow {
            invoice_id: params.invoice_id,
            seller: params.seller,
            buyer: params.buyer,
            amount: params.amount,
            token: params.token,
            status: EscrowStatus::Created,
            seller_confirmed: false,
            buyer_confirmed: false,
            dispute_raised: false,
            fee_amount,
            discount_rate_bps: params.discount_bps as i32,
            discount_deadline: params.discount_deadline,
            rwa_nft_contract: params.rwa_nft_contract,
            rwa_token_id: params.rwa_token_id,
            release_tx_hash: None,
            released_to: None,
            created_at,
            expires_at,
            updated_at: created_at,
        };
        self.escrows.insert(&escrow).await?;
        self.escrows
            .init_multisig(escrow.invoice_id, MULTISIG_REQUIRED)
            .await?;
        self.escrows
            .record_audit(
                "escrow_created",
                Some(escrow.invoice_id),
                serde_json::json!({
                    "seller": escrow.seller,
                    "buyer": escrow.buyer,
                    "amount": escrow.amount.to_string(),
                    "fee_amount": escrow.fee_amount.to_string(),
                    "tx_hash": tx_hash,
                }),
            )
            .await?;

        info!(invoice_id = %escrow.invoice_id, "✓ Escrow created");
        Ok(escrow)
    }

    // ========== DEPOSIT ==========

    /// Buyer funds the escrow. An active discount reduces the payable,
    /// and the payable becomes the authoritative amount.
    pub async fn deposit(&self, actor: &Actor, invoice_id: Uuid) -> AppResult<Escrow> {
        let now = Utc::now();
        let mut tx = self.escrows.begin_tx().await?;
        let escrow = self.escrows.get_for_update(&mut tx, invoice_id).await?;

        if !addresses_equal(&escrow.buyer, &actor.address) {
            return Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "recorded buyer".to_string(),
            }
            .into());
        }
        if escrow.status != EscrowStatus::Created {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: escrow.status.as_str().to_string(),
                expected: "created".to_string(),
            }
            .into());
        }
        if escrow.is_expired_at(now) {
            return Err(EscrowError::Expired(invoice_id).into());
        }

        let payable = if escrow.discount_active_at(now) {
            discounted_payable(&escrow.amount, escrow.discount_rate_bps as u32)
        } else {
            escrow.amount.clone()
        };

        let tx_hash = self
            .ledger
            .submit(LedgerOperation::Deposit {
                key: invoice_key_hex(invoice_id),
                amount: payable.to_string(),
            })
            .await?;

        self.escrows
            .record_deposit(&mut tx, invoice_id, &payable)
            .await?;
        tx.commit().await?;

        self.escrows
            .record_audit(
                "escrow_deposited",
                Some(invoice_id),
                serde_json::json!({
                    "buyer": actor.address,
                    "payable": payable.to_string(),
                    "discount_applied": payable != escrow.amount,
                    "tx_hash": tx_hash,
                }),
            )
            .await?;

        info!(invoice_id = %invoice_id, payable = %payable, "✓ Escrow funded");
        self.escrows.get_required(invoice_id).await
    }

    // ========== CONFIRM / RELEASE ==========

    /// Either party confirms release. Past expiry the escrow is marked
    /// expired but confirmation-driven release stays open for parties who
    /// choose to complete. Both flags set fires the release saga.
    pub async fn confirm_release(
        &self,
        actor: &Actor,
        invoice_id: Uuid,
    ) -> AppResult<ConfirmOutcome> {
        let now = Utc::now();
        let mut tx = self.escrows.begin_tx().await?;
        let escrow = self.escrows.get_for_update(&mut tx, invoice_id).await?;

        if !escrow.is_party(&actor.address) {
            return Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "escrow party".to_string(),
            }
            .into());
        }
        if !matches!(escrow.status, EscrowStatus::Funded | EscrowStatus::Expired) {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: escrow.status.as_str().to_string(),
                expected: "funded".to_string(),
            }
            .into());
        }

        let seller_side = addresses_equal(&escrow.seller, &actor.address);
        self.escrows
            .set_confirmation(&mut tx, invoice_id, seller_side)
            .await?;

        if escrow.status == EscrowStatus::Funded && escrow.is_expired_at(now) {
            self.escrows
                .update_status(&mut tx, invoice_id, EscrowStatus::Funded, EscrowStatus::Expired)
                .await?;
        }

        let both_confirmed = (seller_side || escrow.seller_confirmed)
            && (!seller_side || escrow.buyer_confirmed);
        tx.commit().await?;

        if !both_confirmed {
            // The counterparty's confirmation will carry the release; the
            // flag itself still goes to the ledger now
            let tx_hash = self
                .ledger
                .submit(LedgerOperation::ConfirmRelease {
                    key: invoice_key_hex(invoice_id),
                    party: actor.address.clone(),
                })
                .await?;
            self.escrows
                .record_audit(
                    "release_confirmed",
                    Some(invoice_id),
                    serde_json::json!({ "party": actor.address, "tx_hash": tx_hash }),
                )
                .await?;
            return Ok(ConfirmOutcome::AwaitingCounterparty);
        }

        let escrow = self.escrows.get_required(invoice_id).await?;
        let operation = LedgerOperation::ConfirmRelease {
            key: invoice_key_hex(invoice_id),
            party: actor.address.clone(),
        };
        let correlation_id = self
            .start_release(
                &escrow,
                ReleaseCause::MutualConfirmation,
                operation,
                None,
                &actor.address,
            )
            .await?;
        Ok(ConfirmOutcome::ReleaseStarted { correlation_id })
    }

    /// Multi-sig path: accumulate an approval and release automatically
    /// once the threshold is met.
    pub async fn add_approval(&self, actor: &Actor, invoice_id: Uuid) -> AppResult<ConfirmOutcome> {
        let escrow = self.escrows.get_required(invoice_id).await?;
        if !escrow.is_party(&actor.address) && !actor.is_admin {
            return Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "escrow party or admin".to_string(),
            }
            .into());
        }
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: escrow.status.as_str().to_string(),
                expected: "funded".to_string(),
            }
            .into());
        }

        let tx_hash = self
            .ledger
            .submit(LedgerOperation::AddApproval {
                key: invoice_key_hex(invoice_id),
                approver: actor.address.clone(),
            })
            .await?;

        let approval = self.escrows.add_approver(invoice_id, &actor.address).await?;
        self.publisher.publish(DomainEvent::EscrowApprovalAdded {
            invoice_id,
            approver: actor.address.clone(),
            approvals: approval.count(),
            required: approval.required.max(0) as u32,
            at: Utc::now(),
        });
        self.escrows
            .record_audit(
                "approval_added",
                Some(invoice_id),
                serde_json::json!({
                    "approver": actor.address,
                    "approvals": approval.count(),
                    "required": approval.required,
                    "tx_hash": tx_hash.clone(),
                }),
            )
            .await?;

        if !approval.satisfied() {
            return Ok(ConfirmOutcome::AwaitingCounterparty);
        }

        let operation = LedgerOperation::ConfirmRelease {
            key: invoice_key_hex(invoice_id),
            party: actor.address.clone(),
        };
        let correlation_id = self
            .start_release(
                &escrow,
                ReleaseCause::MutualConfirmation,
                operation,
                Some(tx_hash),
                &actor.address,
            )
            .await?;
        Ok(ConfirmOutcome::ReleaseStarted { correlation_id })
    }

    // ========== EXPIRY ==========

    /// Buyer reclaims funds from an expired escrow; any held NFT returns
    /// to the seller.
    pub async fn reclaim_expired(&self, actor: &Actor, invoice_id: Uuid) -> AppResult<Escrow> {
        let now = Utc::now();
        let mut tx = self.escrows.begin_tx().await?;
        let escrow = self.escrows.get_for_update(&mut tx, invoice_id).await?;

        if !addresses_equal(&escrow.buyer, &actor.address) {
            return Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "recorded buyer".to_string(),
            }
            .into());
        }
        if !matches!(escrow.status, EscrowStatus::Funded | EscrowStatus::Expired) {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: escrow.status.as_str().to_string(),
                expected: "funded or expired".to_string(),
            }
            .into());
        }
        if !escrow.is_expired_at(now) {
            return Err(EscrowError::NotExpired(invoice_id).into());
        }

        let tx_hash = self
            .ledger
            .submit(LedgerOperation::ReclaimExpired {
                key: invoice_key_hex(invoice_id),
            })
            .await?;

        self.escrows.mark_expired(&mut tx, invoice_id).await?;
        tx.commit().await?;

        self.escrows
            .record_audit(
                "escrow_reclaimed",
                Some(invoice_id),
                serde_json::json!({
                    "buyer": actor.address,
                    "amount": escrow.amount.to_string(),
                    "nft_returned_to": escrow.rwa_token_id.is_some().then(|| escrow.seller.clone()),
                    "tx_hash": tx_hash,
                }),
            )
            .await?;

        info!(invoice_id = %invoice_id, "✓ Expired escrow reclaimed");
        self.escrows.get_required(invoice_id).await
    }

    // ========== DISPUTES ==========

    /// Either party opens a dispute on a funded escrow. Voting starts
    /// from a snapshot of the live arbitrator count.
    pub async fn raise_dispute(&self, actor: &Actor, invoice_id: Uuid) -> AppResult<Uuid> {
        let now = Utc::now();
        let escrow = self.escrows.get_required(invoice_id).await?;

        if !escrow.is_party(&actor.address) {
            return Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "escrow party".to_string(),
            }
            .into());
        }
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: escrow.status.as_str().to_string(),
                expected: "funded".to_string(),
            }
            .into());
        }
        let arbitrator_count = self.escrows.arbitrator_count().await?;
        if arbitrator_count == 0 {
            return Err(EscrowError::NoArbitrators.into());
        }

        let correlation_id = self
            .sagas
            .begin(NewSaga {
                operation_type: OperationType::EscrowDispute,
                entity_type: "escrow".to_string(),
                entity_id: invoice_id.to_string(),
                steps_remaining: vec![
                    steps::BLOCKCHAIN_TX.to_string(),
                    steps::DB_UPDATE.to_string(),
                ],
                context: serde_json::json!({ "invoice_id": invoice_id, "raised_by": actor.address }),
                initiated_by: actor.address.clone(),
                idempotency_key: None,
            })
            .await?;
        self.sagas
            .advance(correlation_id, SagaState::Processing, SagaUpdate::default())
            .await?;

        let result: AppResult<()> = async {
            let tx_hash = self
                .ledger
                .submit(LedgerOperation::RaiseDispute {
                    key: invoice_key_hex(invoice_id),
                    party: actor.address.clone(),
                })
                .await?;
            self.sagas
                .merge_context(correlation_id, serde_json::json!({ "tx_hash": tx_hash }))
                .await?;
            self.sagas
                .record_step(correlation_id, steps::BLOCKCHAIN_TX)
                .await?;

            let mut tx = self.escrows.begin_tx().await?;
            self.escrows.mark_disputed(&mut tx, invoice_id).await?;
            self.escrows
                .insert_dispute(&mut tx, &DisputeVote::open(invoice_id, arbitrator_count, now))
                .await?;
            tx.commit().await?;
            self.sagas
                .record_step(correlation_id, steps::DB_UPDATE)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.sagas
                    .advance(
                        correlation_id,
                        SagaState::Completed,
                        SagaUpdate {
                            steps_remaining: Some(Vec::new()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.publisher.publish(DomainEvent::EscrowDispute {
                    invoice_id,
                    raised_by: actor.address.clone(),
                    at: now,
                });
                info!(invoice_id = %invoice_id, correlation_id = %correlation_id, "✓ Dispute raised");
                Ok(correlation_id)
            }
            Err(e) => {
                self.fail_saga(
                    correlation_id,
                    OperationType::EscrowDispute,
                    serde_json::json!({ "invoice_id": invoice_id, "raised_by": actor.address }),
                    &e,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Registered arbitrators vote once each. Every vote shrinks the
    /// snapshot to the live count; meeting the quorum resolves the
    /// dispute and releases to the winner.
    pub async fn vote_on_dispute(
        &self,
        actor: &Actor,
        invoice_id: Uuid,
        vote_for_buyer: bool,
    ) -> AppResult<VoteOutcome> {
        let now = Utc::now();
        if !self.escrows.is_arbitrator(&actor.address).await? {
            return Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "registered arbitrator".to_string(),
            }
            .into());
        }

        let live_count = self.escrows.arbitrator_count().await?;
        let mut tx = self.escrows.begin_tx().await?;
        let mut vote = self.escrows.get_dispute_for_update(&mut tx, invoice_id).await?;
        let outcome = vote.apply_vote(
            &actor.address,
            vote_for_buyer,
            live_count,
            self.quorum_pct,
            now,
        )?;
        self.escrows.save_dispute(&mut tx, &vote).await?;

        let ledger_tx = self
            .ledger
            .submit(LedgerOperation::VoteOnDispute {
                key: invoice_key_hex(invoice_id),
                arbitrator: actor.address.clone(),
                vote_for_buyer,
            })
            .await?;
        tx.commit().await?;

        self.escrows
            .record_audit(
                "dispute_vote_cast",
                Some(invoice_id),
                serde_json::json!({
                    "arbitrator": actor.address,
                    "vote_for_buyer": vote_for_buyer,
                    "snapshot": vote.snapshot_arbitrator_count,
                    "tx_hash": ledger_tx.clone(),
                }),
            )
            .await?;

        if let VoteOutcome::Resolved { seller_wins } = outcome {
            self.release_dispute_winner(invoice_id, seller_wins, ledger_tx, &actor.address)
                .await?;
        }
        Ok(outcome)
    }

    /// Admin escape hatch for disputes whose quorum became unreachable
    /// after arbitrator departures. Without it the dispute would sit
    /// unresolved forever.
    pub async fn safe_escape(
        &self,
        actor: &Actor,
        invoice_id: Uuid,
        seller_wins: bool,
    ) -> AppResult<Uuid> {
        self.require_admin(actor)?;
        let now = Utc::now();
        let live_count = self.escrows.arbitrator_count().await?;

        let mut tx = self.escrows.begin_tx().await?;
        let mut vote = self.escrows.get_dispute_for_update(&mut tx, invoice_id).await?;
        if vote.resolved {
            return Err(EscrowError::DisputeResolved(invoice_id).into());
        }
        if !vote.quorum_unreachable(live_count, self.quorum_pct) {
            return Err(EscrowError::QuorumReachable {
                live: live_count,
                required: super::models::quorum_threshold(
                    vote.snapshot_arbitrator_count as u32,
                    self.quorum_pct,
                ),
            }
            .into());
        }
        vote.resolve_by_escape(seller_wins, now);
        self.escrows.save_dispute(&mut tx, &vote).await?;

        let ledger_tx = self
            .ledger
            .submit(LedgerOperation::SafeEscape {
                key: invoice_key_hex(invoice_id),
                seller_wins,
            })
            .await?;
        tx.commit().await?;

        self.escrows
            .record_audit(
                "safe_escape",
                Some(invoice_id),
                serde_json::json!({
                    "admin": actor.address,
                    "seller_wins": seller_wins,
                    "live_count": live_count,
                    "tx_hash": ledger_tx.clone(),
                }),
            )
            .await?;

        warn!(invoice_id = %invoice_id, seller_wins, "⚠️  Dispute resolved by safe escape");
        self.release_dispute_winner(invoice_id, seller_wins, ledger_tx, &actor.address)
            .await
    }

    // ========== FINANCING & TOKENIZATION ==========

    /// Financing pipeline: move external liquidity, submit the funding
    /// call (idempotent on invoice hash), record it on the mirror.
    pub async fn start_financing(
        &self,
        actor: &Actor,
        invoice_id: Uuid,
        amount: BigInt,
    ) -> AppResult<Uuid> {
        let escrow = self.escrows.get_required(invoice_id).await?;
        if escrow.status != EscrowStatus::Created {
            return Err(EscrowError::InvalidState {
                invoice_id,
                current: escrow.status.as_str().to_string(),
                expected: "created".to_string(),
            }
            .into());
        }

        let context = FinancingContext {
            invoice_id,
            funder: actor.address.clone(),
            amount: amount.to_string(),
            tx_hash: None,
        };
        let context_json = serde_json::to_value(&context)?;

        let correlation_id = self
            .sagas
            .begin(NewSaga {
                operation_type: OperationType::FinancingPipeline,
                entity_type: "invoice".to_string(),
                entity_id: invoice_id.to_string(),
                steps_remaining: vec![
                    steps::LIQUIDITY_TRANSFER.to_string(),
                    steps::BLOCKCHAIN_TX.to_string(),
                    steps::DB_UPDATE.to_string(),
                ],
                context: context_json.clone(),
                initiated_by: actor.address.clone(),
                idempotency_key: None,
            })
            .await?;
        self.sagas
            .advance(correlation_id, SagaState::Processing, SagaUpdate::default())
            .await?;

        let result: AppResult<()> = async {
            // External liquidity moves first; after this step a failure
            // needs operator compensation
            self.escrows
                .record_audit(
                    "liquidity_transfer",
                    Some(invoice_id),
                    serde_json::json!({
                        "correlation_id": correlation_id,
                        "funder": actor.address,
                        "amount": amount.to_string(),
                    }),
                )
                .await?;
            self.sagas
                .record_step(correlation_id, steps::LIQUIDITY_TRANSFER)
                .await?;

            let tx_hash = self
                .ledger
                .submit(LedgerOperation::FundInvoice {
                    key: invoice_key_hex(invoice_id),
                    amount: amount.to_string(),
                    funder: actor.address.clone(),
                })
                .await?;
            self.sagas
                .merge_context(correlation_id, serde_json::json!({ "tx_hash": tx_hash }))
                .await?;
            self.sagas
                .record_step(correlation_id, steps::BLOCKCHAIN_TX)
                .await?;

            self.escrows
                .record_financing(invoice_id, &actor.address, &amount.to_string())
                .await?;
            self.sagas
                .record_step(correlation_id, steps::DB_UPDATE)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.sagas
                    .advance(
                        correlation_id,
                        SagaState::Completed,
                        SagaUpdate {
                            steps_remaining: Some(Vec::new()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(invoice_id = %invoice_id, correlation_id = %correlation_id, "✓ Financing pipeline completed");
                Ok(correlation_id)
            }
            Err(e) => {
                self.fail_saga(correlation_id, OperationType::FinancingPipeline, context_json, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Mint the RWA token backing an invoice and attach it as collateral
    pub async fn tokenize_invoice(
        &self,
        actor: &Actor,
        invoice_id: Uuid,
        token_id: String,
        supply: String,
        face_value: String,
    ) -> AppResult<Uuid> {
        self.require_admin(actor)?;
        let _ = self.escrows.get_required(invoice_id).await?;

        let operation = LedgerOperation::MintRwaToken {
            key: invoice_key_hex(invoice_id),
            token_id: token_id.clone(),
            supply: supply.clone(),
            face_value: face_value.clone(),
        };
        let context = TokenizationContext {
            invoice_id,
            token_id: token_id.clone(),
            supply,
            face_value: face_value.clone(),
            operation: operation.clone(),
            tx_hash: None,
        };
        let context_json = serde_json::to_value(&context)?;

        let correlation_id = self
            .sagas
            .begin(NewSaga {
                operation_type: OperationType::Tokenization,
                entity_type: "invoice".to_string(),
                entity_id: invoice_id.to_string(),
                steps_remaining: vec![
                    steps::BLOCKCHAIN_TX.to_string(),
                    steps::DB_UPDATE.to_string(),
                ],
                context: context_json.clone(),
                initiated_by: actor.address.clone(),
                idempotency_key: None,
            })
            .await?;
        self.sagas
            .advance(correlation_id, SagaState::Processing, SagaUpdate::default())
            .await?;

        let result: AppResult<()> = async {
            let tx_hash = self.ledger.submit(operation).await?;
            self.sagas
                .merge_context(correlation_id, serde_json::json!({ "tx_hash": tx_hash }))
                .await?;
            self.sagas
                .record_step(correlation_id, steps::BLOCKCHAIN_TX)
                .await?;

            self.escrows
                .record_collateral(invoice_id, &token_id, &face_value)
                .await?;
            self.sagas
                .record_step(correlation_id, steps::DB_UPDATE)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.sagas
                    .advance(
                        correlation_id,
                        SagaState::Completed,
                        SagaUpdate {
                            steps_remaining: Some(Vec::new()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(invoice_id = %invoice_id, correlation_id = %correlation_id, "✓ Invoice tokenized");
                Ok(correlation_id)
            }
            Err(e) => {
                self.fail_saga(correlation_id, OperationType::Tokenization, context_json, &e)
                    .await;
                Err(e)
            }
        }
    }

    // ========== RELEASE SAGA ==========

    /// Begin and drive the release saga: ledger payout (fee to treasury
    /// first, remainder to the winner, NFT to the counterparty-determined
    /// recipient), mirror update, audit entry.
    async fn start_release(
        &self,
        escrow: &Escrow,
        cause: ReleaseCause,
        operation: LedgerOperation,
        pre_submitted_tx: Option<String>,
        initiator: &str,
    ) -> AppResult<Uuid> {
        let winner = match cause {
            ReleaseCause::MutualConfirmation | ReleaseCause::DisputeSellerWins => &escrow.seller,
            ReleaseCause::DisputeBuyerWins => &escrow.buyer,
        };
        let (fee, payout) = release_split(&escrow.amount, &escrow.fee_amount);
        let nft_to = escrow
            .rwa_token_id
            .as_ref()
            .map(|_| nft_recipient(cause, &escrow.seller, &escrow.buyer).to_string());

        let context = ReleaseContext {
            invoice_id: escrow.invoice_id,
            winner: winner.clone(),
            nft_recipient: nft_to,
            amount: payout.to_string(),
            fee_amount: fee.to_string(),
            fee_recipient: self.treasury.clone(),
            token: escrow.token.clone(),
            operation,
            tx_hash: pre_submitted_tx.clone(),
        };
        let context_json = serde_json::to_value(&context)?;

        let correlation_id = self
            .sagas
            .begin(NewSaga {
                operation_type: OperationType::EscrowRelease,
                entity_type: "escrow".to_string(),
                entity_id: escrow.invoice_id.to_string(),
                steps_remaining: vec![
                    steps::BLOCKCHAIN_TX.to_string(),
                    steps::DB_UPDATE.to_string(),
                    steps::AUDIT_LOG.to_string(),
                ],
                context: context_json.clone(),
                initiated_by: initiator.to_string(),
                idempotency_key: Some(format!("escrow_release:{}", escrow.invoice_id)),
            })
            .await?;
        self.sagas
            .advance(correlation_id, SagaState::Processing, SagaUpdate::default())
            .await?;

        // Dispute resolutions already carried the payout transaction
        if pre_submitted_tx.is_some() {
            self.sagas
                .record_step(correlation_id, steps::BLOCKCHAIN_TX)
                .await?;
        }

        let saga = self.sagas.read(correlation_id).await?;
        match self.release_handler_execute(&saga, &context_json).await {
            Ok(()) => {
                self.sagas
                    .advance(
                        correlation_id,
                        SagaState::Completed,
                        SagaUpdate {
                            steps_remaining: Some(Vec::new()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(
                    invoice_id = %escrow.invoice_id,
                    correlation_id = %correlation_id,
                    winner = %winner,
                    "✓ Escrow released"
                );
                Ok(correlation_id)
            }
            Err(e) => {
                self.fail_saga(correlation_id, OperationType::EscrowRelease, context_json, &e)
                    .await;
                // The saga survives in the recovery pipeline; hand the
                // correlation id back so the caller can track it
                warn!(
                    invoice_id = %escrow.invoice_id,
                    correlation_id = %correlation_id,
                    "Release deferred to recovery: {e}"
                );
                Ok(correlation_id)
            }
        }
    }

    async fn release_handler_execute(
        &self,
        saga: &crate::saga::Saga,
        context: &serde_json::Value,
    ) -> AppResult<()> {
        use crate::recovery::handlers::OperationHandler;
        self.release_handler.execute(saga, context).await
    }

    async fn release_dispute_winner(
        &self,
        invoice_id: Uuid,
        seller_wins: bool,
        ledger_tx: String,
        initiator: &str,
    ) -> AppResult<Uuid> {
        let escrow = self.escrows.get_required(invoice_id).await?;
        let cause = if seller_wins {
            ReleaseCause::DisputeSellerWins
        } else {
            ReleaseCause::DisputeBuyerWins
        };
        // The resolving vote carried the payout; re-submission on retry
        // is unnecessary, so the tx is recorded as already committed
        let operation = LedgerOperation::SafeEscape {
            key: invoice_key_hex(invoice_id),
            seller_wins,
        };
        self.start_release(&escrow, cause, operation, Some(ledger_tx), initiator)
            .await
    }

    /// Mark the saga failed and route it into the recovery pipeline (or
    /// straight to the DLQ when the failure is terminal and left visible
    /// side effects).
    async fn fail_saga(
        &self,
        correlation_id: Uuid,
        operation_type: OperationType,
        operation_data: serde_json::Value,
        failure: &crate::error::AppError,
    ) {
        if let Err(e) = self
            .sagas
            .advance(correlation_id, SagaState::Failed, SagaUpdate::default())
            .await
        {
            tracing::error!(correlation_id = %correlation_id, "Failed to mark saga failed: {e}");
            return;
        }

        let steps_completed = match self.sagas.read(correlation_id).await {
            Ok(saga) => saga.steps_completed,
            Err(_) => Vec::new(),
        };
        let needs_compensation = requires_compensation(operation_type, &steps_completed);

        let outcome = if failure.is_retryable() {
            // First failure: one retry already burned, backoff doubles
            // from here
            self.recovery
                .enqueue(
                    correlation_id,
                    operation_type,
                    operation_data,
                    1,
                    &failure.to_string(),
                )
                .await
        } else if needs_compensation {
            self.recovery
                .promote_to_dlq(
                    correlation_id,
                    operation_type,
                    operation_data,
                    &failure.to_string(),
                    1,
                    true,
                )
                .await
        } else {
            Ok(())
        };

        if let Err(e) = outcome {
            tracing::error!(correlation_id = %correlation_id, "Failed to route saga failure: {e}");
        }
    }

    fn require_admin(&self, actor: &Actor) -> AppResult<()> {
        if actor.is_admin {
            Ok(())
        } else {
            Err(EscrowError::NotAuthorized {
                caller: actor.address.clone(),
                required: "admin".to_string(),
            }
            .into())
        }
    }
}
