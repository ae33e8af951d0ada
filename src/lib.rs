//! Transaction orchestration and reconciliation core for the invoice
//! settlement backend.
//!
//! The core coordinates multi-step operations across an external
//! append-only ledger and the internal Postgres store of record: every
//! initiated operation either converges to a consistent final state on
//! both sides or surfaces for manual intervention, never silently
//! half-applied.
//!
//! Subsystems:
//! - [`saga`]: durable, step-logged multi-step transaction state
//! - [`recovery`]: retry queue with backoff, DLQ, compensation executor
//! - [`escrow`]: the escrow protocol the sagas drive
//! - [`events`]: ledger event ingestion into the mirror
//! - [`reconciliation`]: periodic and on-demand ledger/store diffing
//! - [`health`]: pipeline metrics and the aggregated overview
//!
//! The HTTP surface, the ledger client binding and schema migrations
//! live in the host; see [`bootstrap::AppCore`].

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod health;
pub mod ledger;
pub mod publish;
pub mod reconciliation;
pub mod recovery;
pub mod saga;

pub use bootstrap::{init_tracing, shutdown_channel, AppCore};
pub use config::Config;
pub use error::{AppError, AppResult};
