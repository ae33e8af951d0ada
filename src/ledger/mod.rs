pub mod client;
pub mod encoding;
pub mod models;

pub use client::LedgerClient;
pub use models::{LedgerEscrow, LedgerEvent, LedgerOperation, LedgerStatus, MultiSigState};
