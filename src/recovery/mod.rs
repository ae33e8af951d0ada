pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod worker;

pub use handlers::{HandlerRegistry, OperationHandler};
pub use models::{backoff_delay, CompensationAction, CompensationStatus, DlqEntry, RecoveryEntry, RecoveryStatus};
pub use pipeline::{RecoveryPipeline, TickSummary};
pub use worker::RecoveryWorker;
