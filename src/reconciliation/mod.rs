pub mod engine;
pub mod models;
pub mod scheduler;

pub use engine::ReconciliationEngine;
pub use models::{
    CanonicalStatus, DiscrepancyType, ReconciliationLog, ReconciliationSummary, RunType,
    SummaryStatus,
};
pub use scheduler::ReconciliationScheduler;
