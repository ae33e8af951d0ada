pub mod models;
pub mod monitor;

pub use models::{HealthMetric, MetricType, PipelineOverview};
pub use monitor::HealthMonitor;
