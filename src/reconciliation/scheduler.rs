use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use super::engine::ReconciliationEngine;
use super::models::RunType;

/// Periodic trigger for scheduled reconciliation runs
pub struct ReconciliationScheduler {
    engine: ReconciliationEngine,
    cadence: Duration,
}

impl ReconciliationScheduler {
    pub fn new(engine: ReconciliationEngine, cadence: Duration) -> Self {
        Self { engine, cadence }
    }

    /// Start the scheduler loop in the background. The first tick fires
    /// one cadence after startup, not immediately.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let cadence = self.cadence;

        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            ticker.tick().await; // consume the immediate first tick
            info!("⏰ Reconciliation scheduler started (every {:?})", cadence);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!("🔄 Scheduled reconciliation triggered");
                        match engine.run(RunType::Scheduled, None).await {
                            Ok(run_id) => info!(run_id = %run_id, "Scheduled run dispatched"),
                            Err(e) => error!("Scheduled reconciliation failed to start: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Reconciliation scheduler stopping");
                        break;
                    }
                }
            }
        })
    }
}
