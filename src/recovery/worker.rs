use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::pipeline::RecoveryPipeline;
use crate::config::Config;
use crate::health::HealthMonitor;
use crate::saga::SagaManager;

/// The long-running recovery loops: retry ticks, stuck-saga scans and
/// DLQ depth sampling. Each finishes its current unit of work before
/// honoring shutdown.
pub struct RecoveryWorker {
    pipeline: Arc<RecoveryPipeline>,
    sagas: Arc<SagaManager>,
    monitor: Arc<HealthMonitor>,
    config: Config,
}

impl RecoveryWorker {
    pub fn new(
        pipeline: Arc<RecoveryPipeline>,
        sagas: Arc<SagaManager>,
        monitor: Arc<HealthMonitor>,
        config: Config,
    ) -> Self {
        Self {
            pipeline,
            sagas,
            monitor,
            config,
        }
    }

    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_tick_loop(shutdown.clone()),
            self.spawn_stuck_scan(shutdown.clone()),
            self.spawn_dlq_sampler(shutdown),
        ]
    }

    fn spawn_tick_loop(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let cadence = self.config.recovery_tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            info!("♻️  Recovery worker started (tick every {:?})", cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pipeline.tick().await {
                            error!("Recovery tick failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Recovery worker stopping");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_stuck_scan(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sagas = self.sagas.clone();
        let monitor = self.monitor.clone();
        let cadence = self.config.stuck_scan_interval;

        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            ticker.tick().await;
            info!("🔎 Stuck-saga scan started (every {:?})", cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sagas.stuck(cadence).await {
                            Ok(stuck) => {
                                for saga in &stuck {
                                    warn!(
                                        correlation_id = %saga.correlation_id,
                                        operation = %saga.operation_type,
                                        state = saga.current_state.as_str(),
                                        updated_at = %saga.updated_at,
                                        "⚠️  Stuck saga detected"
                                    );
                                }
                                if let Err(e) = monitor.record_stuck_count(stuck.len()).await {
                                    error!("Failed to record stuck-saga metric: {e}");
                                }
                            }
                            Err(e) => error!("Stuck-saga scan failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Stuck-saga scan stopping");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_dlq_sampler(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let pipeline = self.pipeline.clone();
        let cadence = self.config.dlq_sample_interval;

        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            ticker.tick().await;
            info!("📊 DLQ sampler started (every {:?})", cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match monitor.sample_dlq_depth().await {
                            Ok(depth) if depth > 0 => {
                                // Surface what is waiting on an operator
                                match pipeline.unresolved_dlq(5, 0).await {
                                    Ok(entries) => {
                                        for entry in entries {
                                            warn!(
                                                correlation_id = %entry.correlation_id,
                                                operation = %entry.operation_type,
                                                requires_compensation = entry.requires_compensation,
                                                "DLQ entry awaiting resolution"
                                            );
                                        }
                                    }
                                    Err(e) => error!("Failed to list DLQ entries: {e}"),
                                }
                            }
                            Ok(_) => {}
                            Err(e) => error!("DLQ sampling failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("DLQ sampler stopping");
                        break;
                    }
                }
            }
        })
    }
}
