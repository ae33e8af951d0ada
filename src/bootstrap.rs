use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::AppResult;
use crate::escrow::{EscrowProtocol, EscrowRepository};
use crate::events::EventIngestor;
use crate::health::HealthMonitor;
use crate::ledger::LedgerClient;
use crate::publish::EventPublisher;
use crate::reconciliation::{ReconciliationEngine, ReconciliationScheduler};
use crate::recovery::handlers::{
    EscrowReleaseHandler, EventProcessingHandler, FinancingPipelineHandler, HandlerRegistry,
    TokenizationHandler,
};
use crate::recovery::{RecoveryPipeline, RecoveryWorker};
use crate::saga::SagaManager;

/// Initialize logging and tracing for the host process
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,torc=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Fully wired core. The host constructs a `LedgerClient` binding,
/// initializes this, starts the workers, and exposes whatever surface it
/// wants on top of the services here. No hidden globals: every component
/// gets its handles at construction.
pub struct AppCore {
    pub config: Config,
    pub pool: PgPool,
    pub publisher: EventPublisher,
    pub sagas: Arc<SagaManager>,
    pub escrows: Arc<EscrowRepository>,
    pub recovery: Arc<RecoveryPipeline>,
    pub protocol: Arc<EscrowProtocol>,
    pub ingestor: Arc<EventIngestor>,
    pub reconciliation: ReconciliationEngine,
    pub monitor: Arc<HealthMonitor>,
    ledger: Arc<dyn LedgerClient>,
}

impl AppCore {
    pub async fn initialize(config: Config, ledger: Arc<dyn LedgerClient>) -> AppResult<Self> {
        info!("Initializing orchestration core ...");

        let pool = initialize_database(&config.database_url).await?;

        let publisher = EventPublisher::new();
        let sagas = Arc::new(SagaManager::new(pool.clone()));
        let escrows = Arc::new(EscrowRepository::new(pool.clone()));
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            config.stuck_scan_interval,
        ));

        // The handler registry is the sole coupling point between the
        // recovery pipeline and the domain services
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EscrowReleaseHandler::new(
            ledger.clone(),
            escrows.clone(),
            sagas.clone(),
            publisher.clone(),
        )));
        registry.register(Arc::new(FinancingPipelineHandler::new(
            ledger.clone(),
            escrows.clone(),
            sagas.clone(),
        )));
        registry.register(Arc::new(EventProcessingHandler::new(
            escrows.clone(),
            sagas.clone(),
        )));
        registry.register(Arc::new(TokenizationHandler::new(
            ledger.clone(),
            escrows.clone(),
            sagas.clone(),
        )));
        let registry = Arc::new(registry);

        let recovery = Arc::new(RecoveryPipeline::new(
            pool.clone(),
            sagas.clone(),
            registry,
            &config,
        ));
        info!("✅ Recovery pipeline initialized");

        let protocol = Arc::new(EscrowProtocol::new(
            ledger.clone(),
            escrows.clone(),
            sagas.clone(),
            recovery.clone(),
            publisher.clone(),
            &config,
        ));
        info!("✅ Escrow protocol initialized");

        let ingestor = Arc::new(EventIngestor::new(
            ledger.clone(),
            escrows.clone(),
            sagas.clone(),
            recovery.clone(),
        ));
        info!("✅ Event ingestor initialized");

        let reconciliation =
            ReconciliationEngine::new(pool.clone(), ledger.clone(), escrows.clone(), &config);
        info!("✅ Reconciliation engine initialized");

        Ok(Self {
            config,
            pool,
            publisher,
            sagas,
            escrows,
            recovery,
            protocol,
            ingestor,
            reconciliation,
            monitor,
            ledger,
        })
    }

    /// Start every long-running worker. Each honors the shutdown signal
    /// at its next unit-of-work boundary, so the saga log stays
    /// consistent across restarts.
    pub fn start_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = RecoveryWorker::new(
            self.recovery.clone(),
            self.sagas.clone(),
            self.monitor.clone(),
            self.config.clone(),
        )
        .start(shutdown.clone());

        let scheduler = ReconciliationScheduler::new(
            self.reconciliation.clone(),
            self.config.reconciliation_interval,
        );
        handles.push(scheduler.start(shutdown.clone()));

        let ingestor = self.ingestor.clone();
        handles.push(tokio::spawn(async move {
            ingestor.run(shutdown).await;
        }));

        info!("✅ Workers started ({} tasks)", handles.len());
        handles
    }

    pub fn ledger(&self) -> Arc<dyn LedgerClient> {
        self.ledger.clone()
    }
}

/// Shutdown signal plumbing: flip the sender to drain the workers
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured");
    Ok(pool)
}
