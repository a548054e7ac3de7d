/// Orchestrator module - wires the components together and owns their lifecycle
///
/// The orchestrator:
/// - Opens the store (LibSQL, or in-memory for ephemeral runs)
/// - Builds the probe registry, dispatch executor and scheduler
/// - Runs the scheduler and retention cleanup until a shutdown signal
pub mod retention;

pub use retention::{RetentionCleanup, RetentionPolicy};

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::{DatabaseImpl, MemoryStore, NodeDirectory, Store, initialize_database};
use crate::monitoring::script::ExprEngine;
use crate::monitoring::sink::JsonLinesExporter;
use crate::monitoring::{DispatchExecutor, MonitoringScheduler, ProbeRegistry};
use crate::pool;

/// Open the configured database file, apply migrations and wrap it in a store
pub async fn open_database(config: &Config) -> Result<DatabaseImpl> {
    let pool = pool::open_local(&config.database.path, config.database.pool_size).await?;

    let conn = pool.get().await.map_err(|e| anyhow::anyhow!("database pool: {e}"))?;
    info!("Initializing database schema at {}", config.database.path);
    initialize_database(&conn).await?;

    Ok(DatabaseImpl::new_from_pool(pool))
}

/// Main orchestrator for the netwatch service
pub struct Orchestrator {
    store: Arc<dyn Store>,
    scheduler: Arc<MonitoringScheduler>,
    retention: RetentionCleanup,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create and run until Ctrl-C
    pub async fn start(config: Config, ephemeral: bool) -> Result<()> {
        let orchestrator = if ephemeral {
            warn!("Running with an in-memory store; nothing will be persisted");
            let store = Arc::new(MemoryStore::new());
            Self::new(&config, store.clone(), store)?
        } else {
            let database = Arc::new(open_database(&config).await?);
            Self::new(&config, database.clone(), database)?
        };
        orchestrator.run().await
    }

    pub fn new(config: &Config, store: Arc<dyn Store>, nodes: Arc<dyn NodeDirectory>) -> Result<Self> {
        let registry = ProbeRegistry::with_builtin(Arc::new(ExprEngine))?;
        info!("Probe types available: {}", registry.type_tags().join(", "));

        let mut executor =
            DispatchExecutor::new(registry, store.clone(), nodes).with_budget_grace(config.budget_grace());
        if let Some(path) = &config.export.path {
            info!("Exporting results to {}", path);
            executor = executor.with_exporter(Arc::new(JsonLinesExporter::new(path)));
        }

        let scheduler = Arc::new(MonitoringScheduler::new(
            store.clone(),
            Arc::new(executor),
            config.scheduler_config(),
        ));
        let retention = RetentionCleanup::new(store.clone(), config.retention_policy());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self { store, scheduler, retention, shutdown_tx })
    }

    pub fn scheduler(&self) -> &Arc<MonitoringScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `signal` resolves, then stop launching dispatches and wait
    /// for in-flight ones to drain
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> Result<()> {
        let Self { scheduler, retention, shutdown_tx, .. } = self;

        let retention_handle = retention.start_periodic_cleanup(shutdown_tx.subscribe());
        let scheduler_handle = tokio::spawn(scheduler.clone().run());
        info!("netwatch started");

        signal.await;
        info!("Shutdown requested");

        shutdown_tx.send_replace(true);
        scheduler.shutdown();

        if let Err(e) = scheduler_handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        if let Err(e) = retention_handle.await {
            warn!("Retention task ended abnormally: {}", e);
        }

        info!("netwatch stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{HealthState, MonitoredItem};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.database.path = dir.path().join("netwatch.db").to_string_lossy().into_owned();
        config.database.pool_size = 2;
        config.export.path = Some(dir.path().join("results.jsonl").to_string_lossy().into_owned());
        config
    }

    #[tokio::test]
    async fn test_open_database_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(&dir);

        let first = open_database(&config).await?;
        let node = first.upsert_node("edge").await?;
        drop(first);

        let second = open_database(&config).await?;
        assert_eq!(second.upsert_node("edge").await?, node);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_checks_items_and_stops() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let dir = tempfile::tempdir()?;
        let config = test_config(&dir);
        let database = Arc::new(open_database(&config).await?);
        let node = database.upsert_node("gateway").await?;
        let mut item = MonitoredItem::new(node, "ssh".into(), "tcp".into(), addr.to_string());
        item.log_mode = crate::monitoring::LogMode::Always;
        database.save_item(&item).await?;

        let orchestrator = Orchestrator::new(&config, database.clone(), database.clone())?;
        let store = orchestrator.store().clone();
        let watched = item.id;
        orchestrator
            .run_until(async move {
                tokio::time::timeout(Duration::from_secs(5), async {
                    loop {
                        if let Ok(Some(item)) = store.get_item(watched).await {
                            if item.state != HealthState::Unknown {
                                break;
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                })
                .await
                .ok();
            })
            .await?;

        let checked = database.get_item(item.id).await?.expect("item exists");
        assert_eq!(checked.state, HealthState::Normal);
        assert!(checked.last_run.is_some());
        assert_eq!(database.history(item.id, 10).await?.len(), 1);
        let exported = std::fs::read_to_string(dir.path().join("results.jsonl"))?;
        assert_eq!(exported.lines().count(), 1);
        Ok(())
    }
}
