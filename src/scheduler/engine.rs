//! Engine Boot
//!
//! Wires the components together: open the store, run recovery, restore
//! the pool and registry, start the metrics observer, and launch the
//! scheduler loop. The returned runtime owns shutdown.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use taskmesh_dispatch::Dispatcher;
use taskmesh_store::{DurableStore, StoreError};

use crate::api::EngineHandle;
use crate::bus::EventBus;
use crate::config::{ConfigError, MeshConfig, ProvidersFile};
use crate::metrics::{AlertThresholds, MetricsAggregator, ProviderPricing};
use crate::pool::WorkerPool;
use crate::providers::ProviderRegistry;
use crate::recovery::{RecoveryError, RecoveryManager};
use crate::scheduler::{Scheduler, SchedulerError};

/// Startup failures, in exit-code order: configuration, recovery, store.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Store unreachable: {0}")]
    Store(#[from] StoreError),
}

/// A running engine.
pub struct EngineRuntime {
    pub handle: EngineHandle,
    pub store: Arc<DurableStore>,
    pub bus: Arc<EventBus>,
    pub config: Arc<MeshConfig>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Result<(), SchedulerError>>,
}

impl EngineRuntime {
    /// Signal shutdown and wait for the loop to finish its final
    /// checkpoint.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        let _ = self.shutdown.send(true);
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Scheduler task panicked");
                Ok(())
            }
        }
    }

    /// Whether the scheduler loop is still running.
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Kill the loop without a final checkpoint. Recovery picks up from
    /// the log, exactly as after a crash.
    pub fn abort(self) {
        self.join.abort();
    }
}

pub struct Engine;

impl Engine {
    /// Boot the engine: recover state from the data directory, then start
    /// scheduling against the given dispatcher.
    pub async fn start(
        config: MeshConfig,
        providers: ProvidersFile,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<EngineRuntime, BootError> {
        config.validate()?;
        providers.validate()?;
        let config = Arc::new(config);

        let store = Arc::new(DurableStore::open(&config.data_dir).await?);
        let recovered = RecoveryManager::new(store.clone()).recover().await?;
        info!(
            tasks = recovered.tasks.len(),
            last_seq = recovered.last_seq,
            fresh = recovered.fresh_start,
            "Engine state recovered"
        );

        let bus = Arc::new(EventBus::with_store(config.bus_high_water, store.clone()));
        let now = chrono::Utc::now();

        let pool = Arc::new(WorkerPool::new(
            config.heartbeat_timeout_ms,
            config.load_decay_after_ms,
            config.load_decay_factor,
        ));
        pool.restore(recovered.workers.clone(), now);

        let registry = Arc::new(ProviderRegistry::new(
            providers.providers.clone(),
            providers.effective_modes(),
            config.default_cost_mode.clone(),
            now,
        ));
        registry.restore(recovered.providers.clone(), now);

        let pricing = providers
            .providers
            .iter()
            .map(|p| ProviderPricing {
                id: p.id.clone(),
                cost_per_1k_tokens: p.cost_per_1k_tokens,
                daily_token_budget: p.daily_token_budget,
            })
            .collect();
        let metrics = Arc::new(MetricsAggregator::new(AlertThresholds::default(), pricing));
        tokio::spawn(Arc::clone(&metrics).run(bus.clone()));

        let (commands_tx, commands_rx) = mpsc::channel(256);
        let scheduler = Scheduler::new(
            config.clone(),
            store.clone(),
            bus.clone(),
            pool,
            registry,
            metrics,
            dispatcher,
            recovered,
            commands_rx,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(scheduler.run(shutdown_rx));

        Ok(EngineRuntime {
            handle: EngineHandle::new(commands_tx),
            store,
            bus,
            config,
            shutdown: shutdown_tx,
            join,
        })
    }
}
