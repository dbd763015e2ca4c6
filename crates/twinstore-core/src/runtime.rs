//! Runtime assembly: stores, routing, guard set, coordinator, dispatcher and
//! interceptor wired together from one [`SyncConfig`].

use std::sync::Arc;
use tracing::info;
use twinstore_types::SyncConfig;
use validator::Validate;

use crate::error::{CoreError, CoreResult};
use crate::modules::config::dead_letter_path;
use crate::store::{self, Store};
use crate::sync::{
    metrics, ChangeInterceptor, DeadLetterLog, Dispatcher, EntityRegistry, ReplayReport,
    RetryPolicy, RoutingTable, SyncCoordinator, SyncGuardSet, SyncStats,
};

pub struct SyncRuntime {
    config: Arc<SyncConfig>,
    coordinator: Arc<SyncCoordinator>,
    dispatcher: Arc<Dispatcher>,
    interceptor: Arc<ChangeInterceptor>,
    dead_letters: Arc<DeadLetterLog>,
}

impl SyncRuntime {
    /// Connect both stores, open the dead-letter log and start the workers.
    pub async fn start(config: SyncConfig, registry: EntityRegistry) -> CoreResult<Self> {
        config.validate()?;

        let primary = store::connect(&config.primary).await?;
        let replica = store::connect(&config.replica).await?;
        let dead_letters = Arc::new(DeadLetterLog::open(dead_letter_path(&config)?)?);

        Self::with_stores(config, registry, primary, replica, dead_letters)
    }

    /// Assemble from already opened stores. Their ids must match the config.
    pub fn with_stores(
        config: SyncConfig,
        registry: EntityRegistry,
        primary: Arc<dyn Store>,
        replica: Arc<dyn Store>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> CoreResult<Self> {
        config.validate()?;
        for (configured, store) in [(&config.primary, &primary), (&config.replica, &replica)] {
            if store.id().as_str() != configured.id {
                return Err(CoreError::Config(format!(
                    "store id mismatch: configured {}, opened {}",
                    configured.id,
                    store.id()
                )));
            }
        }

        metrics::describe_metrics();

        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let routing = RoutingTable::from_config(&config).restrict_to(registry.namespaces());
        let guards = SyncGuardSet::new();
        let stats = Arc::new(SyncStats::new());

        let coordinator = Arc::new(
            SyncCoordinator::new(routing.clone(), [primary, replica], guards.clone())
                .with_retry(RetryPolicy::from(config.retry))
                .with_timeout(config.transaction_timeout())
                .with_dead_letters(Arc::clone(&dead_letters))
                .with_stats(Arc::clone(&stats)),
        );
        let dispatcher = Arc::new(Dispatcher::start(Arc::clone(&coordinator), config.dispatch));
        let interceptor = Arc::new(ChangeInterceptor::new(
            Arc::clone(&registry),
            routing,
            guards,
            Arc::clone(&dispatcher),
            stats,
        ));

        info!(
            primary = %config.primary.id,
            replica = %config.replica.id,
            entity_types = registry.len(),
            excluded = ?config.excluded_namespaces,
            "Sync runtime started"
        );

        Ok(Self { config, coordinator, dispatcher, interceptor, dead_letters })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &Arc<ChangeInterceptor> {
        &self.interceptor
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        self.coordinator.stats()
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.dead_letters
    }

    /// Wait until every queued replication has finished.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// Re-run dead-lettered replications through the coordinator.
    pub async fn replay_dead_letters(&self) -> CoreResult<ReplayReport> {
        self.dead_letters.replay(&self.coordinator).await
    }

    /// Drain the queue, stop the workers, then close both stores.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.coordinator.close_stores().await;
        info!("Sync runtime stopped");
    }
}
