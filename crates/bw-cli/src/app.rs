//! Wiring of the engine lifecycle from a [`Config`].

use std::sync::Arc;

use bw_core::FilterSet;
use bw_engine::{
    Config, EngineComposer, EngineStore, EngineUpdater, ExceptionStore, FallbackStorage, FileStorage,
    HttpFetcher, MemoryStorage, Storage, StoreOptions,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<EngineStore<FilterSet>>,
    pub updater: Arc<EngineUpdater<FilterSet>>,
    pub composer: Arc<EngineComposer<FilterSet>>,
    pub exceptions: ExceptionStore,
    queue_worker: JoinHandle<()>,
}

impl App {
    /// Must be called from within a tokio runtime.
    pub async fn start(config: Config) -> Result<Self, String> {
        let config = Arc::new(config);

        let storage: Arc<dyn Storage> = match &config.storage_dir {
            Some(dir) => Arc::new(FallbackStorage::new(
                Arc::new(FileStorage::new(dir)),
                Arc::new(MemoryStorage::new()),
            )),
            None => Arc::new(MemoryStorage::new()),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(
            EngineStore::new(
                storage.clone(),
                StoreOptions {
                    bundle_dir: config.bundle_dir.clone(),
                    environment: config.environment.clone(),
                },
            )
            .with_update_queue(tx),
        );

        let fetcher = HttpFetcher::new(config.request_timeout())
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        let updater = Arc::new(EngineUpdater::new(store.clone(), Arc::new(fetcher), config.clone()));
        let queue_worker = updater.process_queue(rx);

        let composer = Arc::new(EngineComposer::new(
            updater.clone(),
            config.enabled_engines.clone(),
            config.freshness_interval(),
        ));

        let exceptions = ExceptionStore::new(storage);
        exceptions.load().await;

        Ok(Self {
            config,
            store,
            updater,
            composer,
            exceptions,
            queue_worker,
        })
    }

    /// Stop background work. Queued updates that have not started are dropped.
    pub fn shutdown(self) {
        self.queue_worker.abort();
    }
}
