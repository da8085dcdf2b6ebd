//! Engine store
//!
//! Owns the in-memory registry of engines and keeps it in step with durable
//! storage. Lookups go memory -> storage -> bundled file; the first hit wins
//! and backfills the faster tiers. Every mutation writes through to storage and
//! then notifies the observers of the engine's name.
//!
//! Engines are shared as `Arc<Engine>` and replaced by swapping the `Arc`, so a
//! reader holding an engine never sees it change underneath.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bw_core::{Diff, Engine, Environment, RuleEngine};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::error::StorageError;
use crate::observer::{Observers, Subscription};
use crate::storage::{engine_key, Storage};

/// Store-wide settings.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Directory of `<name>.engine` blobs shipped with the install.
    pub bundle_dir: Option<PathBuf>,
    /// Environment every engine in this store is conditioned on.
    pub environment: Environment,
}

/// Options for [`EngineStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Defaults to the store environment.
    pub environment: Option<Environment>,
    pub lists: BTreeMap<String, String>,
    /// Initial filter lines.
    pub filters: Vec<String>,
}

/// Argument of [`EngineStore::replace`].
pub enum Replacement<R> {
    One(Engine<R>),
    /// Merged into one engine before replacing.
    Many(Vec<Arc<Engine<R>>>),
}

impl<R> From<Engine<R>> for Replacement<R> {
    fn from(engine: Engine<R>) -> Self {
        Self::One(engine)
    }
}

pub struct EngineStore<R: RuleEngine> {
    engines: RwLock<HashMap<String, Arc<Engine<R>>>>,
    storage: Arc<dyn Storage>,
    options: StoreOptions,
    observers: Observers,
    memory_only: AtomicBool,
    update_queue: Option<mpsc::UnboundedSender<String>>,
}

impl<R: RuleEngine> EngineStore<R> {
    pub fn new(storage: Arc<dyn Storage>, options: StoreOptions) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            storage,
            options,
            observers: Observers::new(),
            memory_only: AtomicBool::new(false),
            update_queue: None,
        }
    }

    /// Engines loaded from the bundle are announced on `queue` so the owner
    /// can schedule an update for them.
    pub fn with_update_queue(mut self, queue: mpsc::UnboundedSender<String>) -> Self {
        self.update_queue = Some(queue);
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.options.environment
    }

    /// True once storage reported itself unavailable for this session.
    pub fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::Relaxed)
    }

    pub fn subscribe<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.observers.subscribe(name, handler)
    }

    /// In-memory engine, if loaded.
    pub async fn get(&self, name: &str) -> Option<Arc<Engine<R>>> {
        self.engines.read().await.get(name).cloned()
    }

    /// Engine from memory or durable storage, never from the bundle.
    pub async fn persisted(&self, name: &str) -> Option<Arc<Engine<R>>> {
        if let Some(engine) = self.get(name).await {
            return Some(engine);
        }
        let engine = self.read_storage(name).await?;
        Some(self.adopt(name, engine, false).await)
    }

    /// Engine from memory, durable storage or the bundled file, in that order.
    pub async fn init(&self, name: &str) -> Option<Arc<Engine<R>>> {
        if let Some(engine) = self.persisted(name).await {
            return Some(engine);
        }

        let engine = self.read_bundle(name).await?;
        info!("Loaded engine '{}' from bundled file ({} rules)", name, engine.rules.rule_count());
        let engine = self.adopt(name, engine, true).await;
        self.schedule_update(name);
        Some(engine)
    }

    /// Create and store an empty engine (optionally seeded with filters).
    pub async fn create(&self, name: &str, options: CreateOptions) -> Arc<Engine<R>> {
        let environment = options
            .environment
            .unwrap_or_else(|| self.options.environment.clone());

        let mut engine = Engine::<R>::empty(name, environment);
        engine.lists = options.lists;
        if !options.filters.is_empty() {
            let diff = Diff {
                added: options.filters,
                removed: Vec::new(),
            };
            engine.rules.update_from_diff(&diff, &engine.environment);
        }

        self.commit(engine).await
    }

    pub async fn replace(&self, name: &str, replacement: impl Into<Replacement<R>>) -> Arc<Engine<R>> {
        let engine = match replacement.into() {
            Replacement::One(mut engine) => {
                engine.name = name.to_string();
                engine
            }
            Replacement::Many(engines) => {
                let refs: Vec<&Engine<R>> = engines.iter().map(Arc::as_ref).collect();
                Engine::merge(name, &refs)
            }
        };
        self.commit(engine).await
    }

    pub async fn remove(&self, name: &str) {
        self.engines.write().await.remove(name);

        if !self.is_memory_only() {
            match self.storage.delete(&engine_key(name)).await {
                Ok(()) => {}
                Err(e @ StorageError::Unavailable(_)) => self.go_memory_only(&e),
                Err(e) => error!("Failed to delete engine '{}' from storage: {}", name, e),
            }
        }

        info!("Removed engine '{}'", name);
        self.observers.notify(name);
    }

    /// Drop every in-memory engine. Durable storage is untouched.
    pub async fn clear(&self) {
        self.engines.write().await.clear();
    }

    pub async fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn commit(&self, engine: Engine<R>) -> Arc<Engine<R>> {
        let name = engine.name.clone();
        let engine = Arc::new(engine);
        self.engines.write().await.insert(name.clone(), Arc::clone(&engine));
        self.persist(&engine).await;
        self.observers.notify(&name);
        engine
    }

    /// Register a loaded engine, keeping an instance another task registered
    /// first so there is only ever one per name.
    async fn adopt(&self, name: &str, mut engine: Engine<R>, persist: bool) -> Arc<Engine<R>> {
        engine.name = name.to_string();
        let env_changed = engine.apply_environment(&self.options.environment);
        if env_changed {
            debug!("Engine '{}' re-conditioned on the current environment", name);
        }

        let engine = {
            let mut engines = self.engines.write().await;
            if let Some(existing) = engines.get(name) {
                return Arc::clone(existing);
            }
            let engine = Arc::new(engine);
            engines.insert(name.to_string(), Arc::clone(&engine));
            engine
        };

        if persist || env_changed {
            self.persist(&engine).await;
        }
        engine
    }

    async fn persist(&self, engine: &Engine<R>) {
        if self.is_memory_only() {
            debug!("Engine '{}' kept in memory only", engine.name);
            return;
        }

        let bytes = match engine.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize engine '{}': {}", engine.name, e);
                return;
            }
        };

        match self.storage.set(&engine_key(&engine.name), bytes).await {
            Ok(()) => debug!("Persisted engine '{}'", engine.name),
            Err(e @ StorageError::Unavailable(_)) => self.go_memory_only(&e),
            Err(e) => error!("Failed to persist engine '{}': {}", engine.name, e),
        }
    }

    async fn read_storage(&self, name: &str) -> Option<Engine<R>> {
        if self.is_memory_only() {
            return None;
        }

        match self.storage.get(&engine_key(name)).await {
            Ok(Some(bytes)) => match Engine::from_bytes(&bytes) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    warn!("Discarding persisted engine '{}': {}", name, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e @ StorageError::Unavailable(_)) => {
                self.go_memory_only(&e);
                None
            }
            Err(e) => {
                error!("Failed to read engine '{}' from storage: {}", name, e);
                None
            }
        }
    }

    async fn read_bundle(&self, name: &str) -> Option<Engine<R>> {
        let dir = self.options.bundle_dir.as_ref()?;
        let path = dir.join(format!("{name}.engine"));

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No bundled engine at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read bundled engine {}: {}", path.display(), e);
                return None;
            }
        };

        match Engine::from_bytes(&bytes) {
            Ok(engine) => Some(engine),
            Err(e) => {
                warn!("Invalid bundled engine {}: {}", path.display(), e);
                None
            }
        }
    }

    fn go_memory_only(&self, reason: &StorageError) {
        if !self.memory_only.swap(true, Ordering::Relaxed) {
            warn!("Engines are memory-only for this session: {}", reason);
        }
    }

    fn schedule_update(&self, name: &str) {
        if let Some(queue) = &self.update_queue {
            if queue.send(name.to_string()).is_err() {
                debug!("Update queue closed, not scheduling '{}'", name);
            }
        }
    }
}

/// Current time as unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::UnavailableStorage;
    use crate::storage::MemoryStorage;
    use bw_core::FilterSet;
    use std::sync::atomic::AtomicUsize;

    fn store(storage: Arc<dyn Storage>) -> EngineStore<FilterSet> {
        EngineStore::new(storage, StoreOptions::default())
    }

    fn filters(lines: &[&str]) -> CreateOptions {
        CreateOptions {
            filters: lines.iter().map(|s| s.to_string()).collect(),
            ..CreateOptions::default()
        }
    }

    fn bundle_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bw-bundle-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_create_writes_through_and_notifies() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store(storage.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = store.subscribe("ads", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let engine = store.create("ads", filters(&["||a.com^"])).await;
        assert!(engine.rules.contains("||a.com^"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let bytes = storage.get(&engine_key("ads")).await.unwrap().unwrap();
        let persisted = Engine::<FilterSet>::from_bytes(&bytes).unwrap();
        assert!(persisted.rules.contains("||a.com^"));
    }

    #[tokio::test]
    async fn test_init_reads_storage_after_clear() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store(storage);
        store.create("ads", filters(&["||a.com^"])).await;

        store.clear().await;
        assert!(store.get("ads").await.is_none());

        let engine = store.init("ads").await.expect("engine from storage");
        assert!(engine.rules.contains("||a.com^"));
        assert!(store.get("ads").await.is_some());
    }

    #[tokio::test]
    async fn test_init_from_bundle_persists_and_schedules_update() {
        let dir = bundle_dir("init");
        let env = Environment::new();
        let mut bundled = Engine::<FilterSet>::empty("ads", env.clone());
        bundled.rules = FilterSet::from_text("||bundled.com^", &env);
        bundled.lists.insert("easylist".into(), "c0".into());
        std::fs::write(dir.join("ads.engine"), bundled.to_bytes().unwrap()).unwrap();

        let storage = Arc::new(MemoryStorage::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = EngineStore::<FilterSet>::new(
            storage.clone(),
            StoreOptions {
                bundle_dir: Some(dir.clone()),
                environment: env,
            },
        )
        .with_update_queue(tx);

        let engine = store.init("ads").await.expect("engine from bundle");
        assert_eq!(engine.lists.get("easylist").map(String::as_str), Some("c0"));
        assert!(storage.get(&engine_key("ads")).await.unwrap().is_some());
        assert_eq!(rx.try_recv().ok().as_deref(), Some("ads"));

        // Second init is served from memory without touching the bundle.
        std::fs::remove_file(dir.join("ads.engine")).unwrap();
        assert!(store.init("ads").await.is_some());
        assert!(rx.try_recv().is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_init_missing_everywhere() {
        let store = store(Arc::new(MemoryStorage::new()));
        assert!(store.init("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_init_applies_current_environment() {
        let storage = Arc::new(MemoryStorage::new());
        let old = EngineStore::<FilterSet>::new(
            storage.clone(),
            StoreOptions {
                bundle_dir: None,
                environment: Environment::new().with("platform", "chromium"),
            },
        );
        old.create("ads", filters(&["||a.com^"])).await;

        let env = Environment::new().with("platform", "firefox");
        let current = EngineStore::<FilterSet>::new(
            storage,
            StoreOptions {
                bundle_dir: None,
                environment: env.clone(),
            },
        );
        let engine = current.init("ads").await.unwrap();
        assert_eq!(engine.environment, env);
        assert_eq!(engine.rules.environment(), &env);
    }

    #[tokio::test]
    async fn test_replace_many_merges() {
        let store = store(Arc::new(MemoryStorage::new()));
        let a = store.create("a", filters(&["||a.com^"])).await;
        let b = store.create("b", filters(&["||b.com^"])).await;

        let main = store.replace("main", Replacement::Many(vec![a, b])).await;
        assert_eq!(main.name, "main");
        assert_eq!(main.rules.rule_count(), 2);
    }

    #[tokio::test]
    async fn test_replace_swaps_instance() {
        let store = store(Arc::new(MemoryStorage::new()));
        let before = store.create("ads", filters(&["||a.com^"])).await;

        let mut next = (*before).clone();
        next.rules.update_from_diff(
            &Diff { added: vec!["||b.com^".into()], removed: vec![] },
            &Environment::new(),
        );
        let after = store.replace("ads", next).await;

        assert_eq!(before.rules.rule_count(), 1);
        assert_eq!(after.rules.rule_count(), 2);
        assert!(Arc::ptr_eq(&after, &store.get("ads").await.unwrap()));
    }

    #[tokio::test]
    async fn test_remove_deletes_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store(storage.clone());
        store.create("region-de", CreateOptions::default()).await;
        store.remove("region-de").await;

        assert!(store.get("region-de").await.is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_storage_degrades_to_memory() {
        let store = store(Arc::new(UnavailableStorage));
        let engine = store.create("ads", filters(&["||a.com^"])).await;

        assert!(store.is_memory_only());
        assert!(Arc::ptr_eq(&engine, &store.init("ads").await.unwrap()));
    }

    #[tokio::test]
    async fn test_corrupt_storage_entry_is_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(&engine_key("ads"), b"garbage".to_vec()).await.unwrap();
        let store = store(storage);
        assert!(store.init("ads").await.is_none());
    }
}
