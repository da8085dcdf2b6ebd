//! Engine updater
//!
//! Brings a persisted engine up to the checksums published in its manifest,
//! either incrementally (list diffs and new list bodies) or by swapping in the
//! published snapshot when diffs cannot get there. Updates never fail loudly:
//! errors are logged and the stored engine is left as it was.

use std::sync::Arc;

use bw_core::manifest::UpdateStep;
use bw_core::{plan_update, requires_full_reload, Diff, Engine, ListManifest, RuleEngine};
use futures::future::{join_all, try_join_all};
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::UpdateError;
use crate::fetch::{fetch_json, Fetcher};
use crate::single_flight::SingleFlight;
use crate::store::{unix_now, EngineStore};

pub struct EngineUpdater<R: RuleEngine> {
    store: Arc<EngineStore<R>>,
    fetcher: Arc<dyn Fetcher>,
    config: Arc<Config>,
    flight: SingleFlight<String, Option<Arc<Engine<R>>>>,
}

impl<R: RuleEngine> EngineUpdater<R> {
    pub fn new(store: Arc<EngineStore<R>>, fetcher: Arc<dyn Fetcher>, config: Arc<Config>) -> Self {
        Self {
            store,
            fetcher,
            config,
            flight: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &Arc<EngineStore<R>> {
        &self.store
    }

    /// Update `name` against its manifest.
    ///
    /// Concurrent calls for the same engine share one fetch sequence and all
    /// receive its result. Returns `None` when there is no persisted engine to
    /// update or the update failed.
    pub async fn update(&self, name: &str) -> Option<Arc<Engine<R>>> {
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let config = Arc::clone(&self.config);
        let owned = name.to_string();

        self.flight
            .run(name.to_string(), move || async move {
                match run_update(&store, fetcher.as_ref(), &config, &owned).await {
                    Ok(engine) => engine,
                    Err(e) => {
                        error!("Update of engine '{}' failed: {}", owned, e);
                        None
                    }
                }
            })
            .await
    }

    /// Update several engines concurrently. Results are in `names` order.
    pub async fn update_all<S: AsRef<str>>(&self, names: &[S]) -> Vec<Option<Arc<Engine<R>>>> {
        join_all(names.iter().map(|name| self.update(name.as_ref()))).await
    }

    /// Run an update for every name received on `queue` (see
    /// [`EngineStore::with_update_queue`]). The task ends when every sender
    /// is dropped.
    pub fn process_queue(self: &Arc<Self>, mut queue: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(name) = queue.recv().await {
                debug!("Queued update for '{}'", name);
                updater.update(&name).await;
            }
        })
    }
}

async fn run_update<R: RuleEngine>(
    store: &EngineStore<R>,
    fetcher: &dyn Fetcher,
    config: &Config,
    name: &str,
) -> Result<Option<Arc<Engine<R>>>, UpdateError> {
    let Some(current) = store.persisted(name).await else {
        debug!("No persisted engine '{}', skipping update", name);
        return Ok(None);
    };

    let manifest: ListManifest = fetch_json(fetcher, &config.manifest_url(name)).await?;
    let Some(snapshot_url) = manifest.engine_url(config.engine_format_version) else {
        return Err(UpdateError::MissingEngineFormat {
            name: name.to_string(),
            version: config.engine_format_version,
        });
    };

    if requires_full_reload(&current.lists, &manifest) {
        info!("Engine '{}' requires a full reload", name);
        let bytes = fetcher.fetch_bytes(snapshot_url).await?;
        let mut engine = Engine::<R>::from_bytes(&bytes)?;
        engine.apply_environment(store.environment());
        engine.updated_at = Some(unix_now());
        return Ok(Some(store.replace(name, engine).await));
    }

    let plan = plan_update(&current.lists, &manifest);
    let staged = try_join_all(plan.steps.iter().map(|step| fetch_step(fetcher, step))).await?;

    let mut engine = (*current).clone();
    let diff = Diff::merge_all(staged);
    let mut changed = engine.rules.update_from_diff(&diff, store.environment());
    for step in &plan.steps {
        engine.lists.insert(step.list().to_string(), step.checksum().to_string());
    }
    // Checksums advanced even when the diff was a no-op.
    changed |= !plan.is_empty();

    if let Some(resources) = &manifest.resources {
        if engine.resources_checksum.as_deref() != Some(resources.checksum.as_str()) {
            let body = fetcher.fetch_text(&resources.url).await?;
            engine.rules.update_resources(&body);
            engine.resources_checksum = Some(resources.checksum.clone());
            changed = true;
        }
    }

    if !changed {
        debug!("Engine '{}' is up to date", name);
        return Ok(Some(current));
    }

    engine.updated_at = Some(unix_now());
    info!(
        "Updated engine '{}' (+{} -{} lines, {} rules)",
        name,
        diff.added.len(),
        diff.removed.len(),
        engine.rules.rule_count()
    );
    Ok(Some(store.replace(name, engine).await))
}

async fn fetch_step(fetcher: &dyn Fetcher, step: &UpdateStep) -> Result<Diff, UpdateError> {
    let diff = match step {
        UpdateStep::FullList { url, .. } => Diff::from_list_text(&fetcher.fetch_text(url).await?),
        UpdateStep::ListDiff { url, .. } => fetch_json(fetcher, url).await?,
    };
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticFetcher;
    use crate::storage::MemoryStorage;
    use crate::store::{CreateOptions, StoreOptions};
    use bw_core::{Environment, FilterSet};
    use std::collections::BTreeMap;

    const MANIFEST: &str = "https://cdn.test/ads/manifest.json";
    const SNAPSHOT: &str = "https://cdn.test/ads/engine-v1.bin";

    struct Fixture {
        store: Arc<EngineStore<FilterSet>>,
        fetcher: Arc<StaticFetcher>,
        updater: EngineUpdater<FilterSet>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(EngineStore::new(Arc::new(MemoryStorage::new()), StoreOptions::default()));
        let fetcher = Arc::new(StaticFetcher::new());
        let config = Arc::new(Config::new("https://cdn.test/{name}/manifest.json"));
        let updater = EngineUpdater::new(store.clone(), fetcher.clone(), config);
        Fixture { store, fetcher, updater }
    }

    fn lists(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn seed(store: &EngineStore<FilterSet>, filters: &[&str], local: &[(&str, &str)]) -> Arc<Engine<FilterSet>> {
        store
            .create(
                "ads",
                CreateOptions {
                    lists: lists(local),
                    filters: filters.iter().map(|s| s.to_string()).collect(),
                    ..CreateOptions::default()
                },
            )
            .await
    }

    fn publish_manifest(fetcher: &StaticFetcher) {
        fetcher.insert(
            MANIFEST,
            format!(
                r#"{{
                    "engines": {{ "1": {{ "url": "{SNAPSHOT}" }} }},
                    "lists": {{
                        "easylist": {{
                            "checksum": "c2",
                            "url": "https://cdn.test/easylist-c2.txt",
                            "diffs": {{ "c1": "https://cdn.test/easylist-c1-c2.json" }}
                        }},
                        "easyprivacy": {{ "checksum": "p1", "url": "https://cdn.test/easyprivacy-p1.txt" }}
                    }}
                }}"#
            ),
        );
        fetcher.insert(
            "https://cdn.test/easylist-c1-c2.json",
            r#"{"added":["||b.com^"],"removed":["||a.com^"]}"#,
        );
        fetcher.insert("https://cdn.test/easyprivacy-p1.txt", "! EasyPrivacy\n||t.com^\n");
    }

    #[tokio::test]
    async fn test_skips_unknown_engine() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        assert!(f.updater.update("ads").await.is_none());
        assert!(f.fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_update() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        seed(&f.store, &["||a.com^"], &[("easylist", "c1")]).await;

        let engine = f.updater.update("ads").await.expect("updated engine");
        assert_eq!(engine.rules.lines().collect::<Vec<_>>(), ["||b.com^", "||t.com^"]);
        assert_eq!(engine.lists, lists(&[("easylist", "c2"), ("easyprivacy", "p1")]));
        assert!(engine.updated_at.is_some());
        assert!(Arc::ptr_eq(&engine, &f.store.get("ads").await.unwrap()));
        assert!(!f.fetcher.requests().iter().any(|url| url == SNAPSHOT));
    }

    #[tokio::test]
    async fn test_unchanged_manifest_is_idempotent() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        seed(&f.store, &["||a.com^"], &[("easylist", "c1")]).await;

        let first = f.updater.update("ads").await.unwrap();
        let second = f.updater.update("ads").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_full_reload_when_local_list_retired() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        seed(&f.store, &["||old.com^"], &[("retired", "x1")]).await;

        let env = Environment::new();
        let mut snapshot = Engine::<FilterSet>::empty("ads", env.clone());
        snapshot.rules = FilterSet::from_text("||b.com^\n||t.com^", &env);
        snapshot.lists = lists(&[("easylist", "c2"), ("easyprivacy", "p1")]);
        f.fetcher.insert(SNAPSHOT, snapshot.to_bytes().unwrap());

        let engine = f.updater.update("ads").await.expect("reloaded engine");
        assert_eq!(engine.lists, snapshot.lists);
        assert!(!engine.rules.contains("||old.com^"));
        assert!(f.fetcher.requests().iter().any(|url| url == SNAPSHOT));
    }

    #[tokio::test]
    async fn test_missing_engine_format_aborts() {
        let f = fixture();
        f.fetcher.insert(MANIFEST, r#"{"engines": {"7": {"url": "x"}}, "lists": {}}"#);
        let before = seed(&f.store, &["||a.com^"], &[("easylist", "c1")]).await;

        assert!(f.updater.update("ads").await.is_none());
        assert!(Arc::ptr_eq(&before, &f.store.get("ads").await.unwrap()));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_engine_untouched() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        f.fetcher.remove("https://cdn.test/easyprivacy-p1.txt");
        let before = seed(&f.store, &["||a.com^"], &[("easylist", "c1")]).await;

        assert!(f.updater.update("ads").await.is_none());
        let after = f.store.get("ads").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.lists, lists(&[("easylist", "c1")]));
    }

    #[tokio::test]
    async fn test_resources_update() {
        let f = fixture();
        f.fetcher.insert(
            MANIFEST,
            format!(
                r#"{{
                    "engines": {{ "1": {{ "url": "{SNAPSHOT}" }} }},
                    "resources": {{ "checksum": "r2", "url": "https://cdn.test/resources.txt" }}
                }}"#
            ),
        );
        f.fetcher.insert("https://cdn.test/resources.txt", "noop.js application/javascript");
        seed(&f.store, &["||a.com^"], &[]).await;

        let engine = f.updater.update("ads").await.unwrap();
        assert_eq!(engine.resources_checksum.as_deref(), Some("r2"));
        assert_eq!(engine.rules.resources(), Some("noop.js application/javascript"));

        f.fetcher.clear_requests();
        f.updater.update("ads").await.unwrap();
        assert_eq!(f.fetcher.requests(), [MANIFEST]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_share_one_fetch_sequence() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        seed(&f.store, &["||a.com^"], &[("easylist", "c1")]).await;

        let (a, b) = tokio::join!(f.updater.update("ads"), f.updater.update("ads"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.fetcher.requests().iter().filter(|url| *url == MANIFEST).count(), 1);
    }

    #[tokio::test]
    async fn test_process_queue() {
        let f = fixture();
        publish_manifest(&f.fetcher);
        seed(&f.store, &["||a.com^"], &[("easylist", "c1")]).await;

        let updater = Arc::new(f.updater);
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = updater.process_queue(rx);
        tx.send("ads".to_string()).unwrap();
        drop(tx);
        worker.await.unwrap();

        let engine = f.store.get("ads").await.unwrap();
        assert_eq!(engine.lists.get("easylist").map(String::as_str), Some("c2"));
    }
}
