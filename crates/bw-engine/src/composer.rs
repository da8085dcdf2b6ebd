//! Engine composition
//!
//! The `"main"` engine is the merge of every enabled engine. The user's
//! custom filters take part like any other engine when `"custom-filters"` is
//! enabled. `"main"` is rebuilt when the enabled set changes, when custom
//! filters change (see [`EngineComposer::watch`]) and after a refresh.
//!
//! `updated_at` on `"main"` records the last completed refresh check, not the
//! age of its sources, so an unchanged upstream still counts as fresh.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bw_core::diff::list_lines;
use bw_core::{Engine, RuleEngine};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::observer::Subscription;
use crate::store::{CreateOptions, EngineStore};
use crate::updater::EngineUpdater;

pub const MAIN_ENGINE: &str = "main";
pub const CUSTOM_FILTERS_ENGINE: &str = "custom-filters";

pub struct EngineComposer<R: RuleEngine> {
    updater: Arc<EngineUpdater<R>>,
    enabled: Mutex<Vec<String>>,
    freshness_interval: Duration,
}

/// Running custom-filters watcher returned by [`EngineComposer::watch`].
pub struct ComposerWatch {
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl ComposerWatch {
    /// Stop watching and wait for an in-progress recomposition to finish.
    pub async fn stop(self) {
        self.subscription.unsubscribe();
        if let Err(e) = self.task.await {
            warn!("Custom filters watcher ended abnormally: {}", e);
        }
    }
}

impl<R: RuleEngine> EngineComposer<R> {
    pub fn new(updater: Arc<EngineUpdater<R>>, enabled: Vec<String>, freshness_interval: Duration) -> Self {
        Self {
            updater,
            enabled: Mutex::new(enabled),
            freshness_interval,
        }
    }

    pub fn store(&self) -> &Arc<EngineStore<R>> {
        self.updater.store()
    }

    pub fn enabled(&self) -> Vec<String> {
        self.enabled.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rebuild `"main"` from the enabled engines.
    ///
    /// Engines that cannot be loaded are left out. When none can, `"main"` is
    /// an empty engine so that blocking fails open rather than breaking.
    pub async fn reload_main(&self) -> Arc<Engine<R>> {
        let checked_at = self.store().get(MAIN_ENGINE).await.and_then(|main| main.updated_at);
        self.compose(checked_at).await
    }

    async fn compose(&self, checked_at: Option<u64>) -> Arc<Engine<R>> {
        let store = self.store();
        let names = self.enabled();

        let loaded = join_all(names.iter().map(|name| store.init(name))).await;
        let mut engines = Vec::with_capacity(loaded.len());
        for (name, engine) in names.iter().zip(loaded) {
            match engine {
                Some(engine) => engines.push(engine),
                None if name == CUSTOM_FILTERS_ENGINE => debug!("No custom filters to compose"),
                None => warn!("Engine '{}' unavailable, composing without it", name),
            }
        }

        let mut main = if engines.is_empty() {
            warn!("No engine available, '{}' is empty", MAIN_ENGINE);
            Engine::<R>::empty(MAIN_ENGINE, store.environment().clone())
        } else {
            let refs: Vec<&Engine<R>> = engines.iter().map(Arc::as_ref).collect();
            Engine::merge(MAIN_ENGINE, &refs)
        };
        if checked_at.is_some() {
            main.updated_at = checked_at;
        }

        let main = store.replace(MAIN_ENGINE, main).await;
        info!("Composed '{}' ({} rules)", MAIN_ENGINE, main.rules.rule_count());
        main
    }

    /// Change the enabled engines. Engines no longer enabled are dropped from
    /// storage, except the custom filters which only the user can recreate.
    /// Returns whether anything changed.
    pub async fn set_enabled(&self, names: Vec<String>) -> bool {
        let disabled: Vec<String> = {
            let mut enabled = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
            if *enabled == names {
                return false;
            }
            let disabled = enabled
                .iter()
                .filter(|name| !names.contains(name) && name.as_str() != CUSTOM_FILTERS_ENGINE)
                .cloned()
                .collect();
            *enabled = names;
            disabled
        };

        for name in &disabled {
            self.store().remove(name).await;
        }
        self.reload_main().await;
        true
    }

    /// Update every enabled engine and recompose when `"main"` is missing or
    /// its last refresh is older than the freshness interval. `now` is unix
    /// seconds and becomes the refresh time of the recomposed `"main"`, whether
    /// or not any source changed. Returns whether a refresh ran.
    pub async fn refresh_if_stale(&self, now: u64) -> bool {
        let interval = self.freshness_interval.as_secs();
        let stale = match self.store().get(MAIN_ENGINE).await {
            None => true,
            Some(main) => main
                .updated_at
                .map_or(true, |updated_at| now.saturating_sub(updated_at) >= interval),
        };

        if !stale {
            debug!("'{}' is fresh, skipping refresh", MAIN_ENGINE);
            return false;
        }

        let upstream: Vec<String> = self
            .enabled()
            .into_iter()
            .filter(|name| name.as_str() != CUSTOM_FILTERS_ENGINE)
            .collect();
        self.updater.update_all(&upstream).await;
        self.compose(Some(now)).await;
        true
    }

    /// Replace the custom filters engine with the filters in `text`. Empty
    /// text removes it.
    pub async fn set_custom_filters(&self, text: &str) -> Option<Arc<Engine<R>>> {
        let filters: Vec<String> = list_lines(text).map(str::to_string).collect();
        if filters.is_empty() {
            self.store().remove(CUSTOM_FILTERS_ENGINE).await;
            return None;
        }

        let options = CreateOptions {
            filters,
            ..CreateOptions::default()
        };
        Some(self.store().create(CUSTOM_FILTERS_ENGINE, options).await)
    }

    /// Recompose `"main"` whenever the custom filters engine changes.
    /// Bursts of changes are coalesced into one recomposition.
    pub fn watch(self: &Arc<Self>) -> ComposerWatch {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let subscription = self.store().subscribe(CUSTOM_FILTERS_ENGINE, move |_| {
            let _ = tx.send(());
        });

        let composer = Arc::clone(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                debug!("Custom filters changed, recomposing");
                composer.reload_main().await;
            }
        });

        ComposerWatch { subscription, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fetch::StaticFetcher;
    use crate::storage::{engine_key, MemoryStorage, Storage};
    use crate::store::StoreOptions;
    use bw_core::FilterSet;
    use tokio::sync::Notify;

    fn composer(storage: Arc<MemoryStorage>, enabled: &[&str]) -> Arc<EngineComposer<FilterSet>> {
        composer_with(storage, Arc::new(StaticFetcher::new()), enabled)
    }

    fn composer_with(
        storage: Arc<MemoryStorage>,
        fetcher: Arc<StaticFetcher>,
        enabled: &[&str],
    ) -> Arc<EngineComposer<FilterSet>> {
        let store = Arc::new(EngineStore::new(storage, StoreOptions::default()));
        let config = Arc::new(Config::new("https://cdn.test/{name}/manifest.json"));
        let updater = Arc::new(EngineUpdater::new(store, fetcher, config));
        Arc::new(EngineComposer::new(
            updater,
            enabled.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(3600),
        ))
    }

    async fn seed(composer: &EngineComposer<FilterSet>, name: &str, filter: &str) {
        let options = CreateOptions {
            filters: vec![filter.to_string()],
            ..CreateOptions::default()
        };
        composer.store().create(name, options).await;
    }

    #[tokio::test]
    async fn test_reload_main_merges_enabled() {
        let composer = composer(Arc::new(MemoryStorage::new()), &["ads", "tracking"]);
        seed(&composer, "ads", "||a.com^").await;
        seed(&composer, "tracking", "||t.com^").await;
        seed(&composer, "annoyances", "##.cookie").await;

        let main = composer.reload_main().await;
        assert!(main.rules.contains("||a.com^"));
        assert!(main.rules.contains("||t.com^"));
        assert!(!main.rules.contains("##.cookie"));
    }

    #[tokio::test]
    async fn test_reload_main_fails_open() {
        let composer = composer(Arc::new(MemoryStorage::new()), &["ads", "tracking"]);
        let main = composer.reload_main().await;
        assert_eq!(main.name, MAIN_ENGINE);
        assert_eq!(main.rules.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_set_enabled_drops_disabled_engines() {
        let storage = Arc::new(MemoryStorage::new());
        let composer = composer(storage.clone(), &["ads", "tracking"]);
        seed(&composer, "ads", "||a.com^").await;
        seed(&composer, "tracking", "||t.com^").await;

        assert!(!composer.set_enabled(vec!["ads".into(), "tracking".into()]).await);
        assert!(composer.set_enabled(vec!["ads".into()]).await);

        assert!(storage.get(&engine_key("tracking")).await.unwrap().is_none());
        let main = composer.store().get(MAIN_ENGINE).await.unwrap();
        assert!(main.rules.contains("||a.com^"));
        assert!(!main.rules.contains("||t.com^"));
    }

    #[tokio::test]
    async fn test_refresh_if_stale() {
        let composer = composer(Arc::new(MemoryStorage::new()), &["ads"]);
        let mut ads = Engine::<FilterSet>::empty("ads", Default::default());
        ads.updated_at = Some(10_000);
        composer.store().replace("ads", ads).await;

        // No main yet.
        assert!(composer.refresh_if_stale(10_000).await);
        assert_eq!(composer.store().get(MAIN_ENGINE).await.unwrap().updated_at, Some(10_000));

        assert!(!composer.refresh_if_stale(10_000 + 3599).await);
        assert!(composer.refresh_if_stale(10_000 + 3600).await);
    }

    #[tokio::test]
    async fn test_refresh_with_unchanged_sources_marks_main_fresh() {
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.insert(
            "https://cdn.test/ads/manifest.json",
            r#"{
                "engines": { "1": { "url": "https://cdn.test/ads/engine-v1.bin" } },
                "lists": { "easylist": { "checksum": "c1", "url": "https://cdn.test/easylist-c1.txt" } }
            }"#,
        );
        let composer = composer_with(Arc::new(MemoryStorage::new()), fetcher.clone(), &["ads"]);
        let mut ads = Engine::<FilterSet>::empty("ads", Default::default());
        ads.lists.insert("easylist".into(), "c1".into());
        ads.updated_at = Some(10_000);
        composer.store().replace("ads", ads).await;

        assert!(composer.refresh_if_stale(17_200).await);
        assert_eq!(fetcher.requests(), ["https://cdn.test/ads/manifest.json"]);
        assert_eq!(composer.store().get("ads").await.unwrap().updated_at, Some(10_000));
        assert_eq!(composer.store().get(MAIN_ENGINE).await.unwrap().updated_at, Some(17_200));

        fetcher.clear_requests();
        assert!(!composer.refresh_if_stale(17_201).await);
        assert!(fetcher.requests().is_empty());

        // Recomposing outside a refresh keeps the refresh time.
        composer.reload_main().await;
        assert!(!composer.refresh_if_stale(17_202).await);
    }

    #[tokio::test]
    async fn test_failed_open_main_is_fresh_after_refresh() {
        let composer = composer(Arc::new(MemoryStorage::new()), &["ads"]);
        assert!(composer.refresh_if_stale(5_000).await);
        let main = composer.store().get(MAIN_ENGINE).await.unwrap();
        assert_eq!(main.rules.rule_count(), 0);
        assert_eq!(main.updated_at, Some(5_000));
        assert!(!composer.refresh_if_stale(5_001).await);
    }

    #[tokio::test]
    async fn test_custom_filters_toggle_keeps_user_filters() {
        let storage = Arc::new(MemoryStorage::new());
        let composer = composer(storage.clone(), &["ads", CUSTOM_FILTERS_ENGINE]);
        seed(&composer, "ads", "||a.com^").await;
        composer.set_custom_filters("||mine.com^").await;
        assert!(composer.reload_main().await.rules.contains("||mine.com^"));

        assert!(composer.set_enabled(vec!["ads".into()]).await);
        let main = composer.store().get(MAIN_ENGINE).await.unwrap();
        assert!(!main.rules.contains("||mine.com^"));
        assert!(main.rules.contains("||a.com^"));
        assert!(storage.get(&engine_key(CUSTOM_FILTERS_ENGINE)).await.unwrap().is_some());

        assert!(composer.set_enabled(vec!["ads".into(), CUSTOM_FILTERS_ENGINE.into()]).await);
        let main = composer.store().get(MAIN_ENGINE).await.unwrap();
        assert!(main.rules.contains("||mine.com^"));
    }

    #[tokio::test]
    async fn test_custom_filters_are_composed() {
        let composer = composer(Arc::new(MemoryStorage::new()), &["ads", CUSTOM_FILTERS_ENGINE]);
        seed(&composer, "ads", "||a.com^").await;

        let custom = composer
            .set_custom_filters("! mine\n||custom.com^\n\nexample.com##.promo")
            .await
            .unwrap();
        assert_eq!(custom.rules.rule_count(), 2);

        let main = composer.reload_main().await;
        assert!(main.rules.contains("||custom.com^"));

        assert!(composer.set_custom_filters("  \n! nothing").await.is_none());
        assert!(!composer.reload_main().await.rules.contains("||custom.com^"));
    }

    #[tokio::test]
    async fn test_watch_recomposes_on_custom_filter_change() {
        let composer = composer(Arc::new(MemoryStorage::new()), &["ads", CUSTOM_FILTERS_ENGINE]);
        seed(&composer, "ads", "||a.com^").await;

        let recomposed = Arc::new(Notify::new());
        let signal = recomposed.clone();
        let _main_sub = composer.store().subscribe(MAIN_ENGINE, move |_| signal.notify_one());

        let watch = composer.watch();
        composer.set_custom_filters("||custom.com^").await;

        tokio::time::timeout(Duration::from_secs(5), recomposed.notified())
            .await
            .expect("main recomposed");
        let main = composer.store().get(MAIN_ENGINE).await.unwrap();
        assert!(main.rules.contains("||custom.com^"));
        assert!(main.rules.contains("||a.com^"));

        watch.stop().await;
    }
}
