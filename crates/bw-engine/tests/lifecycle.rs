//! End-to-end lifecycle tests: store, updater and composer wired together
//! against canned network responses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bw_core::{Diff, Engine, Environment, FilterSet, RuleEngine};
use bw_engine::{
    Config, EngineComposer, EngineStore, EngineUpdater, FallbackStorage, MemoryStorage, StaticFetcher,
    Storage, StoreOptions, MAIN_ENGINE,
};

const C0: &str = "! EasyList c0
||ads.example^
||banner.example^$image
example.com##.sponsored
@@||ads.example/allowed^
";

const C1: &str = "! EasyList c1
||ads.example^
||tracker.example^$third-party
example.com##.sponsored
other.com##.promo
@@||ads.example/allowed^
";

struct Harness {
    store: Arc<EngineStore<FilterSet>>,
    fetcher: Arc<StaticFetcher>,
    updater: Arc<EngineUpdater<FilterSet>>,
}

fn harness(storage: Arc<dyn Storage>) -> Harness {
    let store = Arc::new(EngineStore::new(storage, StoreOptions::default()));
    let fetcher = Arc::new(StaticFetcher::new());
    let config = Arc::new(Config::new("https://cdn.test/{name}/manifest.json"));
    let updater = Arc::new(EngineUpdater::new(store.clone(), fetcher.clone(), config));
    Harness { store, fetcher, updater }
}

fn snapshot(name: &str, text: &str, checksum: &str) -> Engine<FilterSet> {
    let env = Environment::new();
    let mut engine = Engine::<FilterSet>::empty(name, env.clone());
    engine.rules = FilterSet::from_text(text, &env);
    engine.lists = BTreeMap::from([("easylist".to_string(), checksum.to_string())]);
    engine
}

fn publish_c1(fetcher: &StaticFetcher, name: &str) {
    fetcher.insert(
        format!("https://cdn.test/{name}/manifest.json"),
        format!(
            r#"{{
                "engines": {{ "1": {{ "url": "https://cdn.test/{name}/engine.bin" }} }},
                "lists": {{
                    "easylist": {{
                        "checksum": "c1",
                        "url": "https://cdn.test/easylist-c1.txt",
                        "diffs": {{ "c0": "https://cdn.test/easylist-c0-c1.json" }}
                    }}
                }}
            }}"#
        ),
    );
    let diff = serde_json::to_vec(&Diff::between(C0, C1)).unwrap();
    fetcher.insert("https://cdn.test/easylist-c0-c1.json", diff);
    fetcher.insert("https://cdn.test/easylist-c1.txt", C1);
}

#[tokio::test]
async fn update_is_idempotent_with_unchanged_manifest() {
    let h = harness(Arc::new(MemoryStorage::new()));
    publish_c1(&h.fetcher, "ads");
    h.store.replace("ads", snapshot("ads", C0, "c0")).await;

    let first = h.updater.update("ads").await.unwrap();
    let again = h.updater.update("ads").await.unwrap();
    let third = h.updater.update("ads").await.unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert!(Arc::ptr_eq(&again, &third));
    assert_eq!(first.lists["easylist"], "c1");
}

#[tokio::test]
async fn diff_update_matches_fresh_snapshot() {
    let h = harness(Arc::new(MemoryStorage::new()));
    publish_c1(&h.fetcher, "ads");
    h.store.replace("ads", snapshot("ads", C0, "c0")).await;

    let updated = h.updater.update("ads").await.unwrap();
    let expected = snapshot("ads", C1, "c1");

    assert_eq!(updated.rules.lines().collect::<Vec<_>>(), expected.rules.lines().collect::<Vec<_>>());
    assert_eq!(updated.lists, expected.lists);
}

#[tokio::test]
async fn retired_list_forces_full_reload() {
    let h = harness(Arc::new(MemoryStorage::new()));
    publish_c1(&h.fetcher, "ads");
    h.fetcher.insert(
        "https://cdn.test/ads/engine.bin",
        snapshot("ads", C1, "c1").to_bytes().unwrap(),
    );

    let mut local = snapshot("ads", C0, "c0");
    local.lists.insert("x".to_string(), "checksum1".to_string());
    h.store.replace("ads", local).await;

    let reloaded = h.updater.update("ads").await.unwrap();
    assert!(!reloaded.lists.contains_key("x"));
    assert!(reloaded.rules.contains("||tracker.example^$third-party"));
    assert!(h
        .fetcher
        .requests()
        .iter()
        .any(|url| url == "https://cdn.test/ads/engine.bin"));
}

#[tokio::test]
async fn composition_fails_open() {
    let h = harness(Arc::new(MemoryStorage::new()));
    let composer = EngineComposer::new(
        h.updater.clone(),
        vec!["ads".into(), "tracking".into()],
        Duration::from_secs(3600),
    );

    assert!(composer.refresh_if_stale(1_000).await);
    let main = h.store.get(MAIN_ENGINE).await.expect("main exists");
    assert_eq!(main.rules.rule_count(), 0);
}

#[tokio::test]
async fn concurrent_updates_share_one_fetch_sequence() {
    let h = harness(Arc::new(MemoryStorage::new()));
    publish_c1(&h.fetcher, MAIN_ENGINE);
    h.store.replace(MAIN_ENGINE, snapshot(MAIN_ENGINE, C0, "c0")).await;

    let (a, b) = tokio::join!(h.updater.update(MAIN_ENGINE), h.updater.update(MAIN_ENGINE));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(
        h.fetcher.requests(),
        [
            "https://cdn.test/main/manifest.json".to_string(),
            "https://cdn.test/easylist-c0-c1.json".to_string(),
        ]
    );
}

#[tokio::test]
async fn engines_survive_restart_through_fallback_storage() {
    let secondary = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn Storage> = Arc::new(FallbackStorage::new(Arc::new(MemoryStorage::new()), secondary));

    let h = harness(storage.clone());
    publish_c1(&h.fetcher, "ads");
    h.store.replace("ads", snapshot("ads", C0, "c0")).await;
    h.updater.update("ads").await.unwrap();

    let restarted = EngineStore::<FilterSet>::new(storage, StoreOptions::default());
    let engine = restarted.init("ads").await.expect("persisted engine");
    assert_eq!(engine.lists["easylist"], "c1");
    assert!(engine.updated_at.is_some());
}
