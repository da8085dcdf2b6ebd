//! Manifest publishing
//!
//! Lays out everything the updater consumes for one engine under an output
//! directory: list bodies, diffs from the previously published checksums, the
//! resource bundle, a compiled snapshot and the manifest tying them together.
//!
//! ```text
//! <output>/manifest.json
//! <output>/engine-v1.bin
//! <output>/lists/<list>-<checksum>.txt
//! <output>/diffs/<list>-<from>-<to>.json
//! <output>/resources-<checksum>.txt
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use bw_core::manifest::{EngineEntry, ListEntry, ResourcesEntry, ENGINE_FORMAT_VERSION};
use bw_core::{Diff, Engine, Environment, FilterSet, ListManifest, RuleEngine};
use twox_hash::XxHash64;

pub struct PublishOptions {
    pub name: String,
    /// Source lists as (list name, file)
    pub lists: Vec<(String, PathBuf)>,
    pub resources: Option<PathBuf>,
    /// Output directory of the previous publication, used to emit diffs
    pub previous: Option<PathBuf>,
    pub output: PathBuf,
    /// Url the output directory is served from
    pub base_url: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, Default)]
pub struct PublishStats {
    pub lists: usize,
    pub diffs: usize,
    pub rules: usize,
    pub snapshot_bytes: usize,
}

/// Checksum of a list body: xxHash64, hex encoded.
pub fn checksum(text: &str) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(text.as_bytes());
    format!("{:016x}", hasher.finish())
}

pub fn publish(opts: &PublishOptions) -> Result<PublishStats, String> {
    if opts.lists.is_empty() {
        return Err("No input lists specified".to_string());
    }

    let previous = match &opts.previous {
        Some(dir) => Some(read_manifest(&dir.join("manifest.json"))?),
        None => None,
    };

    for sub in ["lists", "diffs"] {
        let dir = opts.output.join(sub);
        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create '{}': {}", dir.display(), e))?;
    }

    let env = &opts.environment;
    let mut engine = Engine::<FilterSet>::empty(opts.name.clone(), env.clone());
    let mut manifest = ListManifest::default();
    let mut stats = PublishStats::default();

    for (list, path) in &opts.lists {
        let text = read_text(path)?;
        let sum = checksum(&text);

        let rel = format!("lists/{list}-{sum}.txt");
        write_file(&opts.output.join(&rel), text.as_bytes())?;
        engine.rules.update_from_diff(&Diff::from_list_text(&text), env);
        engine.lists.insert(list.clone(), sum.clone());

        let mut diffs = BTreeMap::new();
        let old = previous
            .as_ref()
            .and_then(|m| m.lists.get(list))
            .map(|entry| entry.checksum.clone());
        if let (Some(old), Some(prev_dir)) = (old, &opts.previous) {
            if old != sum {
                let old_path = prev_dir.join(format!("lists/{list}-{old}.txt"));
                match fs::read_to_string(&old_path) {
                    Ok(old_text) => {
                        let diff = Diff::between(&old_text, &text);
                        let rel = format!("diffs/{list}-{old}-{sum}.json");
                        let body = serde_json::to_vec(&diff).map_err(|e| format!("Failed to encode diff: {}", e))?;
                        write_file(&opts.output.join(&rel), &body)?;
                        diffs.insert(old, url(&opts.base_url, &rel));
                        stats.diffs += 1;
                    }
                    Err(e) => log::warn!("No previous body for '{}' ({}), publishing without diff", list, e),
                }
            }
        }

        manifest.lists.insert(
            list.clone(),
            ListEntry {
                checksum: sum,
                url: url(&opts.base_url, &rel),
                diffs,
            },
        );
        stats.lists += 1;
    }

    if let Some(path) = &opts.resources {
        let text = read_text(path)?;
        let sum = checksum(&text);
        let rel = format!("resources-{sum}.txt");
        write_file(&opts.output.join(&rel), text.as_bytes())?;
        engine.rules.update_resources(&text);
        engine.resources_checksum = Some(sum.clone());
        manifest.resources = Some(ResourcesEntry {
            checksum: sum,
            url: url(&opts.base_url, &rel),
        });
    }

    let snapshot = engine
        .to_bytes()
        .map_err(|e| format!("Failed to encode snapshot: {}", e))?;
    let rel = format!("engine-v{ENGINE_FORMAT_VERSION}.bin");
    write_file(&opts.output.join(&rel), &snapshot)?;
    manifest.engines.insert(
        ENGINE_FORMAT_VERSION.to_string(),
        EngineEntry {
            url: url(&opts.base_url, &rel),
        },
    );

    let body = serde_json::to_vec_pretty(&manifest).map_err(|e| format!("Failed to encode manifest: {}", e))?;
    write_file(&opts.output.join("manifest.json"), &body)?;

    stats.rules = engine.rules.rule_count();
    stats.snapshot_bytes = snapshot.len();
    Ok(stats)
}

fn url(base: &str, rel: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

fn read_text(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path.display(), e))
}

fn read_manifest(path: &Path) -> Result<ListManifest, String> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|e| format!("Invalid manifest '{}': {}", path.display(), e))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), String> {
    fs::write(path, bytes).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))
}
