//! Remote list manifest and update planning
//!
//! The manifest is fetched per engine and lists, for every source list, the
//! current checksum, the full list url and the diffs published from older
//! checksums. Checksum strings are the only staleness signal: list content is
//! never hashed locally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Engine format version this build can load.
pub const ENGINE_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListManifest {
    /// Compiled snapshots keyed by engine format version.
    #[serde(default)]
    pub engines: BTreeMap<String, EngineEntry>,
    #[serde(default)]
    pub lists: BTreeMap<String, ListEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEntry {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub checksum: String,
    pub url: String,
    /// Diff urls keyed by the checksum they start from.
    #[serde(default)]
    pub diffs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesEntry {
    pub checksum: String,
    pub url: String,
}

impl ListManifest {
    /// Url of the compiled snapshot for `format_version`, if published.
    pub fn engine_url(&self, format_version: u16) -> Option<&str> {
        self.engines
            .get(&format_version.to_string())
            .map(|entry| entry.url.as_str())
    }
}

/// True when the local lists cannot be brought up to date with diffs alone:
/// a local list was retired from the manifest, or a list changed and no diff
/// is published from the local checksum.
pub fn requires_full_reload(local: &BTreeMap<String, String>, manifest: &ListManifest) -> bool {
    local.iter().any(|(name, checksum)| match manifest.lists.get(name) {
        None => true,
        Some(entry) => entry.checksum != *checksum && !entry.diffs.contains_key(checksum),
    })
}

/// One fetch of the incremental update path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStep {
    /// List not tracked locally yet: fetch the full body.
    FullList {
        list: String,
        url: String,
        checksum: String,
    },
    /// Tracked list with a new checksum: fetch the diff from the local checksum.
    ListDiff {
        list: String,
        url: String,
        checksum: String,
    },
}

impl UpdateStep {
    pub fn list(&self) -> &str {
        match self {
            Self::FullList { list, .. } | Self::ListDiff { list, .. } => list,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::FullList { url, .. } | Self::ListDiff { url, .. } => url,
        }
    }

    /// Checksum the list is at once the step is applied.
    pub fn checksum(&self) -> &str {
        match self {
            Self::FullList { checksum, .. } | Self::ListDiff { checksum, .. } => checksum,
        }
    }
}

/// Fetches needed to move the local lists to the manifest's checksums.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    pub steps: Vec<UpdateStep>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Plan the incremental update. Only meaningful when
/// [`requires_full_reload`] is false; lists whose diff is missing are skipped.
pub fn plan_update(local: &BTreeMap<String, String>, manifest: &ListManifest) -> UpdatePlan {
    let mut steps = Vec::new();

    for (list, entry) in &manifest.lists {
        match local.get(list) {
            None => steps.push(UpdateStep::FullList {
                list: list.clone(),
                url: entry.url.clone(),
                checksum: entry.checksum.clone(),
            }),
            Some(current) if *current != entry.checksum => {
                if let Some(url) = entry.diffs.get(current) {
                    steps.push(UpdateStep::ListDiff {
                        list: list.clone(),
                        url: url.clone(),
                        checksum: entry.checksum.clone(),
                    });
                }
            }
            Some(_) => {}
        }
    }

    UpdatePlan { steps }
}
