//! Line-oriented list diffs
//!
//! A diff moves one list from one checksum to the next. Several diffs are
//! folded into one cumulative diff before they are applied to an engine.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::filter::is_comment_line;

/// `{ added: [...], removed?: [...] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Diff {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

impl Diff {
    /// Stage a full list body as an all-added diff. Blank and comment lines
    /// are dropped.
    pub fn from_list_text(text: &str) -> Self {
        Self {
            added: list_lines(text).map(str::to_string).collect(),
            removed: Vec::new(),
        }
    }

    /// The diff turning `old` into `new`, both full list bodies.
    pub fn between(old: &str, new: &str) -> Self {
        let old: BTreeSet<&str> = list_lines(old).collect();
        let new: BTreeSet<&str> = list_lines(new).collect();
        Self {
            added: new.difference(&old).map(|s| s.to_string()).collect(),
            removed: old.difference(&new).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Fold diffs into one cumulative diff.
    ///
    /// Every added line ends up in `added`, every removed line in `removed`.
    /// When diffs disagree about a line the later diff wins, and within one
    /// diff an addition wins over a removal of the same line.
    pub fn merge_all<I>(diffs: I) -> Self
    where
        I: IntoIterator<Item = Diff>,
    {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();

        for diff in diffs {
            for line in diff.removed {
                added.remove(&line);
                removed.insert(line);
            }
            for line in diff.added {
                removed.remove(&line);
                added.insert(line);
            }
        }

        Self {
            added: added.into_iter().collect(),
            removed: removed.into_iter().collect(),
        }
    }
}

/// Filter lines of a list body, trimmed.
pub fn list_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_comment_line(line))
}
