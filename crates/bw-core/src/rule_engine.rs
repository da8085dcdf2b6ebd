//! Compiled ruleset capability
//!
//! The lifecycle manager treats the compiled body of an engine as opaque and
//! only talks to it through [`RuleEngine`]. [`FilterSet`] is the reference
//! implementation: it keeps normalized filter lines and the resource bundle,
//! which is all the lifecycle needs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::diff::{list_lines, Diff};
use crate::filter::Filter;
use crate::types::Environment;

/// Compiled ruleset operations used by the engine lifecycle.
pub trait RuleEngine: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// An engine containing no rules.
    fn empty(env: &Environment) -> Self;

    fn deserialize(bytes: &[u8]) -> Result<Self, Self::Error>;

    fn serialize(&self) -> Result<Vec<u8>, Self::Error>;

    /// Combine several engines into one.
    fn merge(engines: &[&Self]) -> Self;

    /// Apply a cumulative diff. Returns whether any rule changed.
    fn update_from_diff(&mut self, diff: &Diff, env: &Environment) -> bool;

    /// Re-condition the ruleset on a new environment.
    fn update_env(&mut self, env: &Environment);

    /// Replace the shared resource bundle (redirect payloads, scriptlets).
    fn update_resources(&mut self, body: &str);

    /// Number of rules, for logging.
    fn rule_count(&self) -> usize;
}

/// Reference engine backed by the set of normalized filter lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    filters: BTreeSet<String>,
    #[serde(default)]
    resources: Option<String>,
    #[serde(default)]
    env: Environment,
}

impl FilterSet {
    /// Build from filter list text.
    pub fn from_text(text: &str, env: &Environment) -> Self {
        let mut set = Self::empty(env);
        set.update_from_diff(&Diff::from_list_text(text), env);
        set
    }

    pub fn contains(&self, line: &str) -> bool {
        self.filters.contains(line.trim())
    }

    /// Normalized filter lines, in sorted order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    /// Lines that parse into the filter model. Lines using syntax the model
    /// does not cover are skipped.
    pub fn filters(&self) -> impl Iterator<Item = Filter> + '_ {
        self.filters.iter().filter_map(|line| line.parse().ok())
    }

    pub fn resources(&self) -> Option<&str> {
        self.resources.as_deref()
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }
}

impl RuleEngine for FilterSet {
    type Error = serde_json::Error;

    fn empty(env: &Environment) -> Self {
        Self {
            filters: BTreeSet::new(),
            resources: None,
            env: env.clone(),
        }
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, Self::Error> {
        serde_json::from_slice(bytes)
    }

    fn serialize(&self) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(self)
    }

    fn merge(engines: &[&Self]) -> Self {
        let mut merged = Self::default();
        for engine in engines {
            merged.filters.extend(engine.filters.iter().cloned());
            if merged.resources.is_none() {
                merged.resources = engine.resources.clone();
            }
        }
        if let Some(first) = engines.first() {
            merged.env = first.env.clone();
        }
        merged
    }

    fn update_from_diff(&mut self, diff: &Diff, env: &Environment) -> bool {
        if *env != self.env {
            self.env = env.clone();
        }

        let mut changed = false;
        for line in diff.removed.iter().flat_map(|line| list_lines(line)) {
            changed |= self.filters.remove(line);
        }
        for line in diff.added.iter().flat_map(|line| list_lines(line)) {
            changed |= self.filters.insert(line.to_string());
        }
        changed
    }

    fn update_env(&mut self, env: &Environment) {
        self.env = env.clone();
    }

    fn update_resources(&mut self, body: &str) {
        self.resources = Some(body.to_string());
    }

    fn rule_count(&self) -> usize {
        self.filters.len()
    }
}
