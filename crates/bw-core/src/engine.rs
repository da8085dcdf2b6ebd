//! Named, versioned engines
//!
//! An engine pairs a compiled ruleset with the bookkeeping the updater needs:
//! which list checksums it incorporates, which resource bundle it carries and
//! which environment it was compiled for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::blob::{self, BlobError};
use crate::rule_engine::RuleEngine;
use crate::types::Environment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engine<R> {
    pub name: String,
    /// Source list name -> checksum currently incorporated
    pub lists: BTreeMap<String, String>,
    pub resources_checksum: Option<String>,
    pub environment: Environment,
    /// Unix seconds of the last successful update or composition
    pub updated_at: Option<u64>,
    pub rules: R,
}

/// Metadata section of a persisted engine.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EngineMeta {
    name: String,
    #[serde(default)]
    lists: BTreeMap<String, String>,
    #[serde(default)]
    resources_checksum: Option<String>,
    #[serde(default)]
    environment: Environment,
    #[serde(default)]
    updated_at: Option<u64>,
}

impl<R: RuleEngine> Engine<R> {
    pub fn empty(name: impl Into<String>, environment: Environment) -> Self {
        Self {
            name: name.into(),
            lists: BTreeMap::new(),
            resources_checksum: None,
            rules: R::empty(&environment),
            environment,
            updated_at: None,
        }
    }

    /// Merge several engines into one named `name`.
    ///
    /// Lists are unioned (a later engine wins on a name clash), the first
    /// resource bundle is kept, and `updated_at` is the oldest of the inputs so
    /// a freshness check on the result is driven by its stalest source.
    pub fn merge(name: impl Into<String>, engines: &[&Engine<R>]) -> Self {
        let rules = R::merge(&engines.iter().map(|e| &e.rules).collect::<Vec<_>>());

        let mut lists = BTreeMap::new();
        for engine in engines {
            lists.extend(engine.lists.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Self {
            name: name.into(),
            lists,
            resources_checksum: engines.iter().find_map(|e| e.resources_checksum.clone()),
            environment: engines
                .first()
                .map(|e| e.environment.clone())
                .unwrap_or_default(),
            updated_at: engines.iter().filter_map(|e| e.updated_at).min(),
            rules,
        }
    }

    /// Re-condition on `environment` if it differs. Returns whether it did.
    pub fn apply_environment(&mut self, environment: &Environment) -> bool {
        if self.environment == *environment {
            return false;
        }
        self.rules.update_env(environment);
        self.environment = environment.clone();
        true
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BlobError> {
        let meta = EngineMeta {
            name: self.name.clone(),
            lists: self.lists.clone(),
            resources_checksum: self.resources_checksum.clone(),
            environment: self.environment.clone(),
            updated_at: self.updated_at,
        };
        let meta = serde_json::to_vec(&meta)?;
        let body = self.rules.serialize().map_err(|e| BlobError::Body(Box::new(e)))?;
        Ok(blob::encode(&meta, &body))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BlobError> {
        let (meta, body) = blob::decode(data)?;
        let meta: EngineMeta = serde_json::from_slice(meta)?;
        let rules = R::deserialize(body).map_err(|e| BlobError::Body(Box::new(e)))?;

        Ok(Self {
            name: meta.name,
            lists: meta.lists,
            resources_checksum: meta.resources_checksum,
            environment: meta.environment,
            updated_at: meta.updated_at,
            rules,
        })
    }
}
