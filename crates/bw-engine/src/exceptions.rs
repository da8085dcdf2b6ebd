//! Tracker exception records
//!
//! User overrides keyed by tracker id, cached in memory and persisted as one
//! JSON array. Every change notifies [`EXCEPTIONS_TOPIC`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bw_core::{normalize_hostname, trust, Category, ExceptionRecord, Stance};
use log::{debug, error, warn};

use crate::error::StorageError;
use crate::observer::{Observers, Subscription};
use crate::storage::Storage;

pub const EXCEPTIONS_TOPIC: &str = "exceptions";

/// Storage key of the persisted records.
pub const EXCEPTIONS_KEY: &str = "exceptions";

/// Per-site override chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStance {
    Trusted,
    Blocked,
}

pub struct ExceptionStore {
    records: Mutex<BTreeMap<String, ExceptionRecord>>,
    storage: Arc<dyn Storage>,
    observers: Observers,
}

impl ExceptionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            storage,
            observers: Observers::new(),
        }
    }

    /// Replace the cache with the persisted records. Returns how many were
    /// loaded; unreadable data loads nothing.
    pub async fn load(&self) -> usize {
        let records: Vec<ExceptionRecord> = match self.storage.get(EXCEPTIONS_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Discarding persisted exceptions: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load exceptions: {}", e);
                Vec::new()
            }
        };

        let count = records.len();
        *self.lock() = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        debug!("Loaded {} exception records", count);
        count
    }

    pub fn get(&self, id: &str) -> Option<ExceptionRecord> {
        self.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<ExceptionRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.observers.subscribe(EXCEPTIONS_TOPIC, handler)
    }

    /// Store `record`, dropping it instead when it carries no override.
    pub async fn put(&self, record: ExceptionRecord) {
        let id = record.id.clone();
        self.modify(&id, move |current| *current = record).await;
    }

    /// Flip the global override for `id`.
    pub async fn toggle_overwrite(&self, id: &str) -> ExceptionRecord {
        self.modify(id, |record| record.overwrite_status = !record.overwrite_status)
            .await
    }

    /// Trust or block `site` for `id`. The site is removed from the opposite
    /// set so the two sets stay disjoint.
    pub async fn set_site_stance(&self, id: &str, site: &str, stance: SiteStance) -> ExceptionRecord {
        let site = normalize_hostname(site);
        self.modify(id, move |record| match stance {
            SiteStance::Trusted => {
                record.blocked_domains.remove(&site);
                record.trusted_domains.insert(site);
            }
            SiteStance::Blocked => {
                record.trusted_domains.remove(&site);
                record.blocked_domains.insert(site);
            }
        })
        .await
    }

    /// Drop any per-site override of `site` for `id`.
    pub async fn clear_site(&self, id: &str, site: &str) -> ExceptionRecord {
        let site = normalize_hostname(site);
        self.modify(id, move |record| {
            record.blocked_domains.remove(&site);
            record.trusted_domains.remove(&site);
        })
        .await
    }

    pub async fn remove(&self, id: &str) {
        let removed = self.lock().remove(id).is_some();
        if removed {
            self.persist().await;
            self.observers.notify(EXCEPTIONS_TOPIC);
        }
    }

    /// Drop every record, in memory and in storage.
    pub async fn clear(&self) {
        self.lock().clear();
        self.persist().await;
        self.observers.notify(EXCEPTIONS_TOPIC);
    }

    pub fn resolve(&self, site: &str, category: Category, id: &str) -> Stance {
        let records = self.lock();
        trust::resolve(site, category, records.get(id))
    }

    pub fn is_trusted(&self, site: &str, category: Category, id: &str) -> bool {
        self.resolve(site, category, id).trusted
    }

    async fn modify<F>(&self, id: &str, change: F) -> ExceptionRecord
    where
        F: FnOnce(&mut ExceptionRecord),
    {
        let record = {
            let mut records = self.lock();
            let mut record = records
                .get(id)
                .cloned()
                .unwrap_or_else(|| ExceptionRecord::new(id));
            change(&mut record);
            record.id = id.to_string();

            if record.is_noop() {
                records.remove(id);
            } else {
                records.insert(id.to_string(), record.clone());
            }
            record
        };

        self.persist().await;
        self.observers.notify(EXCEPTIONS_TOPIC);
        record
    }

    async fn persist(&self) {
        let bytes = {
            let records = self.lock();
            match serde_json::to_vec(&records.values().collect::<Vec<_>>()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Failed to serialize exceptions: {}", e);
                    return;
                }
            }
        };

        match self.storage.set(EXCEPTIONS_KEY, bytes).await {
            Ok(()) => {}
            Err(e @ StorageError::Unavailable(_)) => debug!("Exceptions kept in memory only: {}", e),
            Err(e) => error!("Failed to persist exceptions: {}", e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ExceptionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
