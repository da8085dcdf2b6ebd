//! Durable storage tiers
//!
//! Engines and exception records are persisted as opaque bytes under string
//! keys. A backend that cannot persist in this session reports
//! [`StorageError::Unavailable`]; [`FallbackStorage`] reacts to that by moving
//! to its secondary tier.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::StorageError;

/// Key/value durable storage.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Storage key of a persisted engine.
pub fn engine_key(name: &str) -> String {
    format!("engine:{name}")
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local storage. Used as the last fallback tier and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

// =============================================================================
// Files
// =============================================================================

/// One file per key under a directory. Writes go through a temporary file
/// and a rename so a crash never leaves a half-written entry behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", file_stem(key)))
    }

    /// Unique per write so concurrent writers of one key never share a file.
    fn temp_path_for(&self, key: &str) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{}.{}-{}.tmp", file_stem(key), std::process::id(), seq))
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// File name for `key`. ASCII alphanumerics, `-` and `.` are kept, every
/// other byte becomes `_XX` (hex), so distinct keys never share a file.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

fn map_io(key: &str, source: std::io::Error) -> StorageError {
    match source.kind() {
        ErrorKind::PermissionDenied => StorageError::Unavailable(format!("{key}: {source}")),
        _ => StorageError::Io {
            key: key.to_string(),
            source,
        },
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(key, e)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| map_io(key, e))?;

        let path = self.path_for(key);
        let tmp = self.temp_path_for(key);
        let written = match tokio::fs::write(&tmp, value).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(map_io(key, e));
        }
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(key, e)),
        }
    }
}

// =============================================================================
// Fallback
// =============================================================================

/// Uses `primary` until it reports [`StorageError::Unavailable`], then
/// switches to `secondary` for the rest of the session.
pub struct FallbackStorage {
    primary: Arc<dyn Storage>,
    secondary: Arc<dyn Storage>,
    primary_unavailable: AtomicBool,
}

impl FallbackStorage {
    pub fn new(primary: Arc<dyn Storage>, secondary: Arc<dyn Storage>) -> Self {
        Self {
            primary,
            secondary,
            primary_unavailable: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.primary_unavailable.load(Ordering::Relaxed)
    }

    fn degrade(&self, reason: &StorageError) {
        if !self.primary_unavailable.swap(true, Ordering::Relaxed) {
            warn!("Primary storage unavailable, using fallback storage: {}", reason);
        }
    }
}

#[async_trait]
impl Storage for FallbackStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if !self.is_degraded() {
            match self.primary.get(key).await {
                Err(e @ StorageError::Unavailable(_)) => self.degrade(&e),
                other => return other,
            }
        }
        self.secondary.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if !self.is_degraded() {
            match self.primary.set(key, value.clone()).await {
                Err(e @ StorageError::Unavailable(_)) => self.degrade(&e),
                other => return other,
            }
        }
        self.secondary.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if !self.is_degraded() {
            match self.primary.delete(key).await {
                Err(e @ StorageError::Unavailable(_)) => self.degrade(&e),
                other => return other,
            }
        }
        self.secondary.delete(key).await
    }
}
