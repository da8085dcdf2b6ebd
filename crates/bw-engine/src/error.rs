//! Error types for the engine lifecycle.

use std::path::PathBuf;

use bw_core::BlobError;

/// Durable storage failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend cannot persist anything in this session
    /// (private browsing, read-only profile, quota disabled).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Network or decoding failure while fetching a remote resource.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to read '{url}': {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No response available for '{0}'")]
    NotFound(String),
    #[error("Response from '{0}' is not valid UTF-8")]
    InvalidUtf8(String),
    #[error("Invalid JSON from '{url}': {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of one update cycle. Never surfaced past `EngineUpdater::update`.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Manifest for '{name}' has no engine snapshot for format version {version}")]
    MissingEngineFormat { name: String, version: u16 },
    #[error("Invalid engine snapshot: {0}")]
    Snapshot(#[from] BlobError),
}

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest_url_template must contain the {{name}} placeholder: {0}")]
    MissingPlaceholder(String),
}
