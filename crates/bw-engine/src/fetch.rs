//! Remote resource fetching
//!
//! Manifests, list bodies, diffs, snapshots and resource bundles all come
//! through a [`Fetcher`]. `HttpFetcher` serves `http(s)://` through `reqwest`
//! and `file://` from the local filesystem (handy for manifests built with the
//! CLI). `StaticFetcher` serves canned responses for offline use and tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;

use crate::error::FetchError;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes(url).await?;
        String::from_utf8(bytes).map_err(|_| FetchError::InvalidUtf8(url.to_string()))
    }
}

/// Fetch and decode a JSON document.
pub async fn fetch_json<T: DeserializeOwned>(fetcher: &dyn Fetcher, url: &str) -> Result<T, FetchError> {
    let bytes = fetcher.fetch_bytes(url).await?;
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Json {
        url: url.to_string(),
        source,
    })
}

// =============================================================================
// HTTP
// =============================================================================

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("Blockwarden/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            debug!("Reading {}", path);
            return tokio::fs::read(path).await.map_err(|source| FetchError::Io {
                url: url.to_string(),
                source,
            });
        }

        debug!("Fetching {}", url);
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

// =============================================================================
// Static responses
// =============================================================================

/// Serves responses registered up front and records every request.
#[derive(Default)]
pub struct StaticFetcher {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    /// Every url requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());

        // Behave like a real network call and suspend once.
        tokio::task::yield_now().await;

        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}
