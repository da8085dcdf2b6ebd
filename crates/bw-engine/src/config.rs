use std::path::{Path, PathBuf};
use std::time::Duration;

use bw_core::manifest::ENGINE_FORMAT_VERSION;
use bw_core::Environment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lifecycle configuration, usually read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Manifest location per engine; `{name}` is replaced by the engine name.
    pub manifest_url_template: String,

    #[serde(default = "default_engine_format_version")]
    pub engine_format_version: u16,

    /// Directory for persisted engines and exceptions. Memory only when unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Directory holding `<name>.engine` blobs shipped with the install.
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,

    #[serde(default = "default_freshness_interval_secs")]
    pub freshness_interval_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub environment: Environment,

    #[serde(default = "default_enabled_engines")]
    pub enabled_engines: Vec<String>,
}

fn default_engine_format_version() -> u16 {
    ENGINE_FORMAT_VERSION
}

fn default_freshness_interval_secs() -> u64 {
    60 * 60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_enabled_engines() -> Vec<String> {
    ["ads", "tracking", "annoyances", "custom-filters"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    pub fn new(manifest_url_template: impl Into<String>) -> Self {
        Self {
            manifest_url_template: manifest_url_template.into(),
            engine_format_version: default_engine_format_version(),
            storage_dir: None,
            bundle_dir: None,
            freshness_interval_secs: default_freshness_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            environment: Environment::default(),
            enabled_engines: default_enabled_engines(),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.manifest_url_template.contains("{name}") {
            return Err(ConfigError::MissingPlaceholder(self.manifest_url_template.clone()));
        }
        Ok(())
    }

    pub fn manifest_url(&self, name: &str) -> String {
        self.manifest_url_template.replace("{name}", name)
    }

    pub fn freshness_interval(&self) -> Duration {
        Duration::from_secs(self.freshness_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
