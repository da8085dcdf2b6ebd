//! Core type definitions for Blockwarden
//!
//! Tracker categories, engine environments and the per-tracker exception
//! records that user overrides are stored as.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Tracker Categories
// =============================================================================

/// Classification of a tracker.
///
/// The category decides the default stance (blocked or trusted) that applies
/// when the user has not overridden it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Advertising,
    Pornvertising,
    Email,
    SiteAnalytics,
    Unidentified,
    /// Missing or undefined classification
    Unknown,
    Essential,
    Consent,
    Hosting,
    Cdn,
    CustomerInteraction,
    AudioVideoPlayer,
    SocialMedia,
    Comments,
    Utilities,
    Extensions,
    Misc,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 17] = [
        Self::Advertising,
        Self::Pornvertising,
        Self::Email,
        Self::SiteAnalytics,
        Self::Unidentified,
        Self::Unknown,
        Self::Essential,
        Self::Consent,
        Self::Hosting,
        Self::Cdn,
        Self::CustomerInteraction,
        Self::AudioVideoPlayer,
        Self::SocialMedia,
        Self::Comments,
        Self::Utilities,
        Self::Extensions,
        Self::Misc,
    ];

    /// Whether trackers of this category are blocked when no exception applies.
    pub const fn blocked_by_default(self) -> bool {
        matches!(
            self,
            Self::Advertising
                | Self::Pornvertising
                | Self::Email
                | Self::SiteAnalytics
                | Self::Unidentified
                | Self::Unknown
        )
    }

    /// Identifier as used by the tracker database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Advertising => "advertising",
            Self::Pornvertising => "pornvertising",
            Self::Email => "email",
            Self::SiteAnalytics => "site_analytics",
            Self::Unidentified => "unidentified",
            Self::Unknown => "unknown",
            Self::Essential => "essential",
            Self::Consent => "consent",
            Self::Hosting => "hosting",
            Self::Cdn => "cdn",
            Self::CustomerInteraction => "customer_interaction",
            Self::AudioVideoPlayer => "audio_video_player",
            Self::SocialMedia => "social_media",
            Self::Comments => "comments",
            Self::Utilities => "utilities",
            Self::Extensions => "extensions",
            Self::Misc => "misc",
        }
    }

    /// Lenient lookup for ids coming from the tracker database.
    ///
    /// An unrecognized id is a caller bug: it panics in debug builds and
    /// degrades to [`Category::Unknown`] (blocked by default) otherwise.
    pub fn from_id(id: &str) -> Self {
        match id.parse() {
            Ok(category) => category,
            Err(err) => {
                debug_assert!(false, "{err}");
                log::error!("{err}; treating tracker as blocked by default");
                Self::Unknown
            }
        }
    }
}

/// Error returned by the strict category parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown tracker category: {0:?}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        if id.is_empty() || id == "undefined" {
            return Ok(Self::Unknown);
        }
        if id == "adult_advertising" {
            return Ok(Self::Pornvertising);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == id)
            .ok_or_else(|| UnknownCategory(id.to_string()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Environment flags a compiled ruleset is conditioned on
/// (platform, experimental filters, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// True when `key` is set to a truthy value (`"true"`, `"1"`, `"on"`).
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true" | "1" | "on"))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// =============================================================================
// Exception Records
// =============================================================================

/// User override for one tracker id (or one bare hostname for unidentified
/// trackers).
///
/// `overwrite_status` inverts the category default on every site. The two
/// domain sets flip that effective default on individual sites; which of the
/// two is consulted depends on the effective default (see [`crate::trust`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionRecord {
    pub id: String,
    #[serde(default)]
    pub overwrite_status: bool,
    #[serde(default, rename = "blocked")]
    pub blocked_domains: BTreeSet<String>,
    #[serde(default, rename = "trusted")]
    pub trusted_domains: BTreeSet<String>,
}

impl ExceptionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_overwrite(mut self, overwrite_status: bool) -> Self {
        self.overwrite_status = overwrite_status;
        self
    }

    pub fn with_blocked<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blocked_domains
            .extend(domains.into_iter().map(|d| normalize_hostname(d.as_ref())));
        self
    }

    pub fn with_trusted<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.trusted_domains
            .extend(domains.into_iter().map(|d| normalize_hostname(d.as_ref())));
        self
    }

    /// A record with no override and no per-site entries carries no information.
    pub fn is_noop(&self) -> bool {
        !self.overwrite_status && self.blocked_domains.is_empty() && self.trusted_domains.is_empty()
    }
}

/// Canonical form of a site hostname: trimmed, lower-case, no trailing dot.
pub fn normalize_hostname(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_by_default_categories() {
        let blocked: Vec<_> = Category::ALL
            .iter()
            .filter(|c| c.blocked_by_default())
            .map(|c| c.as_str())
            .collect();
        assert_eq!(
            blocked,
            ["advertising", "pornvertising", "email", "site_analytics", "unidentified", "unknown"]
        );
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("cdn".parse::<Category>(), Ok(Category::Cdn));
        assert_eq!("".parse::<Category>(), Ok(Category::Unknown));
        assert_eq!("undefined".parse::<Category>(), Ok(Category::Unknown));
        assert_eq!("adult_advertising".parse::<Category>(), Ok(Category::Pornvertising));
        assert!("not_a_category".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_from_id_known() {
        assert_eq!(Category::from_id("site_analytics"), Category::SiteAnalytics);
    }

    #[test]
    fn test_exception_record_json_shape() {
        let record = ExceptionRecord::new("tracker")
            .with_overwrite(true)
            .with_trusted(["Foo.org."]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "tracker",
                "overwriteStatus": true,
                "blocked": [],
                "trusted": ["foo.org"],
            })
        );

        let parsed: ExceptionRecord = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert!(parsed.is_noop());
    }

    #[test]
    fn test_environment_flag() {
        let env = Environment::new().with("platform", "firefox").with("experimental", "true");
        assert!(env.flag("experimental"));
        assert!(!env.flag("platform"));
        assert_eq!(env.get("platform"), Some("firefox"));
    }
}
