//! Tracker trust resolution
//!
//! Blends the category default, the global override flag and the per-site
//! exception lists into one block-or-trust decision. The same function backs
//! cosmetic hiding, network blocking and generated declarative rules so the
//! three enforcement paths never disagree.
//!
//! The effective default is `blocked_by_default XOR overwrite_status`. When the
//! effective default is "blocked" only `trusted_domains` is consulted, when it
//! is "trusted" only `blocked_domains` is; a listed site flips the default.

use crate::types::{normalize_hostname, Category, ExceptionRecord};

/// Why a stance was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanceReason {
    /// No exception record applies
    CategoryDefault,
    /// The global override flag inverted the category default
    GlobalOverride,
    /// The site is listed in the record's relevant domain set
    SiteException,
}

/// Resolved decision for a tracker on a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stance {
    pub trusted: bool,
    pub reason: StanceReason,
}

impl Stance {
    pub const fn is_blocked(&self) -> bool {
        !self.trusted
    }
}

/// Static classification of categories into blocked/trusted by default.
#[inline]
pub fn is_category_blocked_by_default(category: Category) -> bool {
    category.blocked_by_default()
}

/// Resolve the stance for `site`, keeping the reason for logging and UI.
pub fn resolve(site: &str, category: Category, exception: Option<&ExceptionRecord>) -> Stance {
    let blocked_by_default = is_category_blocked_by_default(category);

    let Some(exception) = exception else {
        return Stance {
            trusted: !blocked_by_default,
            reason: StanceReason::CategoryDefault,
        };
    };

    let effective_blocked = blocked_by_default ^ exception.overwrite_status;
    let relevant = if effective_blocked {
        &exception.trusted_domains
    } else {
        &exception.blocked_domains
    };

    let site = normalize_hostname(site);
    if relevant.contains(&site) {
        return Stance {
            trusted: effective_blocked,
            reason: StanceReason::SiteException,
        };
    }

    Stance {
        trusted: !effective_blocked,
        reason: if exception.overwrite_status {
            StanceReason::GlobalOverride
        } else {
            StanceReason::CategoryDefault
        },
    }
}

/// Whether a tracker of `category` is trusted on `site`.
#[inline]
pub fn is_trusted(site: &str, category: Category, exception: Option<&ExceptionRecord>) -> bool {
    resolve(site, category, exception).trusted
}
