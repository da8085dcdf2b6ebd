//! Blockwarden Core Library
//!
//! Synchronous building blocks shared by the engine lifecycle manager and the
//! tracker exception resolver. Nothing in this crate performs I/O.
//!
//! # Modules
//!
//! - `types`: Categories, environments and exception records
//! - `trust`: Block-or-trust decision for a tracker on a site
//! - `filter`: Network and cosmetic filter model
//! - `negate`: Domain restriction, polarity inversion and exception materialization
//! - `diff`: Line-oriented list diffs and their cumulative merge
//! - `manifest`: Remote list manifest and update planning
//! - `rule_engine`: The compiled ruleset capability and the `FilterSet` engine
//! - `engine`: Named, versioned engines
//! - `blob`: Framed binary format for persisted engines
//! - `dnr`: Conversion of network filters into declarative rules

pub mod blob;
pub mod diff;
pub mod dnr;
pub mod engine;
pub mod filter;
pub mod manifest;
pub mod negate;
pub mod rule_engine;
pub mod trust;
pub mod types;

// Re-export commonly used types
pub use blob::BlobError;
pub use diff::Diff;
pub use dnr::{convert_filters, Conversion, DnrRule};
pub use engine::Engine;
pub use filter::{CosmeticFilter, Filter, FilterError, NetworkFilter, NetworkOption};
pub use manifest::{plan_update, requires_full_reload, ListManifest, UpdatePlan};
pub use negate::{materialize, negate_filter, restrict_filter};
pub use rule_engine::{FilterSet, RuleEngine};
pub use trust::{is_category_blocked_by_default, is_trusted, resolve, Stance, StanceReason};
pub use types::{normalize_hostname, Category, Environment, ExceptionRecord, UnknownCategory};
