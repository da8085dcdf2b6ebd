//! Blockwarden Engine Lifecycle
//!
//! Async services that keep filter engines loaded, persisted, up to date and
//! composed, plus the store of user tracker exceptions.
//!
//! # Modules
//!
//! - `store`: In-memory registry backed by durable storage and bundled files
//! - `updater`: Manifest-driven incremental and full engine updates
//! - `composer`: Composition of the `"main"` engine
//! - `exceptions`: Persisted tracker exception records
//! - `convert`: Declarative rule conversion requests
//! - `storage`, `fetch`: Storage and network capabilities
//! - `single_flight`, `observer`: Coalescing and change notification primitives
//! - `config`: Lifecycle configuration

pub mod composer;
pub mod config;
pub mod convert;
pub mod error;
pub mod exceptions;
pub mod fetch;
pub mod observer;
pub mod single_flight;
pub mod storage;
pub mod store;
pub mod updater;

pub use composer::{ComposerWatch, EngineComposer, CUSTOM_FILTERS_ENGINE, MAIN_ENGINE};
pub use config::Config;
pub use convert::DnrConverter;
pub use error::{ConfigError, FetchError, StorageError, UpdateError};
pub use exceptions::{ExceptionStore, SiteStance, EXCEPTIONS_TOPIC};
pub use fetch::{Fetcher, HttpFetcher, StaticFetcher};
pub use observer::{Observers, Subscription};
pub use single_flight::SingleFlight;
pub use storage::{FallbackStorage, FileStorage, MemoryStorage, Storage};
pub use store::{CreateOptions, EngineStore, Replacement, StoreOptions};
pub use updater::EngineUpdater;
