#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Preference synchronisation engine.
//!
//! Layout: `schema.rs` (setting declarations and constraints), `model.rs`
//! (values, snapshots, change requests), `service.rs` (`PreferenceStore`),
//! `view.rs` (`PreferenceView` projection), `storage.rs` /
//! `persistence.rs` (durable storage and the background writer), and
//! `catalog.rs` (the desktop preference catalog).

pub mod catalog;
pub mod error;
pub mod model;
pub mod persistence;
pub mod schema;
pub mod service;
pub mod storage;
mod validate;
pub mod view;

pub use error::{
    ApplyError, ApplyResult, SchemaError, SchemaResult, StorageError, StorageResult, StoreError,
    StoreResult, ValidationError, ValidationResult, ViewError, ViewResult,
};
pub use model::{ChangeRequest, Environment, Origin, SettingKind, SettingValue, Snapshot};
pub use persistence::{PersistenceHealth, PersistencePolicy};
pub use schema::{
    Constraint, DisplayOffset, LabelFn, LabelRule, Predicate, PreferenceSchema, Setting,
    ValueRange,
};
pub use service::{PreferenceStore, SnapshotStream, StoreOptions, Subscription};
pub use storage::{JsonFileStorage, MemoryStorage, PersistedValues, PreferenceStorage};
pub use view::{DisplayItem, PreferenceView};
