//! Event payload types carried across the preference engine.

use chrono::{DateTime, Utc};

/// Identifier assigned to each event emitted by the bus.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed domain events surfaced by the preference store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A single setting was committed to the store.
    PreferenceChanged {
        /// Snapshot revision produced by the commit.
        revision: u64,
        /// Key of the setting that changed.
        key: String,
        /// Diagnostic label of the actor that requested the change.
        origin: String,
    },
    /// Every setting was restored to its default in one commit.
    PreferencesReset {
        /// Snapshot revision produced by the reset.
        revision: u64,
        /// Diagnostic label of the actor that requested the reset.
        origin: String,
    },
    /// Durable storage rejected a save; the in-memory store stays authoritative.
    PersistenceDegraded {
        /// Revision of the snapshot that failed to persist.
        revision: u64,
        /// Number of save attempts made so far for this snapshot.
        attempts: u32,
        /// Whether the retry budget for this snapshot is spent.
        exhausted: bool,
        /// Rendered storage error.
        message: String,
    },
    /// A save succeeded after one or more failures.
    PersistenceRestored {
        /// Revision of the snapshot that was written.
        revision: u64,
    },
}

impl Event {
    /// Machine-friendly discriminator for transports and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PreferenceChanged { .. } => "preference_changed",
            Self::PreferencesReset { .. } => "preferences_reset",
            Self::PersistenceDegraded { .. } => "persistence_degraded",
            Self::PersistenceRestored { .. } => "persistence_restored",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier assigned by the bus.
    pub id: EventId,
    /// Time at which the event was published.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}
