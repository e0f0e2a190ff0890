//! Typed preference values, snapshots, and change payloads.
//!
//! # Design
//! - Pure data carriers shared by the schema, store, and view.
//! - Snapshots are immutable; every accepted change produces a new one with a
//!   higher revision.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value kinds a setting can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKind {
    /// `true` / `false` toggle.
    Boolean,
    /// Signed 64-bit integer.
    Integer,
    /// Finite 64-bit float.
    Float,
    /// Free-form text.
    String,
    /// One of a fixed set of string choices.
    Enum,
    /// UTC instant.
    Timestamp,
}

impl SettingKind {
    /// Render the kind as its lowercase string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Enum => "enum",
            Self::Timestamp => "timestamp",
        }
    }
}

impl Display for SettingKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A typed preference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SettingValue {
    /// Boolean value.
    Boolean(bool),
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Text value.
    String(String),
    /// Enumerated choice.
    Enum(String),
    /// Instant in time.
    Timestamp(DateTime<Utc>),
}

impl SettingValue {
    /// Kind carried by the value.
    #[must_use]
    pub const fn kind(&self) -> SettingKind {
        match self {
            Self::Boolean(_) => SettingKind::Boolean,
            Self::Integer(_) => SettingKind::Integer,
            Self::Float(_) => SettingKind::Float,
            Self::String(_) => SettingKind::String,
            Self::Enum(_) => SettingKind::Enum,
            Self::Timestamp(_) => SettingKind::Timestamp,
        }
    }

    /// Boolean payload, if the value is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer payload, if the value is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric payload widened to `f64` for integers and floats.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Text payload for string and enum values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) | Self::Enum(value) => Some(value),
            _ => None,
        }
    }

    /// Timestamp payload, if the value is a timestamp.
    #[must_use]
    pub const fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    /// Untagged JSON representation used by storage adapters.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(value) => Value::Bool(*value),
            Self::Integer(value) => Value::from(*value),
            Self::Float(value) => Value::from(*value),
            Self::String(value) | Self::Enum(value) => Value::String(value.clone()),
            Self::Timestamp(value) => {
                Value::String(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

impl Display for SettingValue {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => write!(formatter, "{value}"),
            Self::Integer(value) => write!(formatter, "{value}"),
            Self::Float(value) => write!(formatter, "{value}"),
            Self::String(value) | Self::Enum(value) => formatter.write_str(value),
            Self::Timestamp(value) => {
                formatter.write_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<DateTime<Utc>> for SettingValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Immutable mapping from every setting key to its current value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    revision: u64,
    values: BTreeMap<String, SettingValue>,
}

impl Snapshot {
    /// Build a snapshot from explicit values.
    ///
    /// Stores build their own snapshots; this constructor exists for
    /// projecting arbitrary states through a view.
    #[must_use]
    pub fn from_values<K, I>(revision: u64, values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, SettingValue)>,
    {
        Self {
            revision,
            values: values
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        }
    }

    /// Monotonic revision; `0` for the initial snapshot of a store.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Value currently held for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Borrow the full key/value mapping.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, SettingValue> {
        &self.values
    }

    /// Iterate over key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Number of settings captured by the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot carries no settings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Untagged JSON view of every value, as written by storage adapters.
    #[must_use]
    pub fn to_json_map(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect()
    }

    pub(crate) fn with_value(&self, key: &str, value: SettingValue) -> Self {
        let mut values = self.values.clone();
        values.insert(key.to_string(), value);
        Self {
            revision: self.revision + 1,
            values,
        }
    }

    pub(crate) fn replaced_by(&self, values: BTreeMap<String, SettingValue>) -> Self {
        Self {
            revision: self.revision + 1,
            values,
        }
    }
}

/// Provenance attached to every change request, used for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Origin {
    /// Edit performed by the user through a display surface.
    User,
    /// Change emitted by a collaborator (update feed, scheduler, other window).
    System {
        /// Free-form identifier of the emitting collaborator.
        source: String,
    },
}

impl Origin {
    /// Build a system origin for the named collaborator.
    #[must_use]
    pub fn system(source: impl Into<String>) -> Self {
        Self::System {
            source: source.into(),
        }
    }

    /// Label recorded in logs and events.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::User => "user".to_string(),
            Self::System { source } => format!("system:{source}"),
        }
    }
}

/// Proposed mutation of a single setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Target setting.
    pub key: String,
    /// Proposed stored value.
    pub value: SettingValue,
    /// Who asked for the change.
    pub origin: Origin,
}

impl ChangeRequest {
    /// Build a request originating from a user edit.
    #[must_use]
    pub fn user(key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            origin: Origin::User,
        }
    }

    /// Build a request originating from a system collaborator.
    #[must_use]
    pub fn system(
        key: impl Into<String>,
        value: impl Into<SettingValue>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            origin: Origin::system(source),
        }
    }
}

/// Named boolean facts about the host, consumed by constraint predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    flags: BTreeSet<String>,
}

impl Environment {
    /// Environment with no flags set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment with every listed flag set.
    #[must_use]
    pub fn from_flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flags: flags.into_iter().map(Into::into).collect(),
        }
    }

    /// Builder-style helper that sets `flag`.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    /// Set or clear `flag`.
    pub fn set(&mut self, flag: impl Into<String>, enabled: bool) {
        let flag = flag.into();
        if enabled {
            self.flags.insert(flag);
        } else {
            self.flags.remove(&flag);
        }
    }

    /// Whether `flag` is set.
    #[must_use]
    pub fn is_set(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}
