//! Preference schema: setting declarations, constraints, and sealing.
//!
//! # Design
//! - Settings are declared with builder-style constructors and registered
//!   into a [`PreferenceSchema`], which is sealed before any store uses it.
//! - Sealing checks every constraint reference so a store never starts with
//!   a dangling rule.
//! - Constraints are pure data or pure functions of a [`Snapshot`] plus the
//!   injected [`Environment`].

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::ops::{Not, RangeInclusive};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{SchemaError, SchemaResult, ValidationError, ValidationResult};
use crate::model::{Environment, SettingKind, SettingValue, Snapshot};
use crate::validate;

/// Permitted numeric domain of a setting.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRange {
    /// Inclusive integer bounds.
    Integer(RangeInclusive<i64>),
    /// Inclusive float bounds.
    Float(RangeInclusive<f64>),
}

/// Boolean rule evaluated against a snapshot and the host environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Always holds.
    Always,
    /// Holds when the boolean setting is `true`.
    IsTrue(String),
    /// Holds when the setting equals the value (strings and enums compare by text).
    Equals(String, SettingValue),
    /// Holds when the setting equals any of the values.
    OneOf(String, Vec<SettingValue>),
    /// Holds when the environment flag is set.
    Flag(String),
    /// Negation.
    Not(Box<Predicate>),
    /// Conjunction; an empty list holds.
    All(Vec<Predicate>),
    /// Disjunction; an empty list does not hold.
    Any(Vec<Predicate>),
}

impl Predicate {
    /// Holds when the boolean setting `key` is `true`.
    #[must_use]
    pub fn is_true(key: impl Into<String>) -> Self {
        Self::IsTrue(key.into())
    }

    /// Holds when the boolean setting `key` is not `true`.
    #[must_use]
    pub fn is_false(key: impl Into<String>) -> Self {
        !Self::is_true(key)
    }

    /// Holds when setting `key` equals `value`.
    #[must_use]
    pub fn equals(key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        Self::Equals(key.into(), value.into())
    }

    /// Holds when setting `key` equals any of `values`.
    #[must_use]
    pub fn one_of<I, V>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SettingValue>,
    {
        Self::OneOf(key.into(), values.into_iter().map(Into::into).collect())
    }

    /// Holds when environment flag `name` is set.
    #[must_use]
    pub fn flag(name: impl Into<String>) -> Self {
        Self::Flag(name.into())
    }

    /// Holds when every predicate holds.
    #[must_use]
    pub fn all(predicates: impl IntoIterator<Item = Self>) -> Self {
        Self::All(predicates.into_iter().collect())
    }

    /// Holds when any predicate holds.
    #[must_use]
    pub fn any(predicates: impl IntoIterator<Item = Self>) -> Self {
        Self::Any(predicates.into_iter().collect())
    }

    /// Evaluate the predicate. Missing keys never satisfy a comparison.
    #[must_use]
    pub fn evaluate(&self, snapshot: &Snapshot, environment: &Environment) -> bool {
        match self {
            Self::Always => true,
            Self::IsTrue(key) => snapshot.get(key).and_then(SettingValue::as_bool) == Some(true),
            Self::Equals(key, expected) => snapshot
                .get(key)
                .is_some_and(|current| values_match(current, expected)),
            Self::OneOf(key, choices) => snapshot.get(key).is_some_and(|current| {
                choices.iter().any(|choice| values_match(current, choice))
            }),
            Self::Flag(name) => environment.is_set(name),
            Self::Not(inner) => !inner.evaluate(snapshot, environment),
            Self::All(inner) => inner.iter().all(|p| p.evaluate(snapshot, environment)),
            Self::Any(inner) => inner.iter().any(|p| p.evaluate(snapshot, environment)),
        }
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Always | Self::Flag(_) => {}
            Self::IsTrue(key) | Self::Equals(key, _) | Self::OneOf(key, _) => out.push(key),
            Self::Not(inner) => inner.collect_references(out),
            Self::All(inner) | Self::Any(inner) => {
                for predicate in inner {
                    predicate.collect_references(out);
                }
            }
        }
    }
}

impl Not for Predicate {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self::Not(Box::new(self))
    }
}

fn values_match(current: &SettingValue, expected: &SettingValue) -> bool {
    match (current.as_str(), expected.as_str()) {
        (Some(left), Some(right)) => left == right,
        _ => current == expected,
    }
}

/// Integer setting stored as `display + offset` and shown as `stored - offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOffset {
    /// Amount subtracted from the stored value for display.
    pub offset: i64,
    /// Smallest displayable value.
    pub min: i64,
    /// Largest displayable value.
    pub max: i64,
}

impl DisplayOffset {
    /// Displayed value for `stored`, clamped to the display bounds.
    #[must_use]
    pub fn to_display(&self, stored: i64) -> i64 {
        stored.saturating_sub(self.offset).clamp(self.min, self.max)
    }

    /// Stored value for a displayed value, or `None` on overflow.
    #[must_use]
    pub const fn to_stored(&self, display: i64) -> Option<i64> {
        display.checked_add(self.offset)
    }

    /// Whether `stored` maps into the display bounds without clamping.
    #[must_use]
    pub fn admits(&self, stored: i64) -> bool {
        stored
            .checked_sub(self.offset)
            .is_some_and(|display| (self.min..=self.max).contains(&display))
    }
}

/// Renders secondary text from a snapshot.
pub type LabelFn = Arc<dyn Fn(&Snapshot) -> Option<String> + Send + Sync>;

/// Rule producing a setting's secondary label.
#[derive(Clone)]
pub enum LabelRule {
    /// Map the setting's own text value to a label.
    Choices {
        /// `(value, label)` pairs checked in order.
        labels: Vec<(String, String)>,
        /// Label used when no pair matches.
        fallback: Option<String>,
    },
    /// Compute the label from arbitrary settings.
    Derived {
        /// Keys the renderer reads; checked when the schema is sealed.
        reads: Vec<String>,
        /// Pure renderer.
        render: LabelFn,
    },
}

impl LabelRule {
    /// Label each listed value of the setting.
    #[must_use]
    pub fn choices<I, V, L>(labels: I) -> Self
    where
        I: IntoIterator<Item = (V, L)>,
        V: Into<String>,
        L: Into<String>,
    {
        Self::Choices {
            labels: labels
                .into_iter()
                .map(|(value, label)| (value.into(), label.into()))
                .collect(),
            fallback: None,
        }
    }

    /// Label derived from the settings named in `reads`.
    #[must_use]
    pub fn derived<I, S, F>(reads: I, render: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Snapshot) -> Option<String> + Send + Sync + 'static,
    {
        Self::Derived {
            reads: reads.into_iter().map(Into::into).collect(),
            render: Arc::new(render),
        }
    }

    /// Set the fallback label of a [`LabelRule::Choices`] rule.
    #[must_use]
    pub fn with_fallback(self, label: impl Into<String>) -> Self {
        match self {
            Self::Choices { labels, .. } => Self::Choices {
                labels,
                fallback: Some(label.into()),
            },
            derived @ Self::Derived { .. } => derived,
        }
    }

    /// Render the label for a setting currently holding `current`.
    #[must_use]
    pub fn render(&self, current: &SettingValue, snapshot: &Snapshot) -> Option<String> {
        match self {
            Self::Choices { labels, fallback } => {
                let current = current.to_string();
                labels
                    .iter()
                    .find(|(value, _)| *value == current)
                    .map(|(_, label)| label.clone())
                    .or_else(|| fallback.clone())
            }
            Self::Derived { render, .. } => render(snapshot),
        }
    }
}

impl Debug for LabelRule {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Choices { labels, fallback } => formatter
                .debug_struct("Choices")
                .field("labels", labels)
                .field("fallback", fallback)
                .finish(),
            Self::Derived { reads, .. } => formatter
                .debug_struct("Derived")
                .field("reads", reads)
                .finish_non_exhaustive(),
        }
    }
}

/// Relation between a setting and the rest of the snapshot.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// The setting accepts edits only while the predicate holds.
    EnabledWhen(Predicate),
    /// The setting is displayed through an offset with bounded display range.
    DisplayOffset(DisplayOffset),
    /// The setting carries a secondary label.
    Label(LabelRule),
}

impl Constraint {
    /// Keys of other settings the constraint reads.
    #[must_use]
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Self::EnabledWhen(predicate) => predicate.collect_references(&mut out),
            Self::DisplayOffset(_) | Self::Label(LabelRule::Choices { .. }) => {}
            Self::Label(LabelRule::Derived { reads, .. }) => {
                out.extend(reads.iter().map(String::as_str));
            }
        }
        out
    }
}

/// Declaration of one named, typed preference.
#[derive(Debug, Clone)]
pub struct Setting {
    key: String,
    kind: SettingKind,
    default: SettingValue,
    range: Option<ValueRange>,
    choices: Vec<String>,
    constraints: Vec<Constraint>,
    requires_restart: bool,
}

impl Setting {
    fn new(key: impl Into<String>, kind: SettingKind, default: SettingValue) -> Self {
        Self {
            key: key.into(),
            kind,
            default,
            range: None,
            choices: Vec::new(),
            constraints: Vec::new(),
            requires_restart: false,
        }
    }

    /// Declare a boolean setting.
    #[must_use]
    pub fn boolean(key: impl Into<String>, default: bool) -> Self {
        Self::new(key, SettingKind::Boolean, SettingValue::Boolean(default))
    }

    /// Declare an integer setting.
    #[must_use]
    pub fn integer(key: impl Into<String>, default: i64) -> Self {
        Self::new(key, SettingKind::Integer, SettingValue::Integer(default))
    }

    /// Declare a float setting.
    #[must_use]
    pub fn float(key: impl Into<String>, default: f64) -> Self {
        Self::new(key, SettingKind::Float, SettingValue::Float(default))
    }

    /// Declare a free-form text setting.
    #[must_use]
    pub fn string(key: impl Into<String>, default: impl Into<String>) -> Self {
        Self::new(key, SettingKind::String, SettingValue::String(default.into()))
    }

    /// Declare an enumerated setting with its allowed choices.
    #[must_use]
    pub fn enumeration<I, S>(key: impl Into<String>, choices: I, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut setting = Self::new(key, SettingKind::Enum, SettingValue::Enum(default.into()));
        setting.choices = choices.into_iter().map(Into::into).collect();
        setting
    }

    /// Declare a timestamp setting.
    #[must_use]
    pub fn timestamp(key: impl Into<String>, default: DateTime<Utc>) -> Self {
        Self::new(key, SettingKind::Timestamp, SettingValue::Timestamp(default))
    }

    /// Restrict an integer setting to `range`.
    #[must_use]
    pub fn with_range(mut self, range: RangeInclusive<i64>) -> Self {
        self.range = Some(ValueRange::Integer(range));
        self
    }

    /// Restrict a float setting to `range`.
    #[must_use]
    pub fn with_float_range(mut self, range: RangeInclusive<f64>) -> Self {
        self.range = Some(ValueRange::Float(range));
        self
    }

    /// Accept edits only while `predicate` holds.
    #[must_use]
    pub fn enabled_when(mut self, predicate: Predicate) -> Self {
        self.constraints.push(Constraint::EnabledWhen(predicate));
        self
    }

    /// Display the stored value minus `offset`, bounded to `display`.
    #[must_use]
    pub fn display_offset(mut self, offset: i64, display: RangeInclusive<i64>) -> Self {
        self.constraints.push(Constraint::DisplayOffset(DisplayOffset {
            offset,
            min: *display.start(),
            max: *display.end(),
        }));
        self
    }

    /// Attach a secondary label rule.
    #[must_use]
    pub fn labelled(mut self, rule: LabelRule) -> Self {
        self.constraints.push(Constraint::Label(rule));
        self
    }

    /// Flag the setting as taking effect only after a relaunch.
    #[must_use]
    pub const fn requiring_restart(mut self) -> Self {
        self.requires_restart = true;
        self
    }

    /// Unique key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Declared kind.
    #[must_use]
    pub const fn kind(&self) -> SettingKind {
        self.kind
    }

    /// Default value.
    #[must_use]
    pub const fn default_value(&self) -> &SettingValue {
        &self.default
    }

    /// Declared numeric range, if any.
    #[must_use]
    pub const fn range(&self) -> Option<&ValueRange> {
        self.range.as_ref()
    }

    /// Allowed choices for enum settings.
    #[must_use]
    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// Constraints in declaration order.
    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Whether changes take effect only after a relaunch.
    #[must_use]
    pub const fn requires_restart(&self) -> bool {
        self.requires_restart
    }

    /// Whether every enablement predicate holds.
    #[must_use]
    pub fn is_enabled(&self, snapshot: &Snapshot, environment: &Environment) -> bool {
        self.constraints.iter().all(|constraint| match constraint {
            Constraint::EnabledWhen(predicate) => predicate.evaluate(snapshot, environment),
            _ => true,
        })
    }

    /// Display transform, if one is declared.
    #[must_use]
    pub fn display_transform(&self) -> Option<DisplayOffset> {
        self.constraints.iter().find_map(|constraint| match constraint {
            Constraint::DisplayOffset(transform) => Some(*transform),
            _ => None,
        })
    }

    /// Secondary label for the setting under `snapshot`; the first rule that
    /// renders wins. A key missing from `snapshot` is labelled by its default.
    #[must_use]
    pub fn label(&self, snapshot: &Snapshot) -> Option<String> {
        let current = snapshot.get(&self.key).unwrap_or(&self.default);
        self.constraints.iter().find_map(|constraint| match constraint {
            Constraint::Label(rule) => rule.render(current, snapshot),
            _ => None,
        })
    }

    fn check_declaration(&self) -> SchemaResult<()> {
        let invalid = |reason| SchemaError::InvalidConstraint {
            key: self.key.clone(),
            reason,
        };
        match (&self.range, self.kind) {
            (None, _)
            | (Some(ValueRange::Integer(_)), SettingKind::Integer)
            | (Some(ValueRange::Float(_)), SettingKind::Float) => {}
            _ => return Err(invalid("range does not match setting kind")),
        }
        if self.kind == SettingKind::Enum && self.choices.is_empty() {
            return Err(invalid("enum setting declares no choices"));
        }
        validate::normalize(self, self.default.clone()).map_err(|source| {
            SchemaError::InvalidDefault {
                key: self.key.clone(),
                source,
            }
        })?;
        Ok(())
    }
}

/// Sealed, validated declaration of every recognised setting.
#[derive(Debug, Default)]
pub struct PreferenceSchema {
    settings: Vec<Setting>,
    index: HashMap<String, usize>,
    sealed: bool,
}

impl PreferenceSchema {
    /// Empty, unsealed schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every setting and seal the schema.
    ///
    /// # Errors
    ///
    /// Returns the first registration or sealing failure.
    pub fn from_settings(settings: impl IntoIterator<Item = Setting>) -> SchemaResult<Self> {
        let mut schema = Self::new();
        for setting in settings {
            schema.register(setting)?;
        }
        schema.seal()?;
        Ok(schema)
    }

    /// Register a setting.
    ///
    /// # Errors
    ///
    /// Returns `SchemaSealed` after [`seal`](Self::seal), `DuplicateKey` for a
    /// repeated key, and `InvalidDefault` / `InvalidConstraint` when the
    /// declaration contradicts itself.
    pub fn register(&mut self, setting: Setting) -> SchemaResult<()> {
        if self.sealed {
            return Err(SchemaError::SchemaSealed { key: setting.key });
        }
        if self.index.contains_key(&setting.key) {
            return Err(SchemaError::DuplicateKey { key: setting.key });
        }
        setting.check_declaration()?;
        self.index.insert(setting.key.clone(), self.settings.len());
        self.settings.push(setting);
        Ok(())
    }

    /// Check every constraint and freeze the schema. Sealing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DanglingConstraint` when a constraint reads an unregistered
    /// key and `InvalidConstraint` when a display transform is attached to a
    /// non-integer setting or excludes the setting's default.
    pub fn seal(&mut self) -> SchemaResult<()> {
        if self.sealed {
            return Ok(());
        }
        for setting in &self.settings {
            for constraint in &setting.constraints {
                if let Some(reference) = constraint
                    .references()
                    .into_iter()
                    .find(|reference| !self.index.contains_key(*reference))
                {
                    return Err(SchemaError::DanglingConstraint {
                        key: setting.key.clone(),
                        reference: reference.to_string(),
                    });
                }
                if let Constraint::DisplayOffset(transform) = constraint {
                    let admits_default = setting
                        .default
                        .as_i64()
                        .is_some_and(|stored| transform.admits(stored));
                    if setting.kind != SettingKind::Integer || !admits_default {
                        return Err(SchemaError::InvalidConstraint {
                            key: setting.key.clone(),
                            reason: "display transform requires an integer default within bounds",
                        });
                    }
                }
            }
        }
        self.sealed = true;
        Ok(())
    }

    /// Whether [`seal`](Self::seal) has completed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Validate `value` for setting `key`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKey`, `TypeMismatch`, or `OutOfRange`.
    pub fn validate(&self, key: &str, value: &SettingValue) -> ValidationResult<()> {
        self.normalize(key, value.clone()).map(drop)
    }

    /// Validate `value` and convert it to the setting's canonical kind.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKey`, `TypeMismatch`, or `OutOfRange`.
    pub fn normalize(&self, key: &str, value: SettingValue) -> ValidationResult<SettingValue> {
        validate::normalize(self.require(key)?, value)
    }

    /// Convert an untyped persisted value into a validated typed value.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKey`, `TypeMismatch`, or `OutOfRange`.
    pub fn coerce(&self, key: &str, raw: &serde_json::Value) -> ValidationResult<SettingValue> {
        validate::coerce_json(self.require(key)?, raw)
    }

    /// Constraints declared for `key`, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKey` when `key` is not registered.
    pub fn constraints_for(&self, key: &str) -> ValidationResult<&[Constraint]> {
        self.require(key).map(Setting::constraints)
    }

    /// Setting registered under `key`.
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.index.get(key).and_then(|idx| self.settings.get(*idx))
    }

    /// Settings in registration order.
    #[must_use]
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.settings.iter().map(Setting::key)
    }

    /// Number of registered settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    /// Whether no settings are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Snapshot mapping every key to its default, at revision `0`.
    #[must_use]
    pub fn defaults(&self) -> Snapshot {
        Snapshot::from_values(
            0,
            self.settings
                .iter()
                .map(|setting| (setting.key.clone(), setting.default.clone())),
        )
    }

    pub(crate) fn require(&self, key: &str) -> ValidationResult<&Setting> {
        self.setting(key).ok_or_else(|| ValidationError::UnknownKey {
            key: key.to_string(),
        })
    }
}
