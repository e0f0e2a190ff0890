//! Error types for preference schema, store, view, and storage operations.
//!
//! # Design
//! - Structured, constant-message errors; context lives in fields, not text.
//! - Schema errors are construction-time and fatal; store/view errors are
//!   runtime rejections that never corrupt the current snapshot.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::SettingKind;

/// Errors raised while declaring or sealing a preference schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A setting with the same key is already registered.
    #[error("duplicate preference key")]
    DuplicateKey {
        /// Key that was registered twice.
        key: String,
    },
    /// A constraint references a key that is not registered.
    #[error("constraint references an unknown preference")]
    DanglingConstraint {
        /// Setting that owns the constraint.
        key: String,
        /// Unregistered key referenced by the constraint.
        reference: String,
    },
    /// The schema was sealed and can no longer be mutated.
    #[error("preference schema is sealed")]
    SchemaSealed {
        /// Key of the setting whose registration was refused.
        key: String,
    },
    /// A setting's default value does not satisfy its own declaration.
    #[error("invalid default preference value")]
    InvalidDefault {
        /// Setting whose default failed validation.
        key: String,
        /// Validation failure describing the mismatch.
        source: ValidationError,
    },
    /// A constraint cannot apply to the setting it is attached to.
    #[error("invalid preference constraint")]
    InvalidConstraint {
        /// Setting that owns the constraint.
        key: String,
        /// Static reason for the rejection.
        reason: &'static str,
    },
}

/// Errors raised when a value does not satisfy a setting declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No setting is registered under the key.
    #[error("unknown preference key")]
    UnknownKey {
        /// Key that failed lookup.
        key: String,
    },
    /// The value kind does not match the declared kind.
    #[error("preference value has the wrong type")]
    TypeMismatch {
        /// Setting that rejected the value.
        key: String,
        /// Kind declared by the schema.
        expected: SettingKind,
        /// Kind (or JSON type) of the offending value.
        found: &'static str,
    },
    /// The value has the right kind but falls outside the permitted domain.
    #[error("preference value is out of range")]
    OutOfRange {
        /// Setting that rejected the value.
        key: String,
        /// Rendered offending value.
        value: String,
        /// Static reason for the rejection.
        reason: &'static str,
    },
}

impl ValidationError {
    /// Key of the setting the error refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::UnknownKey { key } | Self::TypeMismatch { key, .. } | Self::OutOfRange { key, .. } => {
                key
            }
        }
    }
}

/// Errors returned by [`PreferenceStore::apply`](crate::PreferenceStore::apply).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The setting's enablement constraint does not hold for the current snapshot.
    #[error("preference is disabled")]
    Disabled {
        /// Setting that rejected the change.
        key: String,
    },
    /// The proposed value failed schema validation.
    #[error("preference validation failed")]
    ValidationFailed {
        /// Underlying validation failure.
        #[from]
        source: ValidationError,
    },
    /// The proposed value breaks a constraint attached to the setting.
    #[error("preference constraint violated")]
    ConstraintViolation {
        /// Setting that rejected the change.
        key: String,
        /// Rendered offending value.
        value: String,
        /// Static reason for the rejection.
        reason: &'static str,
    },
}

impl ApplyError {
    /// Key of the setting the rejected request targeted.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Disabled { key } | Self::ConstraintViolation { key, .. } => key,
            Self::ValidationFailed { source } => source.key(),
        }
    }

    /// Metrics label describing the rejection.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Disabled { .. } => "disabled",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ConstraintViolation { .. } => "constraint_violation",
        }
    }
}

/// Errors raised while converting raw user input into a change request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    /// The raw input could not be parsed into the setting's kind.
    #[error("failed to parse preference input")]
    ParseFailure {
        /// Setting being edited.
        key: String,
        /// Raw input as received from the display layer.
        input: String,
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// No setting is registered under the key.
    #[error("unknown preference key")]
    UnknownKey {
        /// Key that failed lookup.
        key: String,
    },
}

/// Errors raised by storage collaborators.
#[derive(Debug, Error)]
pub enum StorageError {
    /// File system operation failed.
    #[error("preference storage io failure")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Persisted document could not be parsed or rendered.
    #[error("preference storage json failure")]
    Json {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// The backend refused the operation.
    #[error("preference storage unavailable")]
    Unavailable {
        /// Operation identifier.
        operation: &'static str,
        /// Backend-provided detail.
        detail: String,
    },
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Json {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Build an [`StorageError::Unavailable`] error for custom backends.
    #[must_use]
    pub fn unavailable(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            detail: detail.into(),
        }
    }
}

/// Errors raised while opening a preference store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The schema passed to the store has not been sealed.
    #[error("preference schema must be sealed before opening a store")]
    SchemaNotSealed,
    /// Loading persisted values failed.
    #[error("failed to load persisted preferences")]
    Load {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Convenience alias for schema results.
pub type SchemaResult<T> = Result<T, SchemaError>;
/// Convenience alias for validation results.
pub type ValidationResult<T> = Result<T, ValidationError>;
/// Convenience alias for apply results.
pub type ApplyResult<T> = Result<T, ApplyError>;
/// Convenience alias for view results.
pub type ViewResult<T> = Result<T, ViewError>;
/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
/// Convenience alias for store construction results.
pub type StoreResult<T> = Result<T, StoreError>;
