//! CLI error type distinguishing rejected input from operational failures.

use std::fmt::{self, Display, Formatter};

use prefsync_config::{ApplyError, StoreError, ValidationError, ViewError};

/// CLI-level error type to distinguish validation from operational failures.
#[derive(Debug)]
pub(crate) enum CliError {
    Validation(String),
    Failure(anyhow::Error),
}

/// Convenience alias for functions returning a `CliError`.
pub(crate) type CliResult<T> = Result<T, CliError>;

impl CliError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn failure(error: impl Into<anyhow::Error>) -> Self {
        Self::Failure(error.into())
    }

    pub(crate) const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Failure(_) => 3,
        }
    }

    pub(crate) fn display_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Failure(error) => format!("{error:#}"),
        }
    }
}

impl Display for CliError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("cli error")
    }
}

impl std::error::Error for CliError {}

impl From<ApplyError> for CliError {
    fn from(err: ApplyError) -> Self {
        let key = err.key();
        let message = match &err {
            ApplyError::ValidationFailed {
                source: source @ ValidationError::OutOfRange { reason, .. },
            } => format!("{key}: {source}: {reason}"),
            ApplyError::ValidationFailed { source } => format!("{key}: {source}"),
            ApplyError::ConstraintViolation { reason, .. } => format!("{key}: {err}: {reason}"),
            ApplyError::Disabled { .. } => format!("{key}: {err}"),
        };
        Self::Validation(message)
    }
}

impl From<ViewError> for CliError {
    fn from(err: ViewError) -> Self {
        match &err {
            ViewError::ParseFailure { key, input, reason } => {
                Self::Validation(format!("{key}: cannot use '{input}': {reason}"))
            }
            ViewError::UnknownKey { key } => Self::Validation(format!("{key}: {err}")),
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self::failure(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_validation_from_failure() {
        assert_eq!(CliError::validation("bad").exit_code(), 2);
        assert_eq!(CliError::failure(anyhow::anyhow!("io")).exit_code(), 3);
        assert_eq!(CliError::validation("bad").display_message(), "bad");
    }

    #[test]
    fn apply_rejections_become_validation_errors() {
        let err = CliError::from(ApplyError::Disabled {
            key: "navigation_bar".to_string(),
        });
        assert_eq!(err.exit_code(), 2);
        assert!(err.display_message().starts_with("navigation_bar: "));

        let err = CliError::from(ApplyError::from(ValidationError::UnknownKey {
            key: "nope".to_string(),
        }));
        assert!(err.display_message().starts_with("nope: "));
    }
}
