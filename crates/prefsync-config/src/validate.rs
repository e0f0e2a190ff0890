//! Value validation, normalisation, and parsing helpers.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{ValidationError, ValidationResult};
use crate::model::{SettingKind, SettingValue};
use crate::schema::{Setting, ValueRange};

/// Check `value` against `setting` and convert it to the setting's canonical kind.
///
/// Strings are accepted for enum settings (and the reverse), and integers are
/// widened for float settings.
#[allow(clippy::redundant_pub_crate, clippy::cast_precision_loss)]
pub(crate) fn normalize(setting: &Setting, value: SettingValue) -> ValidationResult<SettingValue> {
    let found = value.kind().as_str();
    let mismatch = || ValidationError::TypeMismatch {
        key: setting.key().to_string(),
        expected: setting.kind(),
        found,
    };

    let normalized = match (setting.kind(), value) {
        (SettingKind::Boolean, value @ SettingValue::Boolean(_))
        | (SettingKind::Integer, value @ SettingValue::Integer(_))
        | (SettingKind::Float, value @ SettingValue::Float(_))
        | (SettingKind::Timestamp, value @ SettingValue::Timestamp(_)) => value,
        (SettingKind::Float, SettingValue::Integer(raw)) => SettingValue::Float(raw as f64),
        (SettingKind::String, SettingValue::String(text) | SettingValue::Enum(text)) => {
            SettingValue::String(text)
        }
        (SettingKind::Enum, SettingValue::String(text) | SettingValue::Enum(text)) => {
            SettingValue::Enum(text)
        }
        _ => return Err(mismatch()),
    };

    check_domain(setting, &normalized)?;
    Ok(normalized)
}

fn check_domain(setting: &Setting, value: &SettingValue) -> ValidationResult<()> {
    let out_of_range = |reason: &'static str| ValidationError::OutOfRange {
        key: setting.key().to_string(),
        value: value.to_string(),
        reason,
    };

    match (value, setting.range()) {
        (SettingValue::Float(raw), _) if !raw.is_finite() => {
            return Err(out_of_range("value is not finite"));
        }
        (SettingValue::Integer(raw), Some(ValueRange::Integer(range))) if !range.contains(raw) => {
            return Err(out_of_range("value outside declared range"));
        }
        (SettingValue::Float(raw), Some(ValueRange::Float(range))) if !range.contains(raw) => {
            return Err(out_of_range("value outside declared range"));
        }
        (SettingValue::Enum(choice), _) if !setting.choices().iter().any(|c| c == choice) => {
            return Err(out_of_range("value is not an allowed choice"));
        }
        _ => {}
    }
    Ok(())
}

/// Convert an untyped persisted JSON value into a validated setting value.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn coerce_json(setting: &Setting, value: &Value) -> ValidationResult<SettingValue> {
    let mismatch = || ValidationError::TypeMismatch {
        key: setting.key().to_string(),
        expected: setting.kind(),
        found: json_type(value),
    };

    let typed = match (setting.kind(), value) {
        (SettingKind::Boolean, Value::Bool(flag)) => SettingValue::Boolean(*flag),
        (SettingKind::Integer, Value::Number(number)) => {
            SettingValue::Integer(number.as_i64().ok_or_else(mismatch)?)
        }
        (SettingKind::Float, Value::Number(number)) => {
            SettingValue::Float(number.as_f64().ok_or_else(mismatch)?)
        }
        (SettingKind::String, Value::String(text)) => SettingValue::String(text.clone()),
        (SettingKind::Enum, Value::String(text)) => SettingValue::Enum(text.clone()),
        (SettingKind::Timestamp, Value::String(text)) => {
            let parsed = parse_timestamp(text).ok_or_else(|| ValidationError::OutOfRange {
                key: setting.key().to_string(),
                value: text.clone(),
                reason: "value is not an rfc3339 timestamp",
            })?;
            SettingValue::Timestamp(parsed)
        }
        _ => return Err(mismatch()),
    };

    normalize(setting, typed)
}

/// Parse raw display-layer input into a value of the setting's kind.
///
/// Only syntax is checked here (plus enum membership); ranges are enforced
/// by the store.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn parse_input(setting: &Setting, raw: &str) -> Result<SettingValue, &'static str> {
    let trimmed = raw.trim();
    match setting.kind() {
        SettingKind::Boolean => parse_bool(trimmed)
            .map(SettingValue::Boolean)
            .ok_or("expected a boolean"),
        SettingKind::Integer => trimmed
            .parse::<i64>()
            .map(SettingValue::Integer)
            .map_err(|_| "expected an integer"),
        SettingKind::Float => match trimmed.parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => Ok(SettingValue::Float(parsed)),
            Ok(_) => Err("expected a finite number"),
            Err(_) => Err("expected a number"),
        },
        SettingKind::String => Ok(SettingValue::String(raw.to_string())),
        SettingKind::Enum => {
            if setting.choices().iter().any(|choice| choice == trimmed) {
                Ok(SettingValue::Enum(trimmed.to_string()))
            } else {
                Err("value is not an allowed choice")
            }
        }
        SettingKind::Timestamp => parse_timestamp(trimmed)
            .map(SettingValue::Timestamp)
            .ok_or("expected an rfc3339 timestamp"),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn theme() -> Setting {
        Setting::enumeration("theme_source", ["system", "light", "dark"], "system")
    }

    #[test]
    fn normalize_converts_between_compatible_kinds() {
        let ratio = Setting::float("ratio", 0.5);
        assert_eq!(
            normalize(&ratio, SettingValue::Integer(1)),
            Ok(SettingValue::Float(1.0))
        );
        assert_eq!(
            normalize(&theme(), SettingValue::from("dark")),
            Ok(SettingValue::Enum("dark".into()))
        );
    }

    #[test]
    fn normalize_rejects_wrong_kind_and_domain() {
        let retries = Setting::integer("retry_count", 3).with_range(0..=10);
        assert!(matches!(
            normalize(&retries, SettingValue::from("abc")),
            Err(ValidationError::TypeMismatch { found: "string", .. })
        ));
        assert!(matches!(
            normalize(&retries, SettingValue::Integer(11)),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            normalize(&theme(), SettingValue::from("sepia")),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            normalize(&Setting::float("ratio", 0.5), SettingValue::Float(f64::NAN)),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn coerce_json_handles_persisted_shapes() {
        let at = Setting::timestamp("pause_from", DateTime::UNIX_EPOCH);
        let parsed = coerce_json(&at, &json!("2024-01-01T23:00:00Z"));
        assert!(matches!(parsed, Ok(SettingValue::Timestamp(_))));
        assert!(matches!(
            coerce_json(&at, &json!("tomorrow")),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            coerce_json(&Setting::boolean("sidebar", true), &json!(1)),
            Err(ValidationError::TypeMismatch { found: "number", .. })
        ));
        assert_eq!(
            coerce_json(&Setting::integer("retry_count", 0), &json!(7)),
            Ok(SettingValue::Integer(7))
        );
        assert!(coerce_json(&Setting::integer("retry_count", 0), &json!(1.5)).is_err());
    }

    #[test]
    fn parse_input_accepts_common_spellings() {
        let toggle = Setting::boolean("sidebar", true);
        assert_eq!(parse_input(&toggle, " Yes "), Ok(SettingValue::Boolean(true)));
        assert_eq!(parse_input(&toggle, "off"), Ok(SettingValue::Boolean(false)));
        assert!(parse_input(&toggle, "maybe").is_err());

        let level = Setting::integer("brightness", 100);
        assert_eq!(parse_input(&level, "+20"), Ok(SettingValue::Integer(20)));
        assert_eq!(parse_input(&level, "abc"), Err("expected an integer"));

        assert_eq!(parse_input(&theme(), "light"), Ok(SettingValue::Enum("light".into())));
        assert!(parse_input(&theme(), "sepia").is_err());

        let ratio = Setting::float("ratio", 0.5);
        assert_eq!(parse_input(&ratio, "inf"), Err("expected a finite number"));
    }
}
