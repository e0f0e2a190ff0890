//! Output renderers and formatting helpers for CLI commands.

use anyhow::anyhow;
use clap::ValueEnum;
use prefsync_config::{DisplayItem, Setting, Snapshot};
use serde_json::{Value, json};

use crate::error::{CliError, CliResult};

/// Output format for commands that render structured data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}

pub(crate) fn render_items(items: &[DisplayItem], format: OutputFormat) -> CliResult<String> {
    match format {
        OutputFormat::Json => to_pretty(&Value::Array(items.iter().map(item_json).collect())),
        OutputFormat::Table => {
            let mut lines = vec![format!(
                "{:<32} {:<10} {:<24} {:<8} LABEL",
                "KEY", "KIND", "VALUE", "ENABLED"
            )];
            lines.extend(items.iter().map(item_row));
            Ok(lines.join("\n"))
        }
    }
}

pub(crate) fn render_item(item: &DisplayItem, format: OutputFormat) -> CliResult<String> {
    match format {
        OutputFormat::Json => to_pretty(&item_json(item)),
        OutputFormat::Table => {
            let mut lines = vec![
                format!("key: {}", item.key),
                format!("kind: {}", item.kind),
                format!("value: {}", item.current_value),
                format!("enabled: {}", item.enabled),
            ];
            if let Some(label) = &item.derived_label {
                lines.push(format!("label: {label}"));
            }
            if item.requires_restart {
                lines.push("restart required: true".to_string());
            }
            Ok(lines.join("\n"))
        }
    }
}

pub(crate) fn render_keys<'a>(
    settings: impl IntoIterator<Item = &'a Setting>,
    format: OutputFormat,
) -> CliResult<String> {
    match format {
        OutputFormat::Json => to_pretty(&Value::Array(
            settings
                .into_iter()
                .map(|setting| {
                    json!({
                        "key": setting.key(),
                        "kind": setting.kind().as_str(),
                        "default": setting.default_value().to_json(),
                        "requires_restart": setting.requires_restart(),
                    })
                })
                .collect(),
        )),
        OutputFormat::Table => Ok(settings
            .into_iter()
            .map(|setting| format!("{:<32} {}", setting.key(), setting.kind()))
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

/// One-line confirmation printed after a mutation.
pub(crate) fn render_commit(snapshot: &Snapshot, item: Option<&DisplayItem>) -> String {
    match item {
        Some(item) if item.requires_restart => format!(
            "{} = {} (revision {}, restart required)",
            item.key,
            item.current_value,
            snapshot.revision()
        ),
        Some(item) => format!(
            "{} = {} (revision {})",
            item.key,
            item.current_value,
            snapshot.revision()
        ),
        None => format!(
            "{} preferences reset (revision {})",
            snapshot.len(),
            snapshot.revision()
        ),
    }
}

fn item_row(item: &DisplayItem) -> String {
    let marker = if item.requires_restart { " *" } else { "" };
    format!(
        "{:<32} {:<10} {:<24} {:<8} {}{marker}",
        item.key,
        item.kind,
        truncate(&item.current_value.to_string(), 24),
        if item.enabled { "yes" } else { "no" },
        item.derived_label.as_deref().unwrap_or("-"),
    )
}

fn item_json(item: &DisplayItem) -> Value {
    json!({
        "key": item.key,
        "kind": item.kind.as_str(),
        "value": item.current_value.to_json(),
        "enabled": item.enabled,
        "label": item.derived_label,
        "requires_restart": item.requires_restart,
    })
}

fn to_pretty(value: &Value) -> CliResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|err| CliError::failure(anyhow!("failed to format JSON: {err}")))
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}
