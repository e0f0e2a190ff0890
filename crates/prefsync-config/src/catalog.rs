//! Preference catalog of the desktop shell.
//!
//! # Design
//! - Declares every setting of the desktop preferences dialog together with
//!   the cross-setting rules the dialog enforced inline.
//! - Platform checks are environment flags (`linux`, `darwin`, `win32`), so
//!   the same schema serves every host.
//! - Updater progress is written by the update checker as ordinary system
//!   changes; the check-for-updates action is a timestamp setting whose
//!   label renders the progress.

use chrono::{DateTime, Duration};

use crate::error::SchemaResult;
use crate::model::{Environment, Snapshot};
use crate::schema::{LabelRule, Predicate, PreferenceSchema, Setting};

/// Environment flag set on Linux hosts.
pub const FLAG_LINUX: &str = "linux";
/// Environment flag set on macOS hosts.
pub const FLAG_DARWIN: &str = "darwin";
/// Environment flag set on Windows hosts.
pub const FLAG_WIN32: &str = "win32";
/// Environment flag set when builds update themselves through Squirrel.
pub const FLAG_SQUIRREL: &str = "squirrel";

/// Updater states that block a new check.
pub const UPDATER_BUSY: [&str; 3] = [
    "checking-for-update",
    "download-progress",
    "update-available",
];

const UPDATER_STATES: [&str; 7] = [
    "idle",
    "checking-for-update",
    "update-available",
    "update-not-available",
    "download-progress",
    "update-downloaded",
    "error",
];

const BYTE_UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Environment describing the host this process runs on.
#[must_use]
pub fn host_environment() -> Environment {
    let platform = match std::env::consts::OS {
        "macos" => FLAG_DARWIN,
        "windows" => FLAG_WIN32,
        other => other,
    };
    platform_environment(platform)
}

/// Environment of a host running `platform`. macOS and Windows builds
/// update through Squirrel.
#[must_use]
pub fn platform_environment(platform: &str) -> Environment {
    let environment = Environment::new().with_flag(platform);
    if platform == FLAG_DARWIN || platform == FLAG_WIN32 {
        environment.with_flag(FLAG_SQUIRREL)
    } else {
        environment
    }
}

/// Sealed schema of every desktop preference.
///
/// # Errors
///
/// Returns an error only if the declarations below contradict each other.
pub fn desktop_schema() -> SchemaResult<PreferenceSchema> {
    let mut settings = appearance();
    settings.extend(notifications());
    settings.extend(general());
    settings.extend(updates());
    PreferenceSchema::from_settings(settings)
}

fn appearance() -> Vec<Setting> {
    let reader_active = || {
        Predicate::all([
            Predicate::is_true("dark_reader"),
            !Predicate::equals("theme_source", "light"),
        ])
    };

    vec![
        Setting::enumeration("theme_source", ["system", "light", "dark"], "system").labelled(
            LabelRule::choices([("light", "Light"), ("dark", "Dark")])
                .with_fallback("System default"),
        ),
        Setting::boolean("sidebar", true),
        Setting::boolean("sidebar_shortcut_hints", true),
        Setting::boolean("navigation_bar", false).enabled_when(!Predicate::all([
            Predicate::flag(FLAG_LINUX),
            Predicate::is_true("attach_to_menubar"),
            Predicate::is_false("sidebar"),
        ])),
        Setting::boolean("title_bar", false),
        Setting::boolean("hide_menu_bar", false).requiring_restart(),
        Setting::boolean("attach_to_menubar", false).requiring_restart(),
        Setting::boolean("dark_reader", false)
            .enabled_when(!Predicate::equals("theme_source", "light")),
        Setting::integer("dark_reader_brightness", 100)
            .display_offset(100, -50..=50)
            .enabled_when(reader_active())
            .labelled(signed_offset_label("dark_reader_brightness")),
        Setting::integer("dark_reader_contrast", 100)
            .display_offset(100, -50..=50)
            .enabled_when(reader_active())
            .labelled(signed_offset_label("dark_reader_contrast")),
        Setting::integer("dark_reader_sepia", 0)
            .with_range(0..=100)
            .enabled_when(reader_active()),
        Setting::integer("dark_reader_grayscale", 0)
            .with_range(0..=100)
            .enabled_when(reader_active()),
    ]
}

fn notifications() -> Vec<Setting> {
    let scheduled = || Predicate::is_true("pause_notifications_by_schedule");
    vec![
        Setting::boolean("pause_notifications_by_schedule", false),
        Setting::timestamp(
            "pause_notifications_by_schedule_from",
            DateTime::UNIX_EPOCH + Duration::hours(23),
        )
        .enabled_when(scheduled()),
        Setting::timestamp(
            "pause_notifications_by_schedule_to",
            DateTime::UNIX_EPOCH + Duration::hours(7),
        )
        .enabled_when(scheduled()),
        Setting::boolean("pause_notifications_mute_audio", false),
        Setting::boolean("unread_count_badge", true).requiring_restart(),
    ]
}

fn general() -> Vec<Setting> {
    vec![
        Setting::string("download_path", "~/Downloads"),
        Setting::boolean("ask_for_download_path", true),
        Setting::boolean("spellcheck", true).requiring_restart(),
        Setting::boolean("block_ads", false).requiring_restart(),
        Setting::boolean("remember_last_page_visited", false).requiring_restart(),
        Setting::boolean("share_workspace_browsing_data", false).requiring_restart(),
        Setting::boolean("ignore_certificate_errors", false).requiring_restart(),
        Setting::boolean("sentry", false).requiring_restart(),
        Setting::boolean("hibernate_unused_workspaces_at_launch", false),
        Setting::boolean("swipe_to_navigate", true).requiring_restart(),
        Setting::boolean("use_hardware_acceleration", true).requiring_restart(),
        Setting::enumeration("open_at_login", ["yes", "yes-hidden", "no"], "no").labelled(
            LabelRule::choices([("yes", "Yes"), ("yes-hidden", "Yes, but minimized")])
                .with_fallback("No"),
        ),
    ]
}

fn updates() -> Vec<Setting> {
    vec![
        Setting::boolean("auto_check_for_updates", true),
        Setting::boolean("allow_prerelease", false)
            .requiring_restart()
            .enabled_when(Predicate::flag(FLAG_SQUIRREL)),
        Setting::enumeration("updater_status", UPDATER_STATES, "idle"),
        Setting::integer("updater_transferred", 0).with_range(0..=i64::MAX),
        Setting::integer("updater_total", 0).with_range(0..=i64::MAX),
        Setting::integer("updater_bytes_per_second", 0).with_range(0..=i64::MAX),
        Setting::string("updater_version", ""),
        Setting::timestamp("update_check_requested_at", DateTime::UNIX_EPOCH)
            .enabled_when(!Predicate::all([
                Predicate::flag(FLAG_SQUIRREL),
                Predicate::one_of("updater_status", UPDATER_BUSY),
            ]))
            .labelled(LabelRule::derived(
                [
                    "updater_status",
                    "updater_transferred",
                    "updater_total",
                    "updater_bytes_per_second",
                    "updater_version",
                ],
                updater_description,
            )),
    ]
}

fn signed_offset_label(key: &'static str) -> LabelRule {
    LabelRule::derived([key], move |snapshot| {
        let display = snapshot.get(key)?.as_i64()?.checked_sub(100)?;
        Some(if display > 0 {
            format!("+{display}")
        } else {
            display.to_string()
        })
    })
}

/// Human-readable progress of the update checker, if there is any to show.
#[must_use]
pub fn updater_description(snapshot: &Snapshot) -> Option<String> {
    let bytes = |key: &str| {
        snapshot
            .get(key)
            .and_then(|value| value.as_i64())
            .and_then(|raw| u64::try_from(raw).ok())
            .unwrap_or(0)
    };

    match snapshot.get("updater_status")?.as_str()? {
        "download-progress" => {
            let total = bytes("updater_total");
            if total == 0 {
                return Some("Downloading updates...".to_string());
            }
            Some(format!(
                "Downloading updates ({}/{} at {}/s)...",
                format_bytes(bytes("updater_transferred"), 2),
                format_bytes(total, 2),
                format_bytes(bytes("updater_bytes_per_second"), 2),
            ))
        }
        "checking-for-update" => Some("Checking for updates...".to_string()),
        "update-available" => Some("Downloading updates...".to_string()),
        "update-downloaded" => {
            let version = snapshot
                .get("updater_version")
                .and_then(|value| value.as_str())
                .filter(|version| !version.is_empty());
            Some(version.map_or_else(
                || "A new version has been downloaded.".to_string(),
                |version| format!("A new version ({version}) has been downloaded."),
            ))
        }
        _ => None,
    }
}

/// Render a byte count with binary units and at most `decimals` fraction
/// digits, dropping trailing zeros (`1536` -> `1.5 KB`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64, decimals: usize) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let mut rendered = format!("{value:.decimals$}");
    if rendered.contains('.') {
        let trimmed = rendered.trim_end_matches('0').trim_end_matches('.').len();
        rendered.truncate(trimmed);
    }
    format!("{rendered} {}", BYTE_UNITS[unit])
}
