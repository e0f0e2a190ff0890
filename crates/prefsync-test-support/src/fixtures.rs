//! Sample schemas and runtime options for integration suites.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prefsync_config::{PersistencePolicy, Predicate, PreferenceSchema, Setting};

/// Schema with a theme, a dark reader toggle, an offset-displayed brightness
/// slider that is only editable while the reader is on, and an unbounded
/// integer `retryCount`.
///
/// # Errors
///
/// Returns an error if the declarations fail to seal.
pub fn reader_schema() -> Result<Arc<PreferenceSchema>> {
    let schema = PreferenceSchema::from_settings([
        Setting::enumeration("theme_source", ["system", "light", "dark"], "system"),
        Setting::boolean("dark_reader", false)
            .enabled_when(!Predicate::equals("theme_source", "light")),
        Setting::integer("brightness", 100)
            .display_offset(100, -50..=50)
            .enabled_when(Predicate::is_true("dark_reader")),
        Setting::integer("retryCount", 0),
    ])?;
    Ok(Arc::new(schema))
}

/// Schema of `count` independent integer settings named `key_0`, `key_1`, ...
///
/// # Errors
///
/// Returns an error if the declarations fail to seal.
pub fn independent_schema(count: usize) -> Result<Arc<PreferenceSchema>> {
    let schema =
        PreferenceSchema::from_settings((0..count).map(|idx| Setting::integer(format!("key_{idx}"), 0)))?;
    Ok(Arc::new(schema))
}

/// Persistence policy with millisecond backoff so retry suites stay fast.
#[must_use]
pub const fn fast_persistence(max_attempts: u32) -> PersistencePolicy {
    PersistencePolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}
