//! Stateless projection of snapshots into display items, and the inverse
//! conversion of raw user input into change requests.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{ViewError, ViewResult};
use crate::model::{ChangeRequest, Environment, SettingKind, SettingValue, Snapshot};
use crate::schema::{PreferenceSchema, Setting};
use crate::service::{PreferenceStore, Subscription};
use crate::validate;

/// Display state of one setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayItem {
    /// Setting key.
    pub key: String,
    /// Declared kind.
    pub kind: SettingKind,
    /// Value as shown to the user (display transforms applied).
    pub current_value: SettingValue,
    /// Whether the setting currently accepts edits.
    pub enabled: bool,
    /// Secondary text derived from the snapshot.
    pub derived_label: Option<String>,
    /// Whether a change takes effect only after a relaunch.
    pub requires_restart: bool,
}

/// Pure projection over a schema and environment.
#[derive(Debug, Clone)]
pub struct PreferenceView {
    schema: Arc<PreferenceSchema>,
    environment: Environment,
}

impl PreferenceView {
    /// View over an explicit schema and environment.
    #[must_use]
    pub const fn new(schema: Arc<PreferenceSchema>, environment: Environment) -> Self {
        Self {
            schema,
            environment,
        }
    }

    /// View sharing a store's schema and environment.
    #[must_use]
    pub fn for_store(store: &PreferenceStore) -> Self {
        Self::new(Arc::clone(store.schema()), store.environment().clone())
    }

    /// One display item per registered setting, in registration order.
    ///
    /// Keys missing from `snapshot` project their default value.
    #[must_use]
    pub fn project(&self, snapshot: &Snapshot) -> Vec<DisplayItem> {
        self.schema
            .settings()
            .iter()
            .map(|setting| self.item(setting, snapshot))
            .collect()
    }

    /// Display item for a single setting.
    #[must_use]
    pub fn project_item(&self, snapshot: &Snapshot, key: &str) -> Option<DisplayItem> {
        self.schema
            .setting(key)
            .map(|setting| self.item(setting, snapshot))
    }

    /// Convert raw input for `key` into a user change request, applying the
    /// inverse of any display transform.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKey` for an unregistered key and `ParseFailure` when
    /// the input does not parse as the setting's kind. Neither contacts the
    /// store.
    pub fn on_user_edit(&self, key: &str, raw: &str) -> ViewResult<ChangeRequest> {
        let setting = self.schema.setting(key).ok_or_else(|| ViewError::UnknownKey {
            key: key.to_string(),
        })?;
        let parse_failure = |reason| ViewError::ParseFailure {
            key: key.to_string(),
            input: raw.to_string(),
            reason,
        };

        let parsed = validate::parse_input(setting, raw).map_err(parse_failure)?;
        let value = match (setting.display_transform(), parsed) {
            (Some(transform), SettingValue::Integer(display)) => transform
                .to_stored(display)
                .map(SettingValue::Integer)
                .ok_or_else(|| parse_failure("value overflows the stored range"))?,
            (_, parsed) => parsed,
        };
        Ok(ChangeRequest::user(key, value))
    }

    /// Re-project on every accepted snapshot and hand the items to `render`.
    ///
    /// `render` runs once per accepted change under the store's commit lock;
    /// it must not call back into the store's mutating operations.
    pub fn attach<F>(&self, store: &PreferenceStore, mut render: F) -> Subscription
    where
        F: FnMut(Vec<DisplayItem>) + Send + 'static,
    {
        let view = self.clone();
        store.subscribe(move |snapshot| render(view.project(&snapshot)))
    }

    fn item(&self, setting: &Setting, snapshot: &Snapshot) -> DisplayItem {
        let stored = snapshot
            .get(setting.key())
            .unwrap_or_else(|| setting.default_value());
        let current_value = match (setting.display_transform(), stored) {
            (Some(transform), SettingValue::Integer(raw)) => {
                SettingValue::Integer(transform.to_display(*raw))
            }
            _ => stored.clone(),
        };

        DisplayItem {
            key: setting.key().to_string(),
            kind: setting.kind(),
            current_value,
            enabled: setting.is_enabled(snapshot, &self.environment),
            derived_label: setting.label(snapshot),
            requires_restart: setting.requires_restart(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LabelRule, Predicate};

    fn view() -> PreferenceView {
        let settings = [
            Setting::boolean("dark_reader", true),
            Setting::integer("brightness", 100)
                .display_offset(100, -50..=50)
                .enabled_when(Predicate::is_true("dark_reader")),
            Setting::boolean("attach_to_menubar", false),
            Setting::boolean("navigation_bar", true).enabled_when(!Predicate::all([
                Predicate::flag("linux"),
                Predicate::is_true("attach_to_menubar"),
            ])),
            Setting::enumeration("theme_source", ["system", "light", "dark"], "system")
                .labelled(LabelRule::choices([
                    ("system", "System default"),
                    ("light", "Light"),
                    ("dark", "Dark"),
                ])),
        ];
        match PreferenceSchema::from_settings(settings) {
            Ok(schema) => PreferenceView::new(Arc::new(schema), Environment::new().with_flag("linux")),
            Err(err) => panic!("test schema must be valid: {err:?}"),
        }
    }

    fn stored(values: &[(&str, SettingValue)]) -> Snapshot {
        Snapshot::from_values(1, values.iter().cloned())
    }

    #[test]
    fn display_transform_projects_and_inverts() -> ViewResult<()> {
        let view = view();
        let snapshot = stored(&[
            ("dark_reader", SettingValue::Boolean(true)),
            ("brightness", SettingValue::Integer(150)),
        ]);
        let item = view.project_item(&snapshot, "brightness");
        assert_eq!(
            item.map(|item| item.current_value),
            Some(SettingValue::Integer(50))
        );

        let request = view.on_user_edit("brightness", "+20")?;
        assert_eq!(request.key, "brightness");
        assert_eq!(request.value, SettingValue::Integer(120));
        Ok(())
    }

    #[test]
    fn project_is_total_and_evaluates_constraints() {
        let view = view();
        let items = view.project(&stored(&[
            ("dark_reader", SettingValue::Boolean(false)),
            ("attach_to_menubar", SettingValue::Boolean(true)),
        ]));

        let keys: Vec<_> = items.iter().map(|item| item.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "dark_reader",
                "brightness",
                "attach_to_menubar",
                "navigation_bar",
                "theme_source"
            ]
        );
        let enabled: Vec<_> = items.iter().map(|item| item.enabled).collect();
        assert_eq!(enabled, vec![true, false, true, false, true]);
        assert_eq!(items[1].current_value, SettingValue::Integer(0));
        assert_eq!(items[4].derived_label.as_deref(), Some("System default"));
    }

    #[test]
    fn projection_is_deterministic() {
        let view = view();
        let snapshot = stored(&[("theme_source", SettingValue::Enum("dark".into()))]);
        assert_eq!(view.project(&snapshot), view.project(&snapshot));
    }

    #[test]
    fn malformed_input_is_rejected_before_the_store() {
        let view = view();
        assert!(matches!(
            view.on_user_edit("brightness", "bright"),
            Err(ViewError::ParseFailure { reason: "expected an integer", .. })
        ));
        assert!(matches!(
            view.on_user_edit("brightness", &i64::MAX.to_string()),
            Err(ViewError::ParseFailure { .. })
        ));
        assert!(matches!(
            view.on_user_edit("theme_source", "sepia"),
            Err(ViewError::ParseFailure { .. })
        ));
        assert!(matches!(
            view.on_user_edit("missing", "1"),
            Err(ViewError::UnknownKey { .. })
        ));
    }
}
