use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prefsync_config::catalog::{FLAG_LINUX, FLAG_SQUIRREL, desktop_schema};
use prefsync_config::{
    ApplyError, ChangeRequest, Environment, JsonFileStorage, MemoryStorage, Origin,
    PersistenceHealth, PreferenceStore, PreferenceView, SettingValue, Snapshot, StoreOptions,
    ValidationError,
};
use prefsync_events::{Event, EventBus};
use prefsync_telemetry::Metrics;
use prefsync_test_support::fixtures::{fast_persistence, independent_schema, reader_schema};
use prefsync_test_support::mocks::{FlakyStorage, GatedStorage};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn schema_validation_reports_type_mismatch() -> anyhow::Result<()> {
    let schema = reader_schema()?;
    assert!(matches!(
        schema.validate("retryCount", &SettingValue::from("abc")),
        Err(ValidationError::TypeMismatch { .. })
    ));
    assert_eq!(schema.validate("retryCount", &SettingValue::from(5)), Ok(()));
    Ok(())
}

#[tokio::test]
async fn display_edits_round_trip_through_store() -> anyhow::Result<()> {
    let store = PreferenceStore::open(
        reader_schema()?,
        Arc::new(MemoryStorage::new()),
        StoreOptions::default(),
    )
    .await?;
    let view = PreferenceView::for_store(&store);

    store.apply(ChangeRequest::user("dark_reader", true))?;
    store.apply(ChangeRequest::user("brightness", 150_i64))?;
    let item = view.project_item(&store.snapshot(), "brightness");
    assert_eq!(
        item.map(|item| item.current_value),
        Some(SettingValue::Integer(50))
    );

    let request = view.on_user_edit("brightness", "+20")?;
    assert_eq!(request.value, SettingValue::Integer(120));
    let snapshot = store.apply(request)?;
    assert_eq!(snapshot.get("brightness"), Some(&SettingValue::Integer(120)));
    Ok(())
}

#[tokio::test]
async fn disabled_settings_reject_without_side_effects() -> anyhow::Result<()> {
    let metrics = Metrics::new()?;
    let store = PreferenceStore::open(
        reader_schema()?,
        Arc::new(MemoryStorage::new()),
        StoreOptions::default().with_metrics(metrics.clone()),
    )
    .await?;
    let mut events = store.events().subscribe(None);
    let before = store.snapshot();

    let result = store.apply(ChangeRequest::user("brightness", 110_i64));
    assert!(matches!(result, Err(ApplyError::Disabled { .. })));
    assert_eq!(store.snapshot(), before);
    assert!(events.try_next().is_none());

    store.apply(ChangeRequest::user("theme_source", "light"))?;
    assert!(matches!(
        store.apply(ChangeRequest::user("dark_reader", true)),
        Err(ApplyError::Disabled { .. })
    ));

    let counters = metrics.snapshot();
    assert_eq!(counters.changes_accepted_total, 1);
    assert_eq!(counters.changes_rejected_total, 2);
    Ok(())
}

#[tokio::test]
async fn reset_restores_every_default_in_one_notification() -> anyhow::Result<()> {
    let schema = reader_schema()?;
    let store = PreferenceStore::open(
        Arc::clone(&schema),
        Arc::new(MemoryStorage::new()),
        StoreOptions::default(),
    )
    .await?;
    store.apply(ChangeRequest::user("theme_source", "dark"))?;
    store.apply(ChangeRequest::user("retryCount", 9_i64))?;

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notifications);
    let _subscription = store.subscribe(move |snapshot| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(snapshot);
        }
    });
    let mut events = store.events().subscribe(None);

    store.reset_all(Origin::system("settings-window"));
    assert_eq!(store.snapshot().values(), schema.defaults().values());

    let seen = notifications.lock().map(|seen| seen.len()).unwrap_or_default();
    assert_eq!(seen, 1);
    assert!(matches!(
        events.try_next().map(|envelope| envelope.event),
        Some(Event::PreferencesReset { revision: 3, .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_are_observed_in_some_serial_order() -> anyhow::Result<()> {
    const WRITERS: usize = 16;
    let store = PreferenceStore::open(
        independent_schema(WRITERS)?,
        Arc::new(MemoryStorage::new()),
        StoreOptions::default(),
    )
    .await?;
    let initial = store.snapshot();
    let observed: Arc<Mutex<Vec<Arc<Snapshot>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let _subscription = store.subscribe(move |snapshot| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(snapshot);
        }
    });

    let mut writers = Vec::new();
    for idx in 0..WRITERS {
        let store = store.clone();
        writers.push(tokio::spawn(async move {
            let value = i64::try_from(idx + 1).unwrap_or(i64::MAX);
            store.apply(ChangeRequest::user(format!("key_{idx}"), value))
        }));
    }
    for writer in writers {
        writer.await??;
    }

    let observed = observed
        .lock()
        .map(|seen| seen.clone())
        .unwrap_or_default();
    assert_eq!(observed.len(), WRITERS);

    let mut previous = initial;
    for snapshot in observed {
        assert_eq!(snapshot.revision(), previous.revision() + 1);
        let changed: Vec<_> = snapshot
            .iter()
            .filter(|(key, value)| previous.get(key) != Some(*value))
            .map(|(key, _)| key.to_string())
            .collect();
        assert_eq!(changed.len(), 1, "each snapshot adds exactly one write");
        previous = snapshot;
    }
    assert!(previous.iter().all(|(_, value)| value.as_i64() != Some(0)));
    Ok(())
}

#[tokio::test]
async fn apply_returns_before_storage_completes() -> anyhow::Result<()> {
    let storage = Arc::new(GatedStorage::new());
    let store = PreferenceStore::open(
        reader_schema()?,
        Arc::clone(&storage) as Arc<dyn prefsync_config::PreferenceStorage>,
        StoreOptions::default(),
    )
    .await?;

    let snapshot = store.apply(ChangeRequest::user("retryCount", 4_i64))?;
    assert_eq!(snapshot.revision(), 1);
    assert_eq!(store.get("retryCount"), Some(SettingValue::Integer(4)));
    assert_eq!(storage.save_count(), 0);

    storage.release(2);
    timeout(WAIT, store.shutdown()).await?;
    assert!(storage.save_count() >= 1);
    assert_eq!(
        storage.persisted().get("retryCount"),
        Some(&serde_json::json!(4))
    );
    Ok(())
}

#[tokio::test]
async fn persistence_degrades_only_until_a_save_succeeds() -> anyhow::Result<()> {
    let storage = Arc::new(FlakyStorage::failing(2));
    let events = EventBus::with_capacity(64);
    let mut stream = events.subscribe(None);
    let store = PreferenceStore::open(
        reader_schema()?,
        Arc::clone(&storage) as Arc<dyn prefsync_config::PreferenceStorage>,
        StoreOptions::default()
            .with_events(events)
            .with_persistence(fast_persistence(3)),
    )
    .await?;
    let mut health = store.watch_persistence();

    let snapshot = store.apply(ChangeRequest::user("retryCount", 1_i64))?;
    assert_eq!(snapshot.revision(), 1);

    let mut kinds = Vec::new();
    while kinds.last() != Some(&"persistence_restored") {
        let envelope = timeout(WAIT, stream.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("event bus closed"))?;
        kinds.push(envelope.event.kind());
    }
    assert_eq!(
        kinds,
        vec![
            "preference_changed",
            "persistence_degraded",
            "persistence_degraded",
            "persistence_restored"
        ]
    );

    timeout(WAIT, health.wait_for(|state| *state == PersistenceHealth::Healthy)).await??;
    assert_eq!(store.persistence_health(), PersistenceHealth::Healthy);
    assert_eq!(storage.attempts(), vec![1, 1, 1]);

    store.apply(ChangeRequest::user("retryCount", 2_i64))?;
    store.shutdown().await;
    assert!(stream.try_next().is_some_and(|envelope| envelope.event.kind() == "preference_changed"));
    assert!(stream.try_next().is_none());
    assert_eq!(store.persistence_health(), PersistenceHealth::Healthy);
    Ok(())
}

#[tokio::test]
async fn reopened_store_restores_persisted_values() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("preferences.json");

    let store = PreferenceStore::open(
        reader_schema()?,
        Arc::new(JsonFileStorage::new(&path)),
        StoreOptions::default(),
    )
    .await?;
    store.apply(ChangeRequest::user("theme_source", "dark"))?;
    store.apply(ChangeRequest::user("retryCount", 12_i64))?;
    store.shutdown().await;

    let reopened = PreferenceStore::open(
        reader_schema()?,
        Arc::new(JsonFileStorage::new(&path)),
        StoreOptions::default(),
    )
    .await?;
    let snapshot = reopened.snapshot();
    assert_eq!(snapshot.revision(), 0);
    assert_eq!(
        snapshot.get("theme_source"),
        Some(&SettingValue::Enum("dark".into()))
    );
    assert_eq!(snapshot.get("retryCount"), Some(&SettingValue::Integer(12)));
    Ok(())
}

#[tokio::test]
async fn reopened_store_keeps_sub_second_timestamps() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("preferences.json");
    let from = "pause_notifications_by_schedule_from";
    let expected: DateTime<Utc> = "2024-01-01T23:00:00.123456Z".parse()?;

    let store = PreferenceStore::open(
        Arc::new(desktop_schema()?),
        Arc::new(JsonFileStorage::new(&path)),
        StoreOptions::default(),
    )
    .await?;
    store.apply(ChangeRequest::user("pause_notifications_by_schedule", true))?;
    let edit = PreferenceView::for_store(&store).on_user_edit(from, "2024-01-01T23:00:00.123456Z")?;
    store.apply(edit)?;
    let saved = store.snapshot();
    store.shutdown().await;

    let reopened = PreferenceStore::open(
        Arc::new(desktop_schema()?),
        Arc::new(JsonFileStorage::new(&path)),
        StoreOptions::default(),
    )
    .await?;
    let snapshot = reopened.snapshot();
    assert_eq!(snapshot.get(from), Some(&SettingValue::Timestamp(expected)));
    assert_eq!(snapshot.values(), saved.values());
    Ok(())
}

#[tokio::test]
async fn attached_view_reprojects_once_per_accepted_change() -> anyhow::Result<()> {
    let store = PreferenceStore::open(
        reader_schema()?,
        Arc::new(MemoryStorage::new()),
        StoreOptions::default(),
    )
    .await?;
    let renders = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&renders);
    let subscription = PreferenceView::for_store(&store).attach(&store, move |items| {
        if let Ok(mut renders) = sink.lock() {
            renders.push(items);
        }
    });

    store.apply(ChangeRequest::user("dark_reader", true))?;
    let _ = store.apply(ChangeRequest::user("retryCount", "many"));
    store.apply(ChangeRequest::user("brightness", 130_i64))?;
    assert!(store.unsubscribe(subscription));
    store.apply(ChangeRequest::user("retryCount", 3_i64))?;

    let renders = renders.lock().map(|r| r.clone()).unwrap_or_default();
    assert_eq!(renders.len(), 2);
    let brightness = renders[1].iter().find(|item| item.key == "brightness");
    assert_eq!(
        brightness.map(|item| (item.enabled, item.current_value.clone())),
        Some((true, SettingValue::Integer(30)))
    );
    Ok(())
}

#[tokio::test]
async fn desktop_catalog_applies_platform_rules() -> anyhow::Result<()> {
    let store = PreferenceStore::open(
        Arc::new(desktop_schema()?),
        Arc::new(MemoryStorage::new()),
        StoreOptions::default().with_environment(
            Environment::new()
                .with_flag(FLAG_LINUX)
                .with_flag(FLAG_SQUIRREL),
        ),
    )
    .await?;
    let view = PreferenceView::for_store(&store);

    store.apply(ChangeRequest::user("attach_to_menubar", true))?;
    store.apply(ChangeRequest::user("sidebar", false))?;
    assert!(matches!(
        store.apply(ChangeRequest::user("navigation_bar", true)),
        Err(ApplyError::Disabled { .. })
    ));
    assert!(store.requires_restart("attach_to_menubar"));
    store.apply(ChangeRequest::user("allow_prerelease", true))?;

    store.apply(ChangeRequest::system(
        "updater_status",
        "checking-for-update",
        "updater",
    ))?;
    let check = view.project_item(&store.snapshot(), "update_check_requested_at");
    assert_eq!(
        check.map(|item| (item.enabled, item.derived_label)),
        Some((false, Some("Checking for updates...".to_string())))
    );

    let items = view.project(&store.snapshot());
    assert_eq!(items.len(), store.schema().len());
    Ok(())
}
