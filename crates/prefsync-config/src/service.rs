//! The authoritative preference store.
//!
//! # Design
//! - Readers load the current snapshot through an atomic pointer swap and
//!   never block; old snapshots stay valid for whoever holds them.
//! - One mutex serialises commits, listener membership, stream fan-out, and
//!   the persistence queue. Listener dispatch runs under that mutex, so an
//!   unsubscribed listener never fires again and every observer sees commits
//!   in the same order.
//! - Listeners must not call back into the store's mutating operations.
//! - Persistence is queued, never awaited, by `apply` and `reset_all`.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use prefsync_events::{Event, EventBus};
use prefsync_telemetry::{Metrics, OUTCOME_ACCEPTED};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, instrument, warn};

use crate::error::{ApplyError, ApplyResult, StoreError, StoreResult};
use crate::model::{ChangeRequest, Environment, Origin, SettingValue, Snapshot};
use crate::persistence::{PersistenceHealth, PersistencePolicy, PersistenceWorker};
use crate::schema::{PreferenceSchema, Setting};
use crate::storage::{PersistedValues, PreferenceStorage};
use crate::validate;

type Listener = Box<dyn FnMut(Arc<Snapshot>) + Send>;

/// Runtime knobs for a [`PreferenceStore`].
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Host facts consumed by enablement predicates.
    pub environment: Environment,
    /// Retry policy for background saves.
    pub persistence: PersistencePolicy,
    /// Bus receiving change and persistence events.
    pub events: EventBus,
    /// Optional metrics sink.
    pub metrics: Option<Metrics>,
}

impl StoreOptions {
    /// Replace the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Replace the persistence policy.
    #[must_use]
    pub const fn with_persistence(mut self, policy: PersistencePolicy) -> Self {
        self.persistence = policy;
        self
    }

    /// Replace the event bus.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Record metrics into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Handle returned by [`PreferenceStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription(u64);

/// Single source of truth for preference values.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct PreferenceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    schema: Arc<PreferenceSchema>,
    environment: Environment,
    defaults: BTreeMap<String, SettingValue>,
    current: ArcSwap<Snapshot>,
    state: Mutex<CommitState>,
    persistence_task: Mutex<Option<JoinHandle<()>>>,
    health: watch::Receiver<PersistenceHealth>,
    events: EventBus,
    metrics: Option<Metrics>,
}

struct CommitState {
    next_subscription: u64,
    listeners: BTreeMap<u64, Listener>,
    streams: Vec<mpsc::UnboundedSender<Arc<Snapshot>>>,
    persistence: Option<mpsc::UnboundedSender<Arc<Snapshot>>>,
}

impl PreferenceStore {
    /// Open a store over a sealed schema, merging persisted values into the
    /// defaults and starting the background persistence worker.
    ///
    /// Persisted keys the schema does not know are ignored; persisted values
    /// that no longer validate fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `SchemaNotSealed` for an unsealed schema and `Load` when the
    /// storage collaborator cannot be read.
    #[instrument(name = "preference_store.open", skip_all, fields(settings = schema.len()))]
    pub async fn open(
        schema: Arc<PreferenceSchema>,
        storage: Arc<dyn PreferenceStorage>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        if !schema.is_sealed() {
            return Err(StoreError::SchemaNotSealed);
        }
        let persisted = storage
            .load()
            .await
            .map_err(|source| StoreError::Load { source })?;
        let defaults = schema.defaults().values().clone();
        let (initial, restored) = merge_persisted(&schema, defaults.clone(), persisted);

        let StoreOptions {
            environment,
            persistence,
            events,
            metrics,
        } = options;
        let channels =
            PersistenceWorker::spawn(storage, persistence, events.clone(), metrics.clone());
        if let Some(metrics) = &metrics {
            metrics.set_snapshot_revision(initial.revision());
            metrics.set_persistence_degraded(false);
        }
        info!(restored, "preference store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                schema,
                environment,
                defaults,
                current: ArcSwap::from_pointee(initial),
                state: Mutex::new(CommitState {
                    next_subscription: 0,
                    listeners: BTreeMap::new(),
                    streams: Vec::new(),
                    persistence: Some(channels.queue),
                }),
                persistence_task: Mutex::new(Some(channels.task)),
                health: channels.health,
                events,
                metrics,
            }),
        })
    }

    /// Current snapshot. Never blocks.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.load_full()
    }

    /// Current value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.inner.current.load().get(key).cloned()
    }

    /// Schema the store validates against.
    #[must_use]
    pub fn schema(&self) -> &Arc<PreferenceSchema> {
        &self.inner.schema
    }

    /// Environment consumed by enablement predicates.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    /// Bus carrying change and persistence events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Whether an accepted change to `key` takes effect only after a relaunch.
    #[must_use]
    pub fn requires_restart(&self, key: &str) -> bool {
        self.inner
            .schema
            .setting(key)
            .is_some_and(Setting::requires_restart)
    }

    /// Invoke `listener` with every snapshot accepted from now on, in commit
    /// order.
    ///
    /// The listener runs while the store's commit lock is held; it must not
    /// call `apply`, `reset_all`, `subscribe`, `unsubscribe`, or `watch`.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(Arc<Snapshot>) + Send + 'static,
    {
        let mut state = self.lock_state();
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.listeners.insert(id, Box::new(listener));
        debug!(subscription = id, "preference listener subscribed");
        Subscription(id)
    }

    /// Remove a listener. Once this returns, the listener is never invoked
    /// again. Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let removed = self.lock_state().listeners.remove(&subscription.0).is_some();
        debug!(subscription = subscription.0, removed, "preference listener unsubscribed");
        removed
    }

    /// Stream yielding the current snapshot followed by every accepted one.
    #[must_use]
    pub fn watch(&self) -> SnapshotStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock_state();
        // Seeding under the lock keeps the stream free of gaps.
        if sender.send(self.snapshot()).is_ok() {
            state.streams.push(sender);
        }
        SnapshotStream { receiver }
    }

    /// Validate and commit a change request.
    ///
    /// Returns as soon as the new snapshot is visible and every listener has
    /// run; persistence continues in the background.
    ///
    /// # Errors
    ///
    /// Returns `ValidationFailed` when the value does not fit the schema,
    /// `ConstraintViolation` when it breaks a display transform, and
    /// `Disabled` when the setting's enablement rule does not hold for the
    /// current snapshot. Rejected requests leave the snapshot untouched.
    #[instrument(
        name = "preference_store.apply",
        skip_all,
        fields(key = %request.key, origin = %request.origin.label())
    )]
    pub fn apply(&self, request: ChangeRequest) -> ApplyResult<Arc<Snapshot>> {
        let result = self.commit_change(request);
        if let Err(err) = &result {
            debug!(error = %err, outcome = err.outcome(), "preference change rejected");
            if let Some(metrics) = &self.inner.metrics {
                metrics.inc_change(err.outcome());
            }
        }
        result
    }

    /// Restore every setting to its default in one commit with a single
    /// notification. Enablement rules do not apply to a reset.
    #[instrument(name = "preference_store.reset_all", skip_all, fields(origin = %origin.label()))]
    pub fn reset_all(&self, origin: Origin) -> Arc<Snapshot> {
        let mut state = self.lock_state();
        let current = self.inner.current.load_full();
        let next = Arc::new(current.replaced_by(self.inner.defaults.clone()));
        self.commit(
            &mut state,
            &next,
            Event::PreferencesReset {
                revision: next.revision(),
                origin: origin.label(),
            },
        );
        drop(state);

        if let Some(metrics) = &self.inner.metrics {
            metrics.inc_reset();
        }
        info!(revision = next.revision(), "preferences reset to defaults");
        next
    }

    /// Latest persistence health.
    #[must_use]
    pub fn persistence_health(&self) -> PersistenceHealth {
        *self.inner.health.borrow()
    }

    /// Receiver that observes every persistence health transition.
    #[must_use]
    pub fn watch_persistence(&self) -> watch::Receiver<PersistenceHealth> {
        self.inner.health.clone()
    }

    /// Hand the final snapshot to storage and wait for the persistence worker
    /// to drain. Changes accepted afterwards stay in memory only.
    #[instrument(name = "preference_store.shutdown", skip(self))]
    pub async fn shutdown(&self) {
        let (final_snapshot, queue) = {
            let mut state = self.lock_state();
            (self.snapshot(), state.persistence.take())
        };
        if let Some(queue) = queue
            && queue.send(Arc::clone(&final_snapshot)).is_err()
        {
            warn!("persistence worker stopped before shutdown");
        }

        let task = self
            .inner
            .persistence_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "persistence worker terminated abnormally");
        }
        info!(revision = final_snapshot.revision(), "preference store shut down");
    }

    fn commit_change(&self, request: ChangeRequest) -> ApplyResult<Arc<Snapshot>> {
        let ChangeRequest { key, value, origin } = request;
        let setting = self.inner.schema.require(&key)?;
        let value = validate::normalize(setting, value)?;
        check_display_bounds(setting, &value)?;

        let mut state = self.lock_state();
        let current = self.inner.current.load_full();
        if !setting.is_enabled(&current, &self.inner.environment) {
            return Err(ApplyError::Disabled { key });
        }

        let next = Arc::new(current.with_value(&key, value));
        self.commit(
            &mut state,
            &next,
            Event::PreferenceChanged {
                revision: next.revision(),
                key: key.clone(),
                origin: origin.label(),
            },
        );
        drop(state);

        if let Some(metrics) = &self.inner.metrics {
            metrics.inc_change(OUTCOME_ACCEPTED);
        }
        info!(key = %key, revision = next.revision(), "preference change applied");
        Ok(next)
    }

    fn commit(&self, state: &mut CommitState, next: &Arc<Snapshot>, event: Event) {
        self.inner.current.store(Arc::clone(next));

        for listener in state.listeners.values_mut() {
            listener(Arc::clone(next));
        }
        state
            .streams
            .retain(|stream| stream.send(Arc::clone(next)).is_ok());

        if let Some(queue) = &state.persistence
            && queue.send(Arc::clone(next)).is_err()
        {
            warn!(
                revision = next.revision(),
                "persistence worker stopped; snapshot kept in memory"
            );
        }

        self.inner.events.publish(event);
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_snapshot_revision(next.revision());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CommitState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for PreferenceStore {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PreferenceStore")
            .field("revision", &self.inner.current.load().revision())
            .field("settings", &self.inner.schema.len())
            .finish_non_exhaustive()
    }
}

/// Async stream of accepted snapshots, in commit order.
pub struct SnapshotStream {
    receiver: mpsc::UnboundedReceiver<Arc<Snapshot>>,
}

impl SnapshotStream {
    /// Receive the next snapshot; `None` once every store handle is dropped.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.recv().await
    }

    /// Return the next snapshot if one is immediately available.
    pub fn try_next(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for SnapshotStream {
    type Item = Arc<Snapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

fn check_display_bounds(setting: &Setting, value: &SettingValue) -> ApplyResult<()> {
    match (setting.display_transform(), value.as_i64()) {
        (Some(transform), Some(stored)) if !transform.admits(stored) => {
            Err(ApplyError::ConstraintViolation {
                key: setting.key().to_string(),
                value: value.to_string(),
                reason: "value falls outside the display range",
            })
        }
        _ => Ok(()),
    }
}

fn merge_persisted(
    schema: &PreferenceSchema,
    mut values: BTreeMap<String, SettingValue>,
    persisted: PersistedValues,
) -> (Snapshot, usize) {
    let mut restored = 0_usize;
    for (key, raw) in persisted {
        let Some(setting) = schema.setting(&key) else {
            warn!(key = %key, "ignoring unknown persisted preference");
            continue;
        };
        let checked = schema
            .coerce(&key, &raw)
            .map_err(ApplyError::from)
            .and_then(|value| check_display_bounds(setting, &value).map(|()| value));
        match checked {
            Ok(value) => {
                values.insert(key, value);
                restored += 1;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "persisted preference is invalid; using default");
            }
        }
    }
    (Snapshot::from_values(0, values), restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::schema::Predicate;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn schema() -> Arc<PreferenceSchema> {
        let settings = [
            Setting::enumeration("theme_source", ["system", "light", "dark"], "system"),
            Setting::boolean("dark_reader", false),
            Setting::integer("brightness", 100)
                .display_offset(100, -50..=50)
                .enabled_when(Predicate::is_true("dark_reader")),
            Setting::integer("retry_count", 3).with_range(0..=10),
            Setting::boolean("allow_prerelease", false).requiring_restart(),
        ];
        match PreferenceSchema::from_settings(settings) {
            Ok(schema) => Arc::new(schema),
            Err(err) => panic!("test schema must be valid: {err:?}"),
        }
    }

    async fn open(storage: Arc<MemoryStorage>) -> StoreResult<PreferenceStore> {
        PreferenceStore::open(schema(), storage, StoreOptions::default()).await
    }

    #[tokio::test]
    async fn apply_changes_exactly_one_key() -> anyhow::Result<()> {
        let store = open(Arc::new(MemoryStorage::new())).await?;
        let before = store.snapshot();

        let after = store.apply(ChangeRequest::user("theme_source", "dark"))?;
        assert_eq!(after.revision(), before.revision() + 1);
        assert_eq!(store.snapshot(), after);
        for (key, value) in before.iter() {
            if key == "theme_source" {
                assert_eq!(after.get(key), Some(&SettingValue::Enum("dark".into())));
            } else {
                assert_eq!(after.get(key), Some(value));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn rejected_requests_leave_snapshot_intact() -> anyhow::Result<()> {
        let store = open(Arc::new(MemoryStorage::new())).await?;
        let before = store.snapshot();

        let disabled = store.apply(ChangeRequest::user("brightness", 120_i64));
        assert_eq!(
            disabled,
            Err(ApplyError::Disabled {
                key: "brightness".into()
            })
        );
        assert!(matches!(
            store.apply(ChangeRequest::user("retry_count", 11_i64)),
            Err(ApplyError::ValidationFailed {
                source: ValidationError::OutOfRange { .. }
            })
        ));
        assert!(matches!(
            store.apply(ChangeRequest::user("missing", true)),
            Err(ApplyError::ValidationFailed {
                source: ValidationError::UnknownKey { .. }
            })
        ));

        store.apply(ChangeRequest::user("dark_reader", true))?;
        assert!(matches!(
            store.apply(ChangeRequest::user("brightness", 151_i64)),
            Err(ApplyError::ConstraintViolation { .. })
        ));
        assert_eq!(store.snapshot().revision(), before.revision() + 1);
        assert_eq!(store.get("brightness"), Some(SettingValue::Integer(100)));
        Ok(())
    }

    #[tokio::test]
    async fn listeners_fire_in_order_until_unsubscribed() -> anyhow::Result<()> {
        let store = open(Arc::new(MemoryStorage::new())).await?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = store.subscribe(move |snapshot| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(snapshot.revision());
            }
        });

        store.apply(ChangeRequest::user("retry_count", 4_i64))?;
        store.apply(ChangeRequest::user("retry_count", 5_i64))?;
        assert!(store.unsubscribe(handle));
        assert!(!store.unsubscribe(handle));
        store.apply(ChangeRequest::user("retry_count", 6_i64))?;

        assert_eq!(seen.lock().map(|s| s.clone()).ok(), Some(vec![1, 2]));
        Ok(())
    }

    #[tokio::test]
    async fn reapplying_current_value_still_commits() -> anyhow::Result<()> {
        let store = open(Arc::new(MemoryStorage::new())).await?;
        let first = store.apply(ChangeRequest::user("retry_count", 5_i64))?;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let second = store.apply(ChangeRequest::user("retry_count", 5_i64))?;
        assert_eq!(second.revision(), first.revision() + 1);
        assert_eq!(second.values(), first.values());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn reset_notifies_once_and_restores_defaults() -> anyhow::Result<()> {
        let store = open(Arc::new(MemoryStorage::new())).await?;
        store.apply(ChangeRequest::user("dark_reader", true))?;
        store.apply(ChangeRequest::user("brightness", 140_i64))?;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let reset = store.reset_all(Origin::User);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reset.values(), store.schema().defaults().values());
        assert_eq!(reset.revision(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn open_merges_persisted_values_and_skips_invalid_ones() -> anyhow::Result<()> {
        let storage = Arc::new(MemoryStorage::with_values(PersistedValues::from([
            ("theme_source".to_string(), json!("dark")),
            ("retry_count".to_string(), json!("many")),
            ("brightness".to_string(), json!(900)),
            ("legacy_key".to_string(), json!(true)),
        ])));
        let store = open(storage).await?;
        let snapshot = store.snapshot();

        assert_eq!(snapshot.revision(), 0);
        assert_eq!(snapshot.get("theme_source"), Some(&SettingValue::Enum("dark".into())));
        assert_eq!(snapshot.get("retry_count"), Some(&SettingValue::Integer(3)));
        assert_eq!(snapshot.get("brightness"), Some(&SettingValue::Integer(100)));
        assert!(snapshot.get("legacy_key").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn open_rejects_unsealed_schema() {
        let result = PreferenceStore::open(
            Arc::new(PreferenceSchema::new()),
            Arc::new(MemoryStorage::new()),
            StoreOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(StoreError::SchemaNotSealed)));
    }

    #[tokio::test]
    async fn watch_starts_with_current_snapshot() -> anyhow::Result<()> {
        let store = open(Arc::new(MemoryStorage::new())).await?;
        store.apply(ChangeRequest::user("retry_count", 7_i64))?;

        let mut stream = store.watch();
        store.apply(ChangeRequest::system("retry_count", 8_i64, "sync"))?;

        assert_eq!(stream.next().await.map(|s| s.revision()), Some(1));
        assert_eq!(stream.next().await.map(|s| s.revision()), Some(2));
        assert!(stream.try_next().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_persists_final_snapshot() -> anyhow::Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(Arc::clone(&storage)).await?;
        store.apply(ChangeRequest::user("allow_prerelease", true))?;
        assert!(store.requires_restart("allow_prerelease"));
        assert!(!store.requires_restart("retry_count"));

        store.shutdown().await;
        assert_eq!(storage.persisted().get("allow_prerelease"), Some(&json!(true)));
        assert_eq!(store.persistence_health(), PersistenceHealth::Healthy);
        Ok(())
    }

    #[tokio::test]
    async fn commits_after_shutdown_stay_in_memory() -> anyhow::Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(Arc::clone(&storage)).await?;
        store.apply(ChangeRequest::user("retry_count", 4_i64))?;
        store.shutdown().await;

        let later = store.apply(ChangeRequest::user("retry_count", 9_i64))?;
        assert_eq!(later.revision(), 2);
        assert_eq!(storage.persisted().get("retry_count"), Some(&json!(4)));
        Ok(())
    }
}
