//! Background persistence of accepted snapshots.
//!
//! # Design
//! - One tokio task per store drains an unbounded queue of snapshots; callers
//!   never wait on storage I/O.
//! - Every save writes a full snapshot, so queued snapshots collapse to the
//!   newest one before each attempt.
//! - Failed saves are retried with capped exponential backoff. Each failure
//!   marks the store degraded; the next success restores it.

use std::sync::Arc;
use std::time::Duration;

use prefsync_events::{Event, EventBus};
use prefsync_telemetry::Metrics;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::model::Snapshot;
use crate::storage::PreferenceStorage;

/// Default number of save attempts per snapshot.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
/// Default ceiling for retry delays.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Retry policy applied to every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    /// Attempts per snapshot, including the first. Values below one act as one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl PersistencePolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Whether durable storage is keeping up with accepted changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceHealth {
    /// The latest save succeeded (or none has been attempted yet).
    Healthy,
    /// The latest save attempt failed; in-memory values remain authoritative.
    Degraded,
}

impl PersistenceHealth {
    /// Whether storage is currently failing.
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }
}

pub(crate) struct PersistenceChannels {
    pub(crate) queue: mpsc::UnboundedSender<Arc<Snapshot>>,
    pub(crate) health: watch::Receiver<PersistenceHealth>,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) struct PersistenceWorker {
    storage: Arc<dyn PreferenceStorage>,
    policy: PersistencePolicy,
    receiver: mpsc::UnboundedReceiver<Arc<Snapshot>>,
    health: watch::Sender<PersistenceHealth>,
    events: EventBus,
    metrics: Option<Metrics>,
}

impl PersistenceWorker {
    /// Spawn the worker on the current tokio runtime.
    pub(crate) fn spawn(
        storage: Arc<dyn PreferenceStorage>,
        policy: PersistencePolicy,
        events: EventBus,
        metrics: Option<Metrics>,
    ) -> PersistenceChannels {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (health, health_rx) = watch::channel(PersistenceHealth::Healthy);
        let worker = Self {
            storage,
            policy,
            receiver,
            health,
            events,
            metrics,
        };
        let task = tokio::spawn(worker.run());
        PersistenceChannels {
            queue,
            health: health_rx,
            task,
        }
    }

    async fn run(mut self) {
        while let Some(snapshot) = self.receiver.recv().await {
            let latest = self.latest(snapshot);
            self.persist(latest).await;
        }
        debug!("preference persistence queue closed");
    }

    /// Drain the queue and keep the highest revision seen.
    fn latest(&mut self, mut snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        while let Ok(queued) = self.receiver.try_recv() {
            if queued.revision() >= snapshot.revision() {
                snapshot = queued;
            }
        }
        snapshot
    }

    #[instrument(name = "preference_persistence.save", skip_all)]
    async fn persist(&mut self, mut snapshot: Arc<Snapshot>) {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.storage.save(&snapshot).await {
                Ok(()) => {
                    self.mark_healthy(snapshot.revision());
                    return;
                }
                Err(err) => {
                    let exhausted = attempt == max_attempts;
                    warn!(
                        error = %err,
                        revision = snapshot.revision(),
                        attempt,
                        exhausted,
                        "failed to persist preferences"
                    );
                    self.mark_degraded(snapshot.revision(), attempt, exhausted, describe(&err));
                    if exhausted {
                        return;
                    }
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                    snapshot = self.latest(snapshot);
                }
            }
        }
    }

    fn mark_degraded(&self, revision: u64, attempts: u32, exhausted: bool, message: String) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_persistence_failure();
            metrics.set_persistence_degraded(true);
        }
        self.health.send_replace(PersistenceHealth::Degraded);
        self.events.publish(Event::PersistenceDegraded {
            revision,
            attempts,
            exhausted,
            message,
        });
    }

    fn mark_healthy(&self, revision: u64) {
        let previous = self.health.send_replace(PersistenceHealth::Healthy);
        if !previous.is_degraded() {
            debug!(revision, "preferences persisted");
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_persistence_degraded(false);
        }
        info!(revision, "preference persistence restored");
        self.events.publish(Event::PersistenceRestored { revision });
    }
}

fn describe(err: &StorageError) -> String {
    match std::error::Error::source(err) {
        Some(source) => format!("{err}: {source}"),
        None => match err {
            StorageError::Unavailable { detail, .. } => format!("{err}: {detail}"),
            _ => err.to_string(),
        },
    }
}
