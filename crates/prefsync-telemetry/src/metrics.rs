//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes a minimal set of counters/gauges relevant to the preference store.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across the workspace.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    preference_changes_total: IntCounterVec,
    preference_resets_total: IntCounter,
    persistence_failures_total: IntCounter,
    persistence_degraded: IntGauge,
    snapshot_revision: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Accepted change requests.
    pub changes_accepted_total: u64,
    /// Change requests rejected for any reason.
    pub changes_rejected_total: u64,
    /// Bulk resets committed.
    pub resets_total: u64,
    /// Failed persistence attempts.
    pub persistence_failures_total: u64,
    /// Whether durable storage is currently failing.
    pub persistence_degraded: bool,
    /// Latest committed snapshot revision.
    pub snapshot_revision: i64,
}

/// `outcome` label recorded for committed change requests.
pub const OUTCOME_ACCEPTED: &str = "accepted";

/// `outcome` labels recorded for rejected change requests.
pub const REJECTION_OUTCOMES: [&str; 3] = ["disabled", "validation_failed", "constraint_violation"];

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let preference_changes_total = IntCounterVec::new(
            Opts::new(
                "preference_changes_total",
                "Preference change requests by outcome",
            ),
            &["outcome"],
        )
        .map_err(|source| TelemetryError::Collector {
            metric: "preference_changes_total",
            source,
        })?;
        let preference_resets_total = counter(
            "preference_resets_total",
            "Bulk resets to default preferences",
        )?;
        let persistence_failures_total = counter(
            "preference_persistence_failures_total",
            "Failed attempts to write preferences to durable storage",
        )?;
        let persistence_degraded = gauge(
            "preference_persistence_degraded",
            "Set to 1 while durable storage is failing",
        )?;
        let snapshot_revision = gauge(
            "preference_snapshot_revision",
            "Revision of the latest committed preference snapshot",
        )?;

        register(&registry, "preference_changes_total", &preference_changes_total)?;
        register(&registry, "preference_resets_total", &preference_resets_total)?;
        register(
            &registry,
            "preference_persistence_failures_total",
            &persistence_failures_total,
        )?;
        register(
            &registry,
            "preference_persistence_degraded",
            &persistence_degraded,
        )?;
        register(&registry, "preference_snapshot_revision", &snapshot_revision)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                preference_changes_total,
                preference_resets_total,
                persistence_failures_total,
                persistence_degraded,
                snapshot_revision,
            }),
        })
    }

    /// Increment the change counter for the given outcome label.
    pub fn inc_change(&self, outcome: &str) {
        self.inner
            .preference_changes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Increment the bulk reset counter.
    pub fn inc_reset(&self) {
        self.inner.preference_resets_total.inc();
    }

    /// Increment the persistence failure counter.
    pub fn inc_persistence_failure(&self) {
        self.inner.persistence_failures_total.inc();
    }

    /// Flag whether durable storage is currently degraded.
    pub fn set_persistence_degraded(&self, degraded: bool) {
        self.inner.persistence_degraded.set(i64::from(degraded));
    }

    /// Record the latest committed snapshot revision.
    pub fn set_snapshot_revision(&self, revision: u64) {
        self.inner
            .snapshot_revision
            .set(i64::try_from(revision).unwrap_or(i64::MAX));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::Render { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::RenderUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let changes = &self.inner.preference_changes_total;
        let accepted = changes.with_label_values(&[OUTCOME_ACCEPTED]).get();
        let rejected = REJECTION_OUTCOMES
            .iter()
            .map(|outcome| changes.with_label_values(&[*outcome]).get())
            .sum();

        MetricsSnapshot {
            changes_accepted_total: accepted,
            changes_rejected_total: rejected,
            resets_total: self.inner.preference_resets_total.get(),
            persistence_failures_total: self.inner.persistence_failures_total.get(),
            persistence_degraded: self.inner.persistence_degraded.get() != 0,
            snapshot_revision: self.inner.snapshot_revision.get(),
        }
    }
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::Collector { metric: name, source })
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::Collector { metric: name, source })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::Register { metric: name, source })
}
