//! Command handlers and the store session they share.

pub(crate) mod preferences;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use prefsync_config::catalog::desktop_schema;
use prefsync_config::{
    Environment, JsonFileStorage, PreferenceStore, PreferenceView, StoreOptions,
};
use prefsync_events::EventStream;
use prefsync_telemetry::Metrics;
use tracing::{debug, warn};

use crate::error::{CliError, CliResult};

/// Store opened over the preference file for the lifetime of one command.
pub(crate) struct Session {
    pub(crate) store: PreferenceStore,
    pub(crate) view: PreferenceView,
    feed: EventStream,
    path: PathBuf,
}

impl Session {
    pub(crate) async fn open(
        path: &Path,
        environment: Environment,
        metrics: &Metrics,
    ) -> CliResult<Self> {
        let schema = desktop_schema().map_err(CliError::failure)?;
        let store = PreferenceStore::open(
            Arc::new(schema),
            Arc::new(JsonFileStorage::new(path)),
            StoreOptions::default()
                .with_environment(environment)
                .with_metrics(metrics.clone()),
        )
        .await?;
        let feed = store.events().subscribe(None);
        let view = PreferenceView::for_store(&store);
        Ok(Self {
            store,
            view,
            feed,
            path: path.to_path_buf(),
        })
    }

    /// Flush pending writes; a store left degraded means the file is stale.
    pub(crate) async fn close(mut self) -> CliResult<()> {
        self.store.shutdown().await;
        while let Some(envelope) = self.feed.try_next() {
            debug!(id = envelope.id, kind = envelope.event.kind(), "store event");
        }
        if self.feed.missed() > 0 {
            warn!(missed = self.feed.missed(), "store events dropped before logging");
        }
        debug!(last_event_id = ?self.store.events().last_event_id(), "session closed");

        if self.store.persistence_health().is_degraded() {
            return Err(CliError::failure(anyhow!(
                "failed to write preferences to {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}
