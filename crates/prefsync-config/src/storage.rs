//! Durable storage collaborators.
//!
//! # Design
//! - The store only talks to [`PreferenceStorage`]; format and location are
//!   the adapter's business.
//! - Values cross the boundary as untyped JSON so a schema change never makes
//!   an old file unreadable; the store re-validates on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use crate::error::{StorageError, StorageResult};
use crate::model::Snapshot;

/// Untyped persisted mapping from key to value.
pub type PersistedValues = BTreeMap<String, Value>;

#[async_trait]
/// Abstraction over the backend that persists preference snapshots.
pub trait PreferenceStorage: Send + Sync {
    /// Load every persisted value. Called once when a store opens.
    async fn load(&self) -> StorageResult<PersistedValues>;
    /// Persist a full snapshot.
    async fn save(&self, snapshot: &Snapshot) -> StorageResult<()>;
}

/// In-memory storage, useful for ephemeral stores and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<PersistedValues>,
    saves: AtomicUsize,
}

impl MemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with persisted values.
    #[must_use]
    pub fn with_values(values: PersistedValues) -> Self {
        Self {
            values: Mutex::new(values),
            saves: AtomicUsize::new(0),
        }
    }

    /// Values written by the latest save.
    #[must_use]
    pub fn persisted(&self) -> PersistedValues {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreferenceStorage for MemoryStorage {
    async fn load(&self) -> StorageResult<PersistedValues> {
        Ok(self.persisted())
    }

    async fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        *self.values.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.to_json_map();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON document on the local file system.
///
/// Writes go to a sibling temporary file that is renamed over the target, so
/// a crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Storage backed by the document at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PreferenceStorage for JsonFileStorage {
    async fn load(&self) -> StorageResult<PersistedValues> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedValues::new());
            }
            Err(err) => return Err(StorageError::io("read", &self.path, err)),
        };
        serde_json::from_slice(&raw).map_err(|err| StorageError::json("parse", &self.path, err))
    }

    async fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let rendered = serde_json::to_vec_pretty(&snapshot.to_json_map())
            .map_err(|err| StorageError::json("render", &self.path, err))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io("create_dir", parent, err))?;
        }

        let temp = self.temp_path();
        fs::write(&temp, rendered)
            .await
            .map_err(|err| StorageError::io("write", &temp, err))?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|err| StorageError::io("rename", &self.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SettingValue;
    use serde_json::json;

    fn sample() -> Snapshot {
        Snapshot::from_values(
            3,
            [
                ("sidebar", SettingValue::Boolean(false)),
                ("theme_source", SettingValue::Enum("dark".into())),
            ],
        )
    }

    #[tokio::test]
    async fn memory_storage_round_trips_and_counts() -> StorageResult<()> {
        let storage = MemoryStorage::with_values(PersistedValues::from([(
            "sidebar".to_string(),
            json!(true),
        )]));
        assert_eq!(storage.load().await?.get("sidebar"), Some(&json!(true)));

        storage.save(&sample()).await?;
        assert_eq!(storage.save_count(), 1);
        assert_eq!(storage.persisted().get("theme_source"), Some(&json!("dark")));
        Ok(())
    }

    #[tokio::test]
    async fn json_file_storage_treats_missing_file_as_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = JsonFileStorage::new(dir.path().join("nested").join("prefs.json"));
        assert!(storage.load().await?.is_empty());

        storage.save(&sample()).await?;
        let loaded = storage.load().await?;
        assert_eq!(loaded.get("sidebar"), Some(&json!(false)));
        assert!(!storage.temp_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn json_file_storage_reports_corrupt_documents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prefs.json");
        tokio::fs::write(&path, b"{not json").await?;

        let storage = JsonFileStorage::new(&path);
        assert!(matches!(
            storage.load().await,
            Err(StorageError::Json { operation: "parse", .. })
        ));
        Ok(())
    }
}
