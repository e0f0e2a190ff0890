//! Storage doubles for exercising persistence behaviour.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use prefsync_config::{
    MemoryStorage, PersistedValues, PreferenceStorage, Snapshot, StorageError, StorageResult,
};
use tokio::sync::Semaphore;

/// Storage whose first `failures` saves fail, recording every attempt.
#[derive(Debug, Default)]
pub struct FlakyStorage {
    failures_remaining: AtomicU32,
    attempts: Mutex<Vec<u64>>,
    inner: MemoryStorage,
}

impl FlakyStorage {
    /// Storage that rejects the next `failures` saves.
    #[must_use]
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    /// Revisions passed to `save`, in call order, including failed attempts.
    #[must_use]
    pub fn attempts(&self) -> Vec<u64> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Values written by the latest successful save.
    #[must_use]
    pub fn persisted(&self) -> PersistedValues {
        self.inner.persisted()
    }
}

#[async_trait]
impl PreferenceStorage for FlakyStorage {
    async fn load(&self) -> StorageResult<PersistedValues> {
        self.inner.load().await
    }

    async fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot.revision());
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::unavailable("save", "injected failure"));
        }
        self.inner.save(snapshot).await
    }
}

/// Storage whose saves block until the test releases them.
#[derive(Debug)]
pub struct GatedStorage {
    gate: Semaphore,
    inner: MemoryStorage,
}

impl Default for GatedStorage {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            inner: MemoryStorage::new(),
        }
    }
}

impl GatedStorage {
    /// Storage with a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `saves` more saves to complete.
    pub fn release(&self, saves: usize) {
        self.gate.add_permits(saves);
    }

    /// Number of completed saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.inner.save_count()
    }

    /// Values written by the latest completed save.
    #[must_use]
    pub fn persisted(&self) -> PersistedValues {
        self.inner.persisted()
    }
}

#[async_trait]
impl PreferenceStorage for GatedStorage {
    async fn load(&self) -> StorageResult<PersistedValues> {
        self.inner.load().await
    }

    async fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        self.gate
            .acquire()
            .await
            .map_err(|_| StorageError::unavailable("save", "gate closed"))?
            .forget();
        self.inner.save(snapshot).await
    }
}
