//! Store doubles for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{
    MemoryStore, Persistence, RoomMetadata, StorageError, StorageResult, StorageStats,
};

/// Memory store whose writes fail a configurable number of times and whose
/// snapshot saves can be slowed down
pub struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
    stall_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
            stall_ms: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` writes
    pub fn set_failures(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn failures_left(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Delay every snapshot save by `stall`
    pub fn set_stall(&self, stall: Duration) {
        self.stall_ms.store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    fn trip(&self) -> StorageResult<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FlakyStore {
    async fn load_latest_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.load_latest_snapshot(room_id).await
    }

    async fn load_updates(&self, room_id: &str) -> StorageResult<Vec<Vec<u8>>> {
        self.inner.load_updates(room_id).await
    }

    async fn append_update(&self, room_id: &str, update: &[u8]) -> StorageResult<()> {
        self.trip()?;
        self.inner.append_update(room_id, update).await
    }

    async fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        self.trip()?;
        self.inner.save_snapshot(room_id, snapshot).await
    }

    async fn room_metadata(&self, room_id: &str) -> StorageResult<Option<RoomMetadata>> {
        self.inner.room_metadata(room_id).await
    }

    async fn list_rooms(&self) -> StorageResult<Vec<RoomMetadata>> {
        self.inner.list_rooms().await
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        self.inner.stats().await
    }
}
