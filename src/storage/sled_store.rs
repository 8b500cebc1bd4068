//! Sled-based storage for room snapshots and update logs.
//!
//! Three trees are used:
//! - `snapshots`: room id -> latest snapshot bytes
//! - `updates`: room id, NUL, big-endian sequence -> update bytes
//! - `metadata`: room id -> bincode encoded [`RoomMetadata`]
//!
//! Sequence numbers come from `Db::generate_id`, so a room's updates iterate
//! in append order.

use async_trait::async_trait;
use sled::{Batch, Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{Persistence, RoomMetadata, StorageConfig, StorageStats};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_UPDATES: &str = "updates";
const TREE_METADATA: &str = "metadata";

/// Sled-backed room store
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    snapshots: Tree,
    updates: Tree,
    metadata: Tree,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        Self::from_db(db)
    }

    /// Throwaway store that is deleted on drop
    #[cfg(test)]
    pub fn temporary() -> StorageResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;
        let updates = db.open_tree(TREE_UPDATES)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            snapshots,
            updates,
            metadata,
        })
    }

    fn load_metadata(&self, room_id: &str) -> StorageResult<Option<RoomMetadata>> {
        match self.metadata.get(room_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_metadata(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut RoomMetadata),
    ) -> StorageResult<()> {
        let mut meta = self
            .load_metadata(room_id)?
            .unwrap_or_else(|| RoomMetadata::new(room_id));
        f(&mut meta);
        self.metadata
            .insert(room_id.as_bytes(), bincode::serialize(&meta)?)?;
        Ok(())
    }

}

fn room_prefix(room_id: &str) -> StorageResult<Vec<u8>> {
    if room_id.is_empty() || room_id.contains('\0') {
        return Err(StorageError::InvalidRoomId(room_id.to_string()));
    }
    let mut prefix = Vec::with_capacity(room_id.len() + 1);
    prefix.extend_from_slice(room_id.as_bytes());
    prefix.push(0);
    Ok(prefix)
}

fn update_key(room_id: &str, seq: u64) -> StorageResult<Vec<u8>> {
    let mut key = room_prefix(room_id)?;
    key.extend_from_slice(&seq.to_be_bytes());
    Ok(key)
}

#[async_trait]
impl Persistence for SledStore {
    async fn load_latest_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .snapshots
            .get(room_id.as_bytes())?
            .map(|data| data.to_vec()))
    }

    async fn load_updates(&self, room_id: &str) -> StorageResult<Vec<Vec<u8>>> {
        let prefix = room_prefix(room_id)?;
        let mut updates = Vec::new();
        for item in self.updates.scan_prefix(prefix) {
            let (_, value) = item?;
            updates.push(value.to_vec());
        }
        Ok(updates)
    }

    async fn append_update(&self, room_id: &str, update: &[u8]) -> StorageResult<()> {
        let key = update_key(room_id, self.db.generate_id()?)?;
        self.updates.insert(key, update)?;
        self.update_metadata(room_id, RoomMetadata::record_update)
    }

    async fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let prefix = room_prefix(room_id)?;
        self.snapshots.insert(room_id.as_bytes(), snapshot)?;

        // Every update appended so far is contained in the snapshot
        let mut batch = Batch::default();
        for item in self.updates.scan_prefix(prefix) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.updates.apply_batch(batch)?;

        self.update_metadata(room_id, |meta| meta.record_snapshot(snapshot.len()))
    }

    async fn room_metadata(&self, room_id: &str) -> StorageResult<Option<RoomMetadata>> {
        self.load_metadata(room_id)
    }

    async fn list_rooms(&self) -> StorageResult<Vec<RoomMetadata>> {
        let mut rooms = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            rooms.push(bincode::deserialize(&value)?);
        }
        Ok(rooms)
    }

    async fn flush(&self) -> StorageResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            room_count: self.metadata.len(),
            snapshot_count: self.snapshots.len(),
            pending_update_count: self.updates.len(),
            total_size_bytes: self.db.size_on_disk()?,
        })
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Only the last clone flushes
        if Arc::strong_count(&self.db) == 1 {
            let _ = self.db.flush();
        }
    }
}
