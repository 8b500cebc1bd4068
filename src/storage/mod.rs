//! Storage module for room snapshots and update logs.
//!
//! Every room persists two things: its latest compacted snapshot and the
//! tail of encoded updates appended since that snapshot. Saving a snapshot
//! supersedes the whole tail. Payloads are stored as opaque codec bytes so
//! loading never needs an intermediate format.
//!
//! Backends implement [`Persistence`]:
//! - [`SledStore`] keeps everything in an embedded Sled database
//! - [`MemoryStore`] keeps everything in process memory

mod memory_store;
mod retry;
mod sled_store;
#[cfg(test)]
pub(crate) mod testing;
mod writer;

pub use memory_store::MemoryStore;
pub use retry::RetryPolicy;
pub use sled_store::{SledStore, StorageError, StorageResult};
pub use writer::{PersistJob, PersistWriter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persistence backend for rooms
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Latest compacted snapshot of a room, if any
    async fn load_latest_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Updates appended since the latest snapshot, oldest first
    async fn load_updates(&self, room_id: &str) -> StorageResult<Vec<Vec<u8>>>;

    /// Append one encoded update to the room's tail
    async fn append_update(&self, room_id: &str, update: &[u8]) -> StorageResult<()>;

    /// Store a snapshot; it supersedes every previously appended update
    async fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> StorageResult<()>;

    async fn room_metadata(&self, room_id: &str) -> StorageResult<Option<RoomMetadata>>;

    async fn list_rooms(&self) -> StorageResult<Vec<RoomMetadata>>;

    /// Force pending writes to durable storage
    async fn flush(&self) -> StorageResult<()>;

    async fn stats(&self) -> StorageResult<StorageStats>;
}

/// Counters reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub room_count: usize,
    pub snapshot_count: usize,
    /// Updates waiting to be superseded by a snapshot
    pub pending_update_count: usize,
    /// Zero for backends without an on-disk footprint
    pub total_size_bytes: u64,
}

/// Metadata stored alongside room snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    /// Room identifier
    pub room_id: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last write
    pub updated_at: i64,
    /// Size of the latest snapshot in bytes
    pub snapshot_bytes: u64,
    /// Number of snapshots written so far
    pub snapshot_count: u64,
    /// Updates appended since the latest snapshot
    pub pending_updates: u64,
}

impl RoomMetadata {
    pub fn new(room_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            room_id: room_id.into(),
            created_at: now,
            updated_at: now,
            snapshot_bytes: 0,
            snapshot_count: 0,
            pending_updates: 0,
        }
    }

    fn record_update(&mut self) {
        self.pending_updates += 1;
        self.updated_at = chrono::Utc::now().timestamp();
    }

    fn record_snapshot(&mut self, size: usize) {
        self.snapshot_bytes = size as u64;
        self.snapshot_count += 1;
        self.pending_updates = 0;
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// Configuration for the Sled backend
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/snippets.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}
