//! In-process room store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{Persistence, RoomMetadata, StorageResult, StorageStats};

#[derive(Debug)]
struct StoredRoom {
    snapshot: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
    metadata: RoomMetadata,
}

impl StoredRoom {
    fn new(room_id: &str) -> Self {
        Self {
            snapshot: None,
            updates: Vec::new(),
            metadata: RoomMetadata::new(room_id),
        }
    }
}

/// Room store that lives in memory and is lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, StoredRoom>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_latest_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .and_then(|room| room.snapshot.clone()))
    }

    async fn load_updates(&self, room_id: &str) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .map(|room| room.updates.clone())
            .unwrap_or_default())
    }

    async fn append_update(&self, room_id: &str, update: &[u8]) -> StorageResult<()> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| StoredRoom::new(room_id));
        room.updates.push(update.to_vec());
        room.metadata.record_update();
        Ok(())
    }

    async fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| StoredRoom::new(room_id));
        room.snapshot = Some(snapshot.to_vec());
        room.updates.clear();
        room.metadata.record_snapshot(snapshot.len());
        Ok(())
    }

    async fn room_metadata(&self, room_id: &str) -> StorageResult<Option<RoomMetadata>> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .map(|room| room.metadata.clone()))
    }

    async fn list_rooms(&self) -> StorageResult<Vec<RoomMetadata>> {
        let mut rooms: Vec<RoomMetadata> = self
            .rooms
            .lock()
            .values()
            .map(|room| room.metadata.clone())
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(rooms)
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let rooms = self.rooms.lock();
        Ok(StorageStats {
            room_count: rooms.len(),
            snapshot_count: rooms.values().filter(|r| r.snapshot.is_some()).count(),
            pending_update_count: rooms.values().map(|r| r.updates.len()).sum(),
            total_size_bytes: 0,
        })
    }
}
