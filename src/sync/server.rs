//! SyncServer implementation for managing concurrent collaboration rooms.
//!
//! The server keeps two registries:
//! - rooms: `DashMap<RoomId, RoomHandle>`, one actor per live room
//! - peers: every connected peer with its outbound channel
//!
//! It owns no document state itself. Each room actor serializes the work
//! for its document, so concurrent edits from many connections reach the
//! CRDT one at a time.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::presence::AwarenessState;
use super::protocol::{PeerInfo, ServerMessage};
use super::room::{spawn_room, RoomConfig, RoomHandle, RoomRegistry, RoomView};
use super::{PeerId, RoomId, SyncError, SyncResult};
use crate::auth::{AccessPolicy, Identity, OpenAccess};
use crate::storage::{MemoryStore, Persistence};

/// How often a join is retried against a room that is shutting down
const JOIN_ATTEMPTS: usize = 3;

/// Longest accepted room id
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Settings handed to every room actor
    pub room: RoomConfig,
    /// Cleanup interval for stale peers
    pub cleanup_interval: Duration,
    /// Peers silent for longer than this are disconnected
    pub session_timeout: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            room: RoomConfig::default(),
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
        }
    }
}

/// A single peer connection
pub struct PeerConnection {
    /// Unique peer identifier
    pub peer_id: PeerId,
    /// Display name from the handshake, used for anonymous users
    pub name: String,
    /// Session token for reconnection
    pub session_token: String,
    /// Channel to send messages to this peer
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Last activity timestamp
    last_active: Instant,
    /// Rooms this peer has joined
    joined_rooms: Vec<RoomId>,
}

impl PeerConnection {
    pub fn new(
        peer_id: impl Into<String>,
        name: impl Into<String>,
        session_token: impl Into<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            session_token: session_token.into(),
            tx,
            last_active: Instant::now(),
            joined_rooms: Vec::new(),
        }
    }

    /// Send a message to this peer
    pub fn send(&self, msg: ServerMessage) -> Result<(), SyncError> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::ConnectionError("Channel closed".to_string()))
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Check if the connection is stale
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    pub fn has_joined(&self, room_id: &str) -> bool {
        self.joined_rooms.iter().any(|r| r == room_id)
    }

    pub fn joined_rooms(&self) -> &[RoomId] {
        &self.joined_rooms
    }

    fn join_room(&mut self, room_id: &str) {
        if !self.has_joined(room_id) {
            self.joined_rooms.push(room_id.to_string());
        }
    }

    fn leave_room(&mut self, room_id: &str) {
        self.joined_rooms.retain(|r| r != room_id);
    }
}

/// Check that a room id is usable as a registry and storage key
pub fn validate_room_id(room_id: &str) -> SyncResult<()> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidMessage(format!("invalid room id: {:?}", room_id)))
    }
}

/// The main synchronization server
pub struct SyncServer {
    /// Server configuration
    config: SyncServerConfig,
    /// Live rooms
    rooms: RoomRegistry,
    /// Connected peers (global)
    peers: DashMap<PeerId, Arc<RwLock<PeerConnection>>>,
    /// Session token to peer ID mapping for reconnection
    sessions: DashMap<String, PeerId>,
    /// Persistent storage
    store: Arc<dyn Persistence>,
    /// Decides who may join which room
    access: Arc<dyn AccessPolicy>,
    /// Instance counter for room actors
    next_instance: AtomicU64,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server
    pub fn new(
        store: Arc<dyn Persistence>,
        access: Arc<dyn AccessPolicy>,
        config: SyncServerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: Arc::new(DashMap::new()),
            peers: DashMap::new(),
            sessions: DashMap::new(),
            store,
            access,
            next_instance: AtomicU64::new(1),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// In-memory server that admits everyone
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(OpenAccess),
            SyncServerConfig::default(),
        )
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register a new peer connection
    pub fn register_peer(
        &self,
        peer_id: &str,
        name: &str,
        session_token: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<()> {
        let connection = PeerConnection::new(peer_id, name, session_token, tx);

        self.peers
            .insert(peer_id.to_string(), Arc::new(RwLock::new(connection)));
        self.sessions
            .insert(session_token.to_string(), peer_id.to_string());

        info!("Peer registered: {} ({})", name, peer_id);
        Ok(())
    }

    /// Unregister a peer connection and leave all its rooms
    pub fn unregister_peer(&self, peer_id: &str) {
        if let Some((_, peer)) = self.peers.remove(peer_id) {
            let peer = peer.read();

            self.sessions.remove(&peer.session_token);

            for room_id in &peer.joined_rooms {
                if let Some(room) = self.room(room_id) {
                    if let Err(e) = room.leave_detached(peer_id, Some("disconnected".to_string())) {
                        debug!("Leave after disconnect failed: {}", e);
                    }
                }
            }

            info!("Peer unregistered: {} ({})", peer.name, peer_id);
        }
    }

    /// Peer id currently holding a session token
    pub fn restore_session(&self, session_token: &str) -> Option<PeerId> {
        self.sessions.get(session_token).map(|p| p.clone())
    }

    /// Get a peer connection
    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<RwLock<PeerConnection>>> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// Rename a peer after the handshake
    pub fn set_peer_name(&self, peer_id: &str, name: &str) -> SyncResult<()> {
        let peer = self
            .get_peer(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;
        peer.write().name = name.to_string();
        Ok(())
    }

    /// Run the access policy for a room without joining it
    pub fn authorize(&self, room_id: &str, credentials: Option<&str>) -> SyncResult<Identity> {
        validate_room_id(room_id)?;
        Ok(self.access.authorize(room_id, credentials)?)
    }

    fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Get or create the actor for a room
    fn get_or_spawn_room(&self, room_id: &str) -> RoomHandle {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
                debug!("Spawning room {} (instance {})", room_id, instance);
                spawn_room(
                    room_id,
                    instance,
                    self.config.room.clone(),
                    self.store.clone(),
                    self.rooms.clone(),
                )
            })
            .clone()
    }

    /// Join a room.
    ///
    /// On success the room has already queued `Joined` with the catch-up
    /// state on the peer's channel; the returned info is how the room sees
    /// the peer.
    pub async fn join_room(
        &self,
        peer_id: &str,
        room_id: &str,
        credentials: Option<&str>,
    ) -> SyncResult<PeerInfo> {
        validate_room_id(room_id)?;
        let peer = self
            .get_peer(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;

        let mut identity = match self.access.authorize(room_id, credentials) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Peer {} denied access to room {}: {}", peer_id, room_id, e);
                return Err(e.into());
            }
        };

        let tx = {
            let peer = peer.read();
            if peer.has_joined(room_id) {
                return Err(SyncError::AlreadyJoined {
                    peer_id: peer_id.to_string(),
                    room_id: room_id.to_string(),
                });
            }
            if identity.is_anonymous() {
                identity.display_name = peer.name.clone();
            }
            peer.tx.clone()
        };

        let mut attempt = 1;
        let info = loop {
            let room = self.get_or_spawn_room(room_id);
            match room.join(peer_id, identity.clone(), tx.clone()).await {
                Ok(info) => break info,
                Err(SyncError::RoomClosed(_)) if attempt < JOIN_ATTEMPTS => {
                    debug!("Room {} closed during join; retrying", room_id);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        peer.write().join_room(room_id);

        // The peer may have disconnected while the join was in flight
        if !self.peers.contains_key(peer_id) {
            if let Some(room) = self.room(room_id) {
                let _ = room.leave_detached(peer_id, Some("disconnected".to_string()));
            }
        }

        Ok(info)
    }

    /// Leave a room
    pub async fn leave_room(&self, peer_id: &str, room_id: &str) -> SyncResult<()> {
        if let Some(peer) = self.get_peer(peer_id) {
            peer.write().leave_room(room_id);
        }
        let room = self
            .room(room_id)
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?;
        if !room.leave(peer_id, None).await? {
            return Err(SyncError::NotJoined {
                peer_id: peer_id.to_string(),
                room_id: room_id.to_string(),
            });
        }
        Ok(())
    }

    /// Room handle for a peer that must have joined it
    fn joined_room(&self, peer_id: &str, room_id: &str) -> SyncResult<RoomHandle> {
        let peer = self
            .get_peer(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;
        {
            let mut peer = peer.write();
            if !peer.has_joined(room_id) {
                return Err(SyncError::NotJoined {
                    peer_id: peer_id.to_string(),
                    room_id: room_id.to_string(),
                });
            }
            peer.touch();
        }
        self.room(room_id)
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))
    }

    /// Hand an encoded update to its room for merge, relay and persistence
    pub fn handle_update(&self, peer_id: &str, room_id: &str, update: Vec<u8>) -> SyncResult<()> {
        self.joined_room(peer_id, room_id)?.update(peer_id, update)
    }

    /// Replace a peer's awareness record and relay it
    pub fn handle_awareness(
        &self,
        peer_id: &str,
        room_id: &str,
        state: AwarenessState,
    ) -> SyncResult<()> {
        self.joined_room(peer_id, room_id)?.awareness(peer_id, state)
    }

    /// Ask the room to send the peer a fresh snapshot
    pub fn request_resync(&self, peer_id: &str, room_id: &str) -> SyncResult<()> {
        self.joined_room(peer_id, room_id)?.resync(peer_id)
    }

    /// Record activity for a peer (keepalive)
    pub fn touch_peer(&self, peer_id: &str) {
        if let Some(peer) = self.peers.get(peer_id) {
            peer.write().touch();
        }
    }

    /// Snapshot of one live room
    pub async fn room_view(&self, room_id: &str) -> SyncResult<RoomView> {
        self.room(room_id)
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?
            .inspect()
            .await
    }

    /// Snapshots of every live room
    pub async fn room_views(&self) -> Vec<RoomView> {
        let handles: Vec<RoomHandle> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(view) = handle.inspect().await {
                views.push(view);
            }
        }
        views.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        views
    }

    /// Compact and flush every live room; returns how many flushed cleanly
    pub async fn flush_all(&self) -> usize {
        let handles: Vec<RoomHandle> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut flushed = 0;
        for handle in handles {
            match handle.flush().await {
                Ok(true) => flushed += 1,
                Ok(false) => warn!("Room {} did not flush cleanly", handle.room_id()),
                Err(e) => debug!("Skipping flush: {}", e),
            }
        }
        flushed
    }

    /// Disconnect peers that have been silent beyond the session timeout
    pub fn cleanup(&self) {
        let stale_peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.read().is_stale(self.config.session_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for peer_id in stale_peers {
            warn!("Removing stale peer: {}", peer_id);
            if let Some(peer) = self.get_peer(&peer_id) {
                let _ = peer.read().send(ServerMessage::Goodbye {
                    reason: Some("session timed out".to_string()),
                });
            }
            self.unregister_peer(&peer_id);
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_rooms: self.rooms.len(),
            active_peers: self.peers.len(),
            total_peers_in_rooms: self.peers.iter().map(|p| p.read().joined_rooms.len()).sum(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get storage
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Start the cleanup loop
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup();
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            cleanup_task: cleanup_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_rooms: usize,
    pub active_peers: usize,
    pub total_peers_in_rooms: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.cleanup_task.await;
    }
}
