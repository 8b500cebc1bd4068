//! Room actor.
//!
//! Every live room is a task that exclusively owns the room's [`Document`],
//! its peers and their awareness records, the compacted snapshot and the
//! update log since that snapshot. Everything else talks to it through a
//! [`RoomHandle`]; commands are processed one at a time, so the document
//! needs no locking and observers always see a state between merges.
//!
//! Lifecycle: the actor loads persisted state before it handles its first
//! command, serves peers while `Active`, flushes once the last peer leaves
//! (`Persisting`) and exits after a successful flush. A join during the flush
//! revives the room. A failed flush leaves the room resident in `Idle`,
//! retrying on every tick.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::codec;
use super::document::{Document, DocumentError};
use super::presence::{AwarenessState, Presence, RoomPresence};
use super::protocol::{ErrorCode, PeerInfo, ServerMessage, SyncProtocol, MAX_MESSAGE_SIZE};
use super::{PeerId, RoomId, SyncError, SyncResult};
use crate::auth::Identity;
use crate::storage::{PersistWriter, Persistence, RetryPolicy};

/// Replica id of server-side documents; the server never authors edits
const SERVER_REPLICA: u64 = 0;

/// Per-room limits and compaction thresholds
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_peers: usize,
    /// Compact once the log holds this many updates
    pub compaction_updates: usize,
    /// Compact once the log holds this many bytes
    pub compaction_bytes: usize,
    /// Compact pending changes at least this often
    pub snapshot_interval: Duration,
    /// Housekeeping interval (presence, timed compaction, flush retries)
    pub tick_interval: Duration,
    /// Retry policy for loading and for the persistence writer
    pub retry: RetryPolicy,
    /// Largest `Joined` frame handed to a peer
    pub max_message_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            compaction_updates: 64,
            compaction_bytes: 256 * 1024,
            snapshot_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Lifecycle state of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoomState {
    Active,
    /// Last peer left, final flush in flight
    Persisting,
    /// Final flush failed, retrying on tick
    Idle,
    /// Flushed; the actor is exiting
    Empty,
}

/// Point-in-time view of a room
#[derive(Debug, Clone)]
pub struct RoomView {
    pub room_id: RoomId,
    pub state: RoomState,
    pub text: String,
    pub len: usize,
    pub peers: Vec<PeerInfo>,
    /// Updates since the last compaction
    pub log_len: usize,
    /// Operations waiting for missing dependencies
    pub pending_ops: usize,
    /// Current state encoded as a snapshot
    pub snapshot: Vec<u8>,
}

/// Commands accepted by a room actor
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        peer_id: PeerId,
        identity: Identity,
        tx: mpsc::UnboundedSender<ServerMessage>,
        reply: oneshot::Sender<SyncResult<PeerInfo>>,
    },
    Leave {
        peer_id: PeerId,
        reason: Option<String>,
        reply: Option<oneshot::Sender<bool>>,
    },
    Update {
        peer_id: PeerId,
        update: Vec<u8>,
    },
    Awareness {
        peer_id: PeerId,
        state: AwarenessState,
    },
    Resync {
        peer_id: PeerId,
    },
    Inspect {
        reply: oneshot::Sender<RoomView>,
    },
    Flush {
        reply: oneshot::Sender<bool>,
    },
}

/// Registry shared between the server and its room actors
pub type RoomRegistry = Arc<DashMap<RoomId, RoomHandle>>;

/// Cheap, cloneable handle to a room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    instance: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Distinguishes successive actors for the same room id
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Add a peer; the actor sends `Joined` to `tx` itself
    pub async fn join(
        &self,
        peer_id: &str,
        identity: Identity,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<PeerInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            peer_id: peer_id.to_string(),
            identity,
            tx,
            reply,
        })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Remove a peer and wait for the room to acknowledge
    pub async fn leave(&self, peer_id: &str, reason: Option<String>) -> SyncResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Leave {
            peer_id: peer_id.to_string(),
            reason,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Remove a peer without waiting
    pub fn leave_detached(&self, peer_id: &str, reason: Option<String>) -> SyncResult<()> {
        self.send(RoomCommand::Leave {
            peer_id: peer_id.to_string(),
            reason,
            reply: None,
        })
    }

    pub fn update(&self, peer_id: &str, update: Vec<u8>) -> SyncResult<()> {
        self.send(RoomCommand::Update {
            peer_id: peer_id.to_string(),
            update,
        })
    }

    pub fn awareness(&self, peer_id: &str, state: AwarenessState) -> SyncResult<()> {
        self.send(RoomCommand::Awareness {
            peer_id: peer_id.to_string(),
            state,
        })
    }

    pub fn resync(&self, peer_id: &str) -> SyncResult<()> {
        self.send(RoomCommand::Resync {
            peer_id: peer_id.to_string(),
        })
    }

    pub async fn inspect(&self) -> SyncResult<RoomView> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Inspect { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Compact and flush; resolves to whether storage accepted everything
    pub async fn flush(&self) -> SyncResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Flush { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    fn send(&self, cmd: RoomCommand) -> SyncResult<()> {
        self.tx.send(cmd).map_err(|_| self.closed())
    }

    fn closed(&self) -> SyncError {
        SyncError::RoomClosed(self.room_id.clone())
    }
}

/// Spawn a room actor and return its handle.
///
/// The actor removes its own registry entry when it exits, but only while
/// that entry still belongs to this instance.
pub fn spawn_room(
    room_id: impl Into<String>,
    instance: u64,
    config: RoomConfig,
    store: Arc<dyn Persistence>,
    registry: RoomRegistry,
) -> RoomHandle {
    let room_id = room_id.into();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        room_id: room_id.clone(),
        instance,
        tx,
    };

    tokio::spawn(run_room(room_id, instance, config, store, registry, rx));
    handle
}

/// State loaded from persistence
struct Loaded {
    doc: Document,
    snapshot: Bytes,
    log: Vec<Bytes>,
}

async fn load_room(
    room_id: &str,
    store: &Arc<dyn Persistence>,
    policy: &RetryPolicy,
) -> SyncResult<Loaded> {
    let stored = policy
        .run("load snapshot", || store.load_latest_snapshot(room_id))
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
    let tail = policy
        .run("load updates", || store.load_updates(room_id))
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

    let mut doc = Document::new(SERVER_REPLICA);
    let snapshot = match stored {
        Some(bytes) => {
            let snapshot = codec::decode_snapshot(&bytes)?;
            doc.load_snapshot(&snapshot)?;
            Bytes::from(bytes)
        }
        None => codec::encode_snapshot(&doc.snapshot())?,
    };

    let mut log = Vec::with_capacity(tail.len());
    for bytes in tail {
        let merged = codec::decode_update(&bytes)
            .map_err(SyncError::from)
            .and_then(|update| doc.merge_remote(&update).map_err(SyncError::from));
        match merged {
            Ok(_) => log.push(Bytes::from(bytes)),
            Err(e) => warn!("Skipping stored update for room {}: {}", room_id, e),
        }
    }

    Ok(Loaded { doc, snapshot, log })
}

struct Room {
    room_id: RoomId,
    instance: u64,
    config: RoomConfig,
    registry: RoomRegistry,
    state: RoomState,
    doc: Document,
    presence: RoomPresence,
    peers: HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>,
    /// Encoded snapshot that `log` applies on top of
    snapshot: Bytes,
    log: Vec<Bytes>,
    log_bytes: usize,
    last_compaction: Instant,
    writer: PersistWriter,
    pending_flush: Option<oneshot::Receiver<bool>>,
}

async fn run_room(
    room_id: RoomId,
    instance: u64,
    config: RoomConfig,
    store: Arc<dyn Persistence>,
    registry: RoomRegistry,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
) {
    let loaded = match load_room(&room_id, &store, &config.retry).await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load room {}: {}", room_id, e);
            registry.remove_if(&room_id, |_, handle| handle.instance == instance);
            rx.close();
            while let Some(cmd) = rx.recv().await {
                reject(cmd, || SyncError::Storage(format!("room {} failed to load: {}", room_id, e)));
            }
            return;
        }
    };

    info!(
        "Room {} loaded ({} chars, {} logged updates)",
        room_id,
        loaded.doc.len(),
        loaded.log.len()
    );

    let (writer, _writer_task) = PersistWriter::spawn(&room_id, store, config.retry.clone());
    let log_bytes = loaded.log.iter().map(Bytes::len).sum();
    let mut tick = tokio::time::interval(config.tick_interval);

    let mut room = Room {
        presence: RoomPresence::new(),
        room_id,
        instance,
        config,
        registry,
        state: RoomState::Active,
        doc: loaded.doc,
        peers: HashMap::new(),
        snapshot: loaded.snapshot,
        log: loaded.log,
        log_bytes,
        last_compaction: Instant::now(),
        writer,
        pending_flush: None,
    };

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => room.handle(cmd),
                None => break,
            },
            flushed = wait_flush(&mut room.pending_flush) => room.on_flushed(flushed),
            _ = tick.tick() => room.on_tick(),
        }

        if room.state == RoomState::Empty {
            break;
        }
    }

    room.registry
        .remove_if(&room.room_id, |_, handle| handle.instance == room.instance);
    rx.close();
    while let Some(cmd) = rx.recv().await {
        room.reject_closed(cmd);
    }
    info!("Room {} closed", room.room_id);
}

/// Resolves when the pending flush is acknowledged; never resolves otherwise.
async fn wait_flush(pending: &mut Option<oneshot::Receiver<bool>>) -> bool {
    match pending.as_mut() {
        Some(rx) => {
            let flushed = rx.await.unwrap_or(false);
            *pending = None;
            flushed
        }
        None => std::future::pending().await,
    }
}

fn reject(cmd: RoomCommand, err: impl Fn() -> SyncError) {
    match cmd {
        RoomCommand::Join { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        RoomCommand::Leave { reply, .. } => {
            if let Some(reply) = reply {
                let _ = reply.send(false);
            }
        }
        RoomCommand::Flush { reply } => {
            let _ = reply.send(false);
        }
        RoomCommand::Update { .. }
        | RoomCommand::Awareness { .. }
        | RoomCommand::Resync { .. }
        | RoomCommand::Inspect { .. } => {}
    }
}

impl Room {
    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                peer_id,
                identity,
                tx,
                reply,
            } => {
                let result = self.on_join(peer_id, identity, tx);
                let _ = reply.send(result);
            }
            RoomCommand::Leave {
                peer_id,
                reason,
                reply,
            } => {
                let removed = self.on_leave(&peer_id, reason);
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            RoomCommand::Update { peer_id, update } => self.on_update(&peer_id, update),
            RoomCommand::Awareness { peer_id, state } => self.on_awareness(&peer_id, state),
            RoomCommand::Resync { peer_id } => self.on_resync(&peer_id),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.view());
            }
            RoomCommand::Flush { reply } => {
                if !self.log.is_empty() {
                    self.compact();
                }
                let ack = self.writer.flush();
                tokio::spawn(async move {
                    let _ = reply.send(ack.await.unwrap_or(false));
                });
            }
        }
    }

    fn reject_closed(&self, cmd: RoomCommand) {
        let room_id = self.room_id.clone();
        reject(cmd, move || SyncError::RoomClosed(room_id.clone()));
    }

    fn on_join(
        &mut self,
        peer_id: PeerId,
        identity: Identity,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<PeerInfo> {
        if self.presence.contains(&peer_id) {
            return Err(SyncError::AlreadyJoined {
                peer_id,
                room_id: self.room_id.clone(),
            });
        }
        if self.presence.peer_count() >= self.config.max_peers {
            return Err(SyncError::RoomFull(self.room_id.clone()));
        }

        let presence = Presence::new(&peer_id, identity);
        let you = presence.to_peer_info();
        let joined = ServerMessage::Joined {
            room_id: self.room_id.clone(),
            you: you.clone(),
            peers: self.presence.peer_infos_except(&peer_id),
            snapshot: self.snapshot.to_vec(),
            recent_updates: self.log.iter().map(|u| u.to_vec()).collect(),
        };

        // A peer is only registered once its catch-up frame fits
        let size = SyncProtocol::server_frame_len(&joined)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        if size > self.config.max_message_size {
            warn!(
                "Refusing {} in room {}: catch-up state is {} bytes",
                peer_id, self.room_id, size
            );
            return Err(SyncError::StateTooLarge {
                room_id: self.room_id.clone(),
                size,
                max: self.config.max_message_size,
            });
        }

        self.presence
            .add_peer(presence)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        if tx.send(joined).is_err() {
            debug!("Peer {} disconnected while joining {}", peer_id, self.room_id);
        }
        self.peers.insert(peer_id.clone(), tx);

        self.broadcast_except(
            &peer_id,
            ServerMessage::PeerJoined {
                room_id: self.room_id.clone(),
                peer: you.clone(),
            },
        );

        if self.state != RoomState::Active {
            info!("Room {} revived from {:?}", self.room_id, self.state);
            self.state = RoomState::Active;
            self.pending_flush = None;
        }

        info!(
            "Peer {} ({}) joined room {} ({} peers)",
            peer_id,
            you.name,
            self.room_id,
            self.presence.peer_count()
        );
        Ok(you)
    }

    fn on_leave(&mut self, peer_id: &str, reason: Option<String>) -> bool {
        self.peers.remove(peer_id);
        if self.presence.remove_peer(peer_id).is_none() {
            return false;
        }

        self.broadcast_except(
            peer_id,
            ServerMessage::PeerLeft {
                room_id: self.room_id.clone(),
                peer_id: peer_id.to_string(),
                reason,
            },
        );
        info!("Peer {} left room {}", peer_id, self.room_id);

        if self.presence.is_empty() {
            self.begin_persist();
        }
        true
    }

    fn on_update(&mut self, peer_id: &str, bytes: Vec<u8>) {
        if !self.presence.contains(peer_id) {
            warn!("Ignoring update from {} who is not in room {}", peer_id, self.room_id);
            return;
        }

        let update = match codec::decode_update(&bytes) {
            Ok(update) => update,
            Err(e) => {
                warn!("Undecodable update from {} in room {}: {}", peer_id, self.room_id, e);
                self.send_to(
                    peer_id,
                    ServerMessage::ResyncRequest {
                        room_id: self.room_id.clone(),
                    },
                );
                return;
            }
        };

        match self.doc.merge_remote(&update) {
            Ok(outcome) if outcome.is_noop() => {
                debug!("Duplicate update from {} in room {}", peer_id, self.room_id);
                self.mark_active(peer_id);
                return;
            }
            Ok(outcome) => {
                debug!(
                    "Merged update from {} in room {}: {:?}",
                    peer_id, self.room_id, outcome
                );
            }
            Err(e) => {
                if matches!(e, DocumentError::TooManyPending { .. }) {
                    warn!("Rejecting update from {} in room {}: {}", peer_id, self.room_id, e);
                } else {
                    error!(
                        "Dropping update from {} in room {}: {}",
                        peer_id, self.room_id, e
                    );
                }
                self.send_to(
                    peer_id,
                    SyncProtocol::error_response(
                        ErrorCode::InvalidMessage,
                        e.to_string(),
                        Some(self.room_id.clone()),
                    ),
                );
                return;
            }
        }

        self.mark_active(peer_id);

        let bytes = Bytes::from(bytes);
        self.broadcast_except(
            peer_id,
            ServerMessage::Update {
                room_id: self.room_id.clone(),
                from_peer: peer_id.to_string(),
                update: bytes.to_vec(),
            },
        );

        self.log_bytes += bytes.len();
        self.log.push(bytes.clone());
        self.writer.append(bytes);

        if self.log.len() >= self.config.compaction_updates
            || self.log_bytes >= self.config.compaction_bytes
        {
            self.compact();
        }
    }

    fn on_awareness(&mut self, peer_id: &str, state: AwarenessState) {
        self.mark_active(peer_id);
        if let Err(e) = self.presence.set_awareness(peer_id, state.clone()) {
            warn!("Ignoring awareness in room {}: {}", self.room_id, e);
            return;
        }

        self.broadcast_except(
            peer_id,
            ServerMessage::Awareness {
                room_id: self.room_id.clone(),
                peer_id: peer_id.to_string(),
                state,
            },
        );
    }

    fn on_resync(&mut self, peer_id: &str) {
        match codec::encode_snapshot(&self.doc.snapshot()) {
            Ok(snapshot) => {
                debug!("Resyncing peer {} in room {}", peer_id, self.room_id);
                self.send_to(
                    peer_id,
                    ServerMessage::Resync {
                        room_id: self.room_id.clone(),
                        snapshot: snapshot.to_vec(),
                    },
                );
            }
            Err(e) => error!("Failed to encode snapshot for room {}: {}", self.room_id, e),
        }
    }

    fn on_tick(&mut self) {
        for (peer_id, status) in self.presence.update_all_statuses() {
            self.broadcast_except(
                "",
                ServerMessage::Presence {
                    room_id: self.room_id.clone(),
                    peer_id,
                    status,
                },
            );
        }

        match self.state {
            RoomState::Active => {
                if !self.log.is_empty()
                    && self.last_compaction.elapsed() >= self.config.snapshot_interval
                {
                    self.compact();
                }
            }
            RoomState::Idle => {
                info!("Retrying final flush for room {}", self.room_id);
                self.compact();
                self.state = RoomState::Persisting;
                self.pending_flush = Some(self.writer.flush());
            }
            RoomState::Persisting | RoomState::Empty => {}
        }
    }

    fn on_flushed(&mut self, flushed: bool) {
        if self.state != RoomState::Persisting {
            return;
        }
        if flushed {
            debug!("Room {} flushed", self.room_id);
            self.state = RoomState::Empty;
        } else {
            warn!("Final flush failed for room {}; keeping it resident", self.room_id);
            self.state = RoomState::Idle;
        }
    }

    fn begin_persist(&mut self) {
        if !self.log.is_empty() {
            self.compact();
        }
        self.state = RoomState::Persisting;
        self.pending_flush = Some(self.writer.flush());
    }

    fn compact(&mut self) {
        match codec::encode_snapshot(&self.doc.snapshot()) {
            Ok(snapshot) => {
                debug!(
                    "Compacting room {}: {} updates, {} bytes -> {} byte snapshot",
                    self.room_id,
                    self.log.len(),
                    self.log_bytes,
                    snapshot.len()
                );
                self.snapshot = snapshot.clone();
                self.log.clear();
                self.log_bytes = 0;
                self.last_compaction = Instant::now();
                self.writer.snapshot(snapshot);
            }
            Err(e) => error!("Failed to encode snapshot for room {}: {}", self.room_id, e),
        }
    }

    fn mark_active(&mut self, peer_id: &str) {
        if let Some(status) = self.presence.touch(peer_id) {
            self.broadcast_except(
                "",
                ServerMessage::Presence {
                    room_id: self.room_id.clone(),
                    peer_id: peer_id.to_string(),
                    status,
                },
            );
        }
    }

    fn view(&self) -> RoomView {
        RoomView {
            room_id: self.room_id.clone(),
            state: self.state,
            text: self.doc.visible_text(),
            len: self.doc.len(),
            peers: self.presence.peer_infos_except(""),
            log_len: self.log.len(),
            pending_ops: self.doc.pending_len(),
            snapshot: codec::encode_snapshot(&self.doc.snapshot())
                .map(|b| b.to_vec())
                .unwrap_or_default(),
        }
    }

    fn send_to(&self, peer_id: &str, msg: ServerMessage) {
        if let Some(tx) = self.peers.get(peer_id) {
            if tx.send(msg).is_err() {
                debug!("Skipping closed peer {} in room {}", peer_id, self.room_id);
            }
        }
    }

    /// Send to every peer except `exclude`; pass `""` to reach everyone
    fn broadcast_except(&self, exclude: &str, msg: ServerMessage) {
        for (peer_id, tx) in &self.peers {
            if peer_id != exclude && tx.send(msg.clone()).is_err() {
                debug!("Skipping closed peer {} in room {}", peer_id, self.room_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FlakyStore;
    use crate::storage::MemoryStore;
    use crate::sync::document::MAX_PENDING;
    use crate::sync::update::{IdRange, Op, Update};

    fn test_config() -> RoomConfig {
        RoomConfig {
            compaction_updates: 4,
            tick_interval: Duration::from_millis(20),
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..Default::default()
        }
    }

    fn spawn_test_room(store: Arc<MemoryStore>) -> (RoomHandle, RoomRegistry) {
        spawn_room_with(store, test_config())
    }

    fn spawn_room_with(
        store: Arc<dyn Persistence>,
        config: RoomConfig,
    ) -> (RoomHandle, RoomRegistry) {
        let registry: RoomRegistry = Arc::new(DashMap::new());
        let handle = spawn_room("room", 1, config, store, registry.clone());
        registry.insert("room".to_string(), handle.clone());
        (handle, registry)
    }

    /// Writes are tried once, so every injected failure fails a flush
    fn single_attempt_config() -> RoomConfig {
        RoomConfig {
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
                .with_max_attempts(1),
            ..test_config()
        }
    }

    async fn wait_for_state(room: &RoomHandle, state: RoomState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while room.inspect().await.unwrap().state != state {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_until_freed(registry: &RoomRegistry) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.contains_key("room") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Text a peer ends up with after applying its `Joined` catch-up state
    fn caught_up_text(msg: Option<ServerMessage>) -> String {
        let (snapshot, recent_updates) = match msg {
            Some(ServerMessage::Joined {
                snapshot,
                recent_updates,
                ..
            }) => (snapshot, recent_updates),
            other => panic!("expected Joined, got {:?}", other),
        };
        let mut replica = Document::new(9);
        replica
            .load_snapshot(&codec::decode_snapshot(&snapshot).unwrap())
            .unwrap();
        for update in recent_updates {
            replica
                .merge_remote(&codec::decode_update(&update).unwrap())
                .unwrap();
        }
        replica.visible_text()
    }

    async fn stored_text(store: &FlakyStore) -> Option<String> {
        let bytes = store.load_latest_snapshot("room").await.unwrap()?;
        Some(codec::decode_snapshot(&bytes).unwrap().visible_text())
    }

    async fn join(
        room: &RoomHandle,
        peer_id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join(peer_id, Identity::new(peer_id, peer_id, "#85BBF0"), tx)
            .await
            .unwrap();
        match rx.recv().await {
            Some(ServerMessage::Joined { .. }) => {}
            other => panic!("expected Joined, got {:?}", other),
        }
        rx
    }

    fn encoded(update: &Update) -> Vec<u8> {
        codec::encode_update(update).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_update_is_relayed_to_others_only() {
        let (room, _registry) = spawn_test_room(Arc::new(MemoryStore::new()));
        let mut alice = join(&room, "alice").await;
        let mut bob = join(&room, "bob").await;

        match alice.recv().await {
            Some(ServerMessage::PeerJoined { peer, .. }) => assert_eq!(peer.peer_id, "bob"),
            other => panic!("expected PeerJoined, got {:?}", other),
        }

        let mut doc = Document::new(7);
        let update = encoded(&doc.apply_local_insert(0, "hi").unwrap());
        room.update("alice", update.clone()).unwrap();

        match bob.recv().await {
            Some(ServerMessage::Update {
                from_peer,
                update: relayed,
                ..
            }) => {
                assert_eq!(from_peer, "alice");
                assert_eq!(relayed, update);
            }
            other => panic!("expected Update, got {:?}", other),
        }

        let view = room.inspect().await.unwrap();
        assert_eq!(view.text, "hi");
        assert_eq!(view.log_len, 1);
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_garbage_update_requests_resync() {
        let (room, _registry) = spawn_test_room(Arc::new(MemoryStore::new()));
        let mut alice = join(&room, "alice").await;

        room.update("alice", vec![0xde, 0xad, 0xbe, 0xef]).unwrap();

        match alice.recv().await {
            Some(ServerMessage::ResyncRequest { room_id }) => assert_eq!(room_id, "room"),
            other => panic!("expected ResyncRequest, got {:?}", other),
        }
        assert_eq!(room.inspect().await.unwrap().log_len, 0);
    }

    #[tokio::test]
    async fn test_duplicate_update_is_not_relayed() {
        let (room, _registry) = spawn_test_room(Arc::new(MemoryStore::new()));
        let _alice = join(&room, "alice").await;
        let mut bob = join(&room, "bob").await;

        let mut doc = Document::new(7);
        let update = encoded(&doc.apply_local_insert(0, "once").unwrap());
        room.update("alice", update.clone()).unwrap();
        room.update("alice", update).unwrap();

        assert!(matches!(bob.recv().await, Some(ServerMessage::Update { .. })));
        let view = room.inspect().await.unwrap();
        assert_eq!(view.log_len, 1);
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_compaction_and_catch_up() {
        let (room, _registry) = spawn_test_room(Arc::new(MemoryStore::new()));
        let _alice = join(&room, "alice").await;

        let mut doc = Document::new(7);
        for word in ["fn ", "main", "() ", "{}", " // done"] {
            let at = doc.len();
            let update = encoded(&doc.apply_local_insert(at, word).unwrap());
            room.update("alice", update).unwrap();
        }

        let view = room.inspect().await.unwrap();
        assert_eq!(view.text, "fn main() {} // done");
        assert_eq!(view.log_len, 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join("carol", Identity::new("carol", "Carol", "#FF6B6B"), tx)
            .await
            .unwrap();
        let Some(ServerMessage::Joined {
            snapshot,
            recent_updates,
            peers,
            ..
        }) = rx.recv().await
        else {
            panic!("expected Joined");
        };
        assert_eq!(peers.len(), 1);
        assert_eq!(recent_updates.len(), 1);

        let mut replica = Document::new(9);
        replica
            .load_snapshot(&codec::decode_snapshot(&snapshot).unwrap())
            .unwrap();
        for update in recent_updates {
            replica
                .merge_remote(&codec::decode_update(&update).unwrap())
                .unwrap();
        }
        assert_eq!(replica.visible_text(), doc.visible_text());
    }

    #[tokio::test]
    async fn test_room_full_and_double_join() {
        let registry: RoomRegistry = Arc::new(DashMap::new());
        let config = RoomConfig {
            max_peers: 1,
            ..test_config()
        };
        let room = spawn_room("room", 1, config, Arc::new(MemoryStore::new()), registry);
        let _alice = join(&room, "alice").await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let again = room
            .join("alice", Identity::new("alice", "Alice", "#FF6B6B"), tx.clone())
            .await;
        assert!(matches!(again, Err(SyncError::AlreadyJoined { .. })));

        let full = room.join("bob", Identity::new("bob", "Bob", "#FF6B6B"), tx).await;
        assert!(matches!(full, Err(SyncError::RoomFull(_))));
    }

    #[tokio::test]
    async fn test_last_leave_flushes_and_frees_room() {
        let store = Arc::new(MemoryStore::new());
        let (room, registry) = spawn_test_room(store.clone());
        let _alice = join(&room, "alice").await;

        let mut doc = Document::new(7);
        room.update("alice", encoded(&doc.apply_local_insert(0, "persist me").unwrap()))
            .unwrap();
        assert!(room.leave("alice", None).await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.contains_key("room") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stored = store.load_latest_snapshot("room").await.unwrap().unwrap();
        let snapshot = codec::decode_snapshot(&stored).unwrap();
        assert_eq!(snapshot.visible_text(), "persist me");
        assert!(store.load_updates("room").await.unwrap().is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        let late = room.join("bob", Identity::new("bob", "Bob", "#FF6B6B"), tx).await;
        assert!(matches!(late, Err(SyncError::RoomClosed(_))));
    }

    #[tokio::test]
    async fn test_reload_from_snapshot_and_tail() {
        let store = Arc::new(MemoryStore::new());
        let mut doc = Document::new(7);
        let base = doc.apply_local_insert(0, "base").unwrap();
        let mut snap_doc = Document::new(0);
        snap_doc.merge_remote(&base).unwrap();
        store
            .save_snapshot("room", &codec::encode_snapshot(&snap_doc.snapshot()).unwrap())
            .await
            .unwrap();
        let tail = doc.apply_local_insert(4, "+tail").unwrap();
        store
            .append_update("room", &codec::encode_update(&tail).unwrap())
            .await
            .unwrap();
        store.append_update("room", b"corrupt").await.unwrap();

        let (room, _registry) = spawn_test_room(store);
        let view = room.inspect().await.unwrap();
        assert_eq!(view.text, "base+tail");
        assert_eq!(view.log_len, 1);
        assert_eq!(view.state, RoomState::Active);
    }

    #[tokio::test]
    async fn test_awareness_relay_and_leave_notice() {
        let (room, _registry) = spawn_test_room(Arc::new(MemoryStore::new()));
        let mut alice = join(&room, "alice").await;
        let mut bob = join(&room, "bob").await;
        let _ = alice.recv().await; // PeerJoined(bob)

        let state = AwarenessState {
            selection: None,
            is_typing: true,
        };
        room.awareness("bob", state.clone()).unwrap();
        match alice.recv().await {
            Some(ServerMessage::Awareness {
                peer_id,
                state: relayed,
                ..
            }) => {
                assert_eq!(peer_id, "bob");
                assert_eq!(relayed, state);
            }
            other => panic!("expected Awareness, got {:?}", other),
        }

        room.leave_detached("alice", Some("closed tab".into())).unwrap();
        match bob.recv().await {
            Some(ServerMessage::PeerLeft { peer_id, reason, .. }) => {
                assert_eq!(peer_id, "alice");
                assert_eq!(reason.as_deref(), Some("closed tab"));
            }
            other => panic!("expected PeerLeft, got {:?}", other),
        }

        let view = room.inspect().await.unwrap();
        assert_eq!(view.peers.len(), 1);
        assert!(view.peers[0].awareness.is_typing);
    }

    #[tokio::test]
    async fn test_failed_final_flush_keeps_room_until_retry_succeeds() {
        let store = Arc::new(FlakyStore::new(0));
        let (room, registry) = spawn_room_with(store.clone(), single_attempt_config());
        let _alice = join(&room, "alice").await;

        let mut doc = Document::new(7);
        room.update("alice", encoded(&doc.apply_local_insert(0, "keep me").unwrap()))
            .unwrap();
        assert_eq!(room.inspect().await.unwrap().text, "keep me");

        store.set_failures(u32::MAX);
        assert!(room.leave("alice", None).await.unwrap());
        wait_for_state(&room, RoomState::Idle).await;

        // Several retry ticks later the room is still resident
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains_key("room"));
        let view = room.inspect().await.unwrap();
        assert!(matches!(view.state, RoomState::Idle | RoomState::Persisting));
        assert_eq!(view.text, "keep me");
        assert_eq!(stored_text(&store).await, None);

        store.set_failures(3);
        wait_until_freed(&registry).await;
        assert_eq!(store.failures_left(), 0);
        assert_eq!(stored_text(&store).await.as_deref(), Some("keep me"));
        assert!(store.load_updates("room").await.unwrap().is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        let late = room.join("bob", Identity::new("bob", "Bob", "#FF6B6B"), tx).await;
        assert!(matches!(late, Err(SyncError::RoomClosed(_))));
    }

    #[tokio::test]
    async fn test_join_revives_idle_room() {
        let store = Arc::new(FlakyStore::new(0));
        let (room, registry) = spawn_room_with(store.clone(), single_attempt_config());
        let _alice = join(&room, "alice").await;

        let mut doc = Document::new(7);
        room.update("alice", encoded(&doc.apply_local_insert(0, "draft").unwrap()))
            .unwrap();
        store.set_failures(u32::MAX);
        assert!(room.leave("alice", None).await.unwrap());
        wait_for_state(&room, RoomState::Idle).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join("bob", Identity::new("bob", "Bob", "#FF6B6B"), tx)
            .await
            .unwrap();
        assert_eq!(caught_up_text(rx.recv().await), "draft");
        assert_eq!(room.inspect().await.unwrap().state, RoomState::Active);

        // Healthy storage no longer frees a room that has a peer
        store.set_failures(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains_key("room"));

        assert!(room.leave("bob", None).await.unwrap());
        wait_until_freed(&registry).await;
        assert_eq!(stored_text(&store).await.as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn test_join_during_persisting_revives_room() {
        let store = Arc::new(FlakyStore::new(0));
        let (room, registry) = spawn_room_with(store.clone(), single_attempt_config());
        let _alice = join(&room, "alice").await;

        let mut doc = Document::new(7);
        room.update("alice", encoded(&doc.apply_local_insert(0, "mid-flush").unwrap()))
            .unwrap();
        assert_eq!(room.inspect().await.unwrap().log_len, 1);

        store.set_stall(Duration::from_millis(200));
        assert!(room.leave("alice", None).await.unwrap());
        assert_eq!(room.inspect().await.unwrap().state, RoomState::Persisting);

        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join("bob", Identity::new("bob", "Bob", "#FF6B6B"), tx)
            .await
            .unwrap();
        assert_eq!(caught_up_text(rx.recv().await), "mid-flush");

        // The late flush acknowledgement must not close the revived room
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.contains_key("room"));
        let view = room.inspect().await.unwrap();
        assert_eq!(view.state, RoomState::Active);
        assert_eq!(view.peers.len(), 1);
        assert_eq!(stored_text(&store).await.as_deref(), Some("mid-flush"));
    }

    #[tokio::test]
    async fn test_oversized_catch_up_refuses_join() {
        let config = RoomConfig {
            max_message_size: 512,
            ..test_config()
        };
        let (room, _registry) = spawn_room_with(Arc::new(MemoryStore::new()), config);
        let _alice = join(&room, "alice").await;

        let mut doc = Document::new(7);
        let long = "x".repeat(600);
        room.update("alice", encoded(&doc.apply_local_insert(0, &long).unwrap()))
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let refused = room.join("bob", Identity::new("bob", "Bob", "#FF6B6B"), tx).await;
        assert!(matches!(refused, Err(SyncError::StateTooLarge { max: 512, .. })));
        assert!(rx.try_recv().is_err());

        let view = room.inspect().await.unwrap();
        assert_eq!(view.peers.len(), 1);
        assert_eq!(view.peers[0].peer_id, "alice");
    }

    #[tokio::test]
    async fn test_update_parking_too_much_is_refused() {
        let (room, _registry) = spawn_test_room(Arc::new(MemoryStore::new()));
        let mut alice = join(&room, "alice").await;
        let mut bob = join(&room, "bob").await;
        let _ = alice.recv().await; // PeerJoined(bob)

        let scattered = Update::new(
            (0..=MAX_PENDING as u64)
                .map(|k| Op::Delete(IdRange::new(42, 2 * k + 1, 1)))
                .collect(),
        );
        room.update("alice", encoded(&scattered)).unwrap();

        match alice.recv().await {
            Some(ServerMessage::Error { code, room_id, .. }) => {
                assert_eq!(code, ErrorCode::InvalidMessage);
                assert_eq!(room_id.as_deref(), Some("room"));
            }
            other => panic!("expected Error, got {:?}", other),
        }
        let view = room.inspect().await.unwrap();
        assert_eq!(view.pending_ops, 0);
        assert_eq!(view.log_len, 0);
        assert!(bob.try_recv().is_err());
    }
}
