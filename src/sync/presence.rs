//! Presence and cursor management for real-time collaboration.
//!
//! This module handles ephemeral state that is never persisted:
//! - Awareness records (selection anchors, typing indicator), owned and
//!   replaced wholesale by the peer they describe
//! - Presence status (active/idle/away) derived from activity on the server
//!
//! A [`RoomPresence`] lives inside its room actor and is only touched from
//! that task.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::document::Anchor;
use super::protocol::PeerInfo;
use super::PeerId;
use crate::auth::Identity;

/// How long before a peer is considered idle (no activity)
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long before a peer is considered away
pub const AWAY_TIMEOUT: Duration = Duration::from_secs(300);

/// Selection expressed as stable anchors; `anchor == head` is a bare caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Anchor,
    pub head: Anchor,
}

impl Selection {
    pub fn caret(at: Anchor) -> Self {
        Self {
            anchor: at,
            head: at,
        }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

/// Per-peer awareness record as published by that peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// Current selection, `None` when the editor is not focused
    pub selection: Option<Selection>,
    pub is_typing: bool,
}

/// Presence status for a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    /// Actively editing
    #[default]
    Active,
    /// No recent activity
    Idle,
    /// Extended inactivity
    Away,
}

impl PresenceStatus {
    /// Status after `inactive` time without activity.
    pub fn for_inactivity(inactive: Duration) -> Self {
        if inactive > AWAY_TIMEOUT {
            PresenceStatus::Away
        } else if inactive > IDLE_TIMEOUT {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Active
        }
    }
}

/// Complete presence information for a peer in one room
#[derive(Debug, Clone)]
pub struct Presence {
    pub peer_id: PeerId,
    pub identity: Identity,
    pub status: PresenceStatus,
    pub awareness: AwarenessState,
    /// When the peer joined (seconds since epoch)
    pub joined_at: i64,
    last_active: Instant,
}

impl Presence {
    pub fn new(peer_id: impl Into<String>, identity: Identity) -> Self {
        Self {
            peer_id: peer_id.into(),
            identity,
            status: PresenceStatus::Active,
            awareness: AwarenessState::default(),
            joined_at: chrono::Utc::now().timestamp(),
            last_active: Instant::now(),
        }
    }

    /// Record activity and set status to active
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
        self.status = PresenceStatus::Active;
    }

    /// Update status based on inactivity; returns true if it changed
    pub fn update_status(&mut self) -> bool {
        let status = PresenceStatus::for_inactivity(self.last_active.elapsed());
        let changed = status != self.status;
        self.status = status;
        changed
    }

    /// Replace the awareness record
    pub fn set_awareness(&mut self, state: AwarenessState) {
        self.awareness = state;
        self.touch();
    }

    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            user_id: self.identity.user_id.clone(),
            name: self.identity.display_name.clone(),
            avatar_url: self.identity.avatar_url.clone(),
            color: self.identity.color.clone(),
            status: self.status,
            awareness: self.awareness.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// Presence state for all peers of one room
#[derive(Debug, Default)]
pub struct RoomPresence {
    peers: HashMap<PeerId, Presence>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new peer
    pub fn add_peer(&mut self, presence: Presence) -> Result<(), PresenceError> {
        if self.peers.contains_key(&presence.peer_id) {
            return Err(PresenceError::PeerExists(presence.peer_id));
        }
        self.peers.insert(presence.peer_id.clone(), presence);
        Ok(())
    }

    /// Remove a peer and its awareness record
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Presence> {
        self.peers.remove(peer_id)
    }

    /// Replace a peer's awareness record (last write wins)
    pub fn set_awareness(&mut self, peer_id: &str, state: AwarenessState) -> Result<(), PresenceError> {
        let presence = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| PresenceError::PeerNotFound(peer_id.to_string()))?;
        presence.set_awareness(state);
        Ok(())
    }

    /// Record activity for a peer
    pub fn touch(&mut self, peer_id: &str) -> Option<PresenceStatus> {
        let presence = self.peers.get_mut(peer_id)?;
        let before = presence.status;
        presence.touch();
        (before != presence.status).then_some(presence.status)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Presence> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Peer infos of everyone except `exclude`
    pub fn peer_infos_except(&self, exclude: &str) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.peer_id != exclude)
            .map(Presence::to_peer_info)
            .collect();
        infos.sort_by_key(|info| info.joined_at);
        infos
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Update all peer statuses based on activity; returns the changes
    pub fn update_all_statuses(&mut self) -> Vec<(PeerId, PresenceStatus)> {
        self.peers
            .values_mut()
            .filter_map(|p| p.update_status().then(|| (p.peer_id.clone(), p.status)))
            .collect()
    }
}

/// Errors related to presence operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Peer already exists: {0}")]
    PeerExists(PeerId),
}
