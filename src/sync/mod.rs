//! Synchronization module for CRDT-based real-time collaboration.
//!
//! This module implements the replicated text document engine:
//! - [`document`]: sequence CRDT holding one snippet buffer
//! - [`codec`]: binary encoding of updates and snapshots
//! - [`protocol`]: framed client/server messages
//! - [`room`]: one actor task per live room
//! - [`server`]: room and peer registries
//! - [`presence`]: awareness records and presence status

pub mod codec;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod update;

pub use document::{Anchor, Document, DocumentError, MergeOutcome, Snapshot};
pub use server::{ServerStats, SyncServer, SyncServerConfig};
pub use update::{Id, Op, Update};

use thiserror::Error;

use self::codec::CodecError;
use crate::auth::AccessError;

/// Unique identifier for a room (one snippet buffer)
pub type RoomId = String;

/// Unique identifier for a connected peer
pub type PeerId = String;

/// Replica identifier used in character ids
pub type ReplicaId = u64;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Room is full: {0}")]
    RoomFull(RoomId),

    #[error("Room is closing: {0}")]
    RoomClosed(RoomId),

    #[error("Peer {peer_id} already joined room {room_id}")]
    AlreadyJoined { peer_id: PeerId, room_id: RoomId },

    #[error("Peer {peer_id} has not joined room {room_id}")]
    NotJoined { peer_id: PeerId, room_id: RoomId },

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AccessError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State of room {room_id} is too large to send ({size} bytes, max {max})")]
    StateTooLarge {
        room_id: RoomId,
        size: usize,
        max: usize,
    },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wire error code for this error
    pub fn code(&self) -> protocol::ErrorCode {
        use protocol::ErrorCode;
        match self {
            SyncError::RoomNotFound(_) | SyncError::RoomClosed(_) => ErrorCode::RoomNotFound,
            SyncError::PeerNotFound(_) | SyncError::NotJoined { .. } => ErrorCode::NotJoined,
            SyncError::RoomFull(_) => ErrorCode::RoomFull,
            SyncError::AlreadyJoined { .. } => ErrorCode::AlreadyJoined,
            SyncError::Unauthorized(_) => ErrorCode::Unauthorized,
            SyncError::InvalidMessage(_) | SyncError::Codec(_) | SyncError::Document(_) => {
                ErrorCode::InvalidMessage
            }
            SyncError::Storage(_)
            | SyncError::StateTooLarge { .. }
            | SyncError::ConnectionError(_)
            | SyncError::Internal(_) => ErrorCode::ServerError,
        }
    }
}
