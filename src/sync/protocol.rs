//! Binary WebSocket protocol for room synchronization.
//!
//! This module defines the message format for client-server communication.
//! Messages are serialized with bincode behind a small frame header; update
//! and snapshot payloads produced by [`codec`](super::codec) travel as opaque
//! byte vectors so the server can relay them without re-encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::presence::{AwarenessState, PresenceStatus};
use super::{PeerId, RoomId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 5;

/// Message type identifiers carried in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Room membership
    Join = 0x20,
    Leave = 0x21,
    Joined = 0x22,
    Left = 0x23,
    PeerJoined = 0x24,
    PeerLeft = 0x25,

    // Document sync
    Update = 0x30,
    ResyncRequest = 0x31,
    Resync = 0x32,

    // Presence & cursors
    Awareness = 0x40,
    Presence = 0x41,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x20 => Ok(MessageType::Join),
            0x21 => Ok(MessageType::Leave),
            0x22 => Ok(MessageType::Joined),
            0x23 => Ok(MessageType::Left),
            0x24 => Ok(MessageType::PeerJoined),
            0x25 => Ok(MessageType::PeerLeft),
            0x30 => Ok(MessageType::Update),
            0x31 => Ok(MessageType::ResyncRequest),
            0x32 => Ok(MessageType::Resync),
            0x40 => Ok(MessageType::Awareness),
            0x41 => Ok(MessageType::Presence),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Message type mismatch: header says {0:?}, payload is {1:?}")]
    TypeMismatch(MessageType, MessageType),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake with client info
    Hello {
        protocol_version: u8,
        client_name: String,
        session_token: Option<String>,
    },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },

    /// Join a room; `credentials` is handed to the access policy
    Join {
        room_id: RoomId,
        credentials: Option<String>,
    },

    /// Leave a room
    Leave { room_id: RoomId },

    /// Encoded update delta
    Update { room_id: RoomId, update: Vec<u8> },

    /// Replace this peer's awareness record
    Awareness {
        room_id: RoomId,
        state: AwarenessState,
    },

    /// Ask the server for a full snapshot
    ResyncRequest { room_id: RoomId },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Welcome response with assigned peer ID
    Welcome {
        protocol_version: u8,
        peer_id: PeerId,
        session_token: String,
        server_time: i64,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        room_id: Option<RoomId>,
    },

    /// Graceful disconnect acknowledgment
    Goodbye { reason: Option<String> },

    /// Confirmation of joining a room with the catch-up state
    Joined {
        room_id: RoomId,
        /// How the server sees the joining peer
        you: PeerInfo,
        /// Other peers in the room
        peers: Vec<PeerInfo>,
        /// Compacted snapshot (codec encoded)
        snapshot: Vec<u8>,
        /// Updates applied since that snapshot, oldest first
        recent_updates: Vec<Vec<u8>>,
    },

    /// Confirmation of leaving a room
    Left { room_id: RoomId },

    /// Notification that a peer joined
    PeerJoined { room_id: RoomId, peer: PeerInfo },

    /// Notification that a peer left
    PeerLeft {
        room_id: RoomId,
        peer_id: PeerId,
        reason: Option<String>,
    },

    /// Update relayed from another peer
    Update {
        room_id: RoomId,
        from_peer: PeerId,
        update: Vec<u8>,
    },

    /// The server could not decode something this peer sent
    ResyncRequest { room_id: RoomId },

    /// Full state in answer to a resync request
    Resync { room_id: RoomId, snapshot: Vec<u8> },

    /// Awareness relayed from another peer
    Awareness {
        room_id: RoomId,
        peer_id: PeerId,
        state: AwarenessState,
    },

    /// Presence status change computed by the server
    Presence {
        room_id: RoomId,
        peer_id: PeerId,
        status: PresenceStatus,
    },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
            ClientMessage::Join { .. } => MessageType::Join,
            ClientMessage::Leave { .. } => MessageType::Leave,
            ClientMessage::Update { .. } => MessageType::Update,
            ClientMessage::Awareness { .. } => MessageType::Awareness,
            ClientMessage::ResyncRequest { .. } => MessageType::ResyncRequest,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
            ServerMessage::Joined { .. } => MessageType::Joined,
            ServerMessage::Left { .. } => MessageType::Left,
            ServerMessage::PeerJoined { .. } => MessageType::PeerJoined,
            ServerMessage::PeerLeft { .. } => MessageType::PeerLeft,
            ServerMessage::Update { .. } => MessageType::Update,
            ServerMessage::ResyncRequest { .. } => MessageType::ResyncRequest,
            ServerMessage::Resync { .. } => MessageType::Resync,
            ServerMessage::Awareness { .. } => MessageType::Awareness,
            ServerMessage::Presence { .. } => MessageType::Presence,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Information about a peer in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    /// Stable user identity from the access policy
    pub user_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub color: String,
    pub status: PresenceStatus,
    pub awareness: AwarenessState,
    pub joined_at: i64,
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    Unauthorized = 2,
    RoomNotFound = 3,
    RateLimited = 5,
    ServerError = 6,
    VersionMismatch = 7,
    RoomFull = 8,
    AlreadyJoined = 9,
    NotJoined = 10,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Length of the binary frame `msg` encodes to, without encoding it
    pub fn server_frame_len(msg: &ServerMessage) -> Result<usize, ProtocolError> {
        Ok(bincode::serialized_size(msg)? as usize + FRAME_HEADER_LEN)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        if msg.message_type() != msg_type {
            return Err(ProtocolError::TypeMismatch(msg_type, msg.message_type()));
        }
        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        if msg.message_type() != msg_type {
            return Err(ProtocolError::TypeMismatch(msg_type, msg.message_type()));
        }
        Ok(msg)
    }

    /// Create an error response message
    pub fn error_response(
        code: ErrorCode,
        message: impl Into<String>,
        room_id: Option<RoomId>,
    ) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
            room_id,
        }
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + FRAME_HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + FRAME_HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_uint(payload.len() as u64, 3);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < FRAME_HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                FRAME_HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload_len]))
    }
}
