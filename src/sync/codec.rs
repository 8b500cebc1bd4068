//! Binary encoding of updates and snapshots.
//!
//! Every payload starts with a two byte header, `[format version][kind]`,
//! followed by a bincode body. Decoding never trusts the input: the header is
//! checked, the body size is bounded and the decoded value is validated
//! structurally before it is handed to a document.

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};

use super::document::Snapshot;
use super::update::{MalformedOp, Update};

/// Current payload format version
pub const FORMAT_VERSION: u8 = 1;

/// Largest accepted payload body
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 2;

/// Kind byte that follows the version byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Update = 0x01,
    Snapshot = 0x02,
}

impl TryFrom<u8> for PayloadKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PayloadKind::Update),
            0x02 => Ok(PayloadKind::Snapshot),
            _ => Err(CodecError::UnknownKind(value)),
        }
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Payload too short: {0} bytes")]
    TooShort(usize),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown payload kind: 0x{0:02X}")]
    UnknownKind(u8),

    #[error("Expected {expected:?} payload, got {found:?}")]
    UnexpectedKind {
        expected: PayloadKind,
        found: PayloadKind,
    },

    #[error("Payload too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Invalid payload body: {0}")]
    Body(String),

    #[error("Invalid payload content: {0}")]
    Invalid(#[from] MalformedOp),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        CodecError::Body(err.to_string())
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PAYLOAD_SIZE as u64)
}

fn encode<T: serde::Serialize>(kind: PayloadKind, value: &T) -> Result<Bytes, CodecError> {
    let body = options().serialize(value)?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(kind as u8);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

fn body(expected: PayloadKind, data: &[u8]) -> Result<&[u8], CodecError> {
    let found = payload_kind(data)?;
    if found != expected {
        return Err(CodecError::UnexpectedKind { expected, found });
    }
    let body = &data[HEADER_LEN..];
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge(body.len(), MAX_PAYLOAD_SIZE));
    }
    Ok(body)
}

/// Check the header and read the kind byte.
fn payload_kind(data: &[u8]) -> Result<PayloadKind, CodecError> {
    match data {
        [FORMAT_VERSION, kind, ..] => PayloadKind::try_from(*kind),
        [version, _, ..] => Err(CodecError::UnsupportedVersion(*version)),
        _ => Err(CodecError::TooShort(data.len())),
    }
}

pub fn encode_update(update: &Update) -> Result<Bytes, CodecError> {
    encode(PayloadKind::Update, update)
}

pub fn decode_update(data: &[u8]) -> Result<Update, CodecError> {
    let update: Update = options().deserialize(body(PayloadKind::Update, data)?)?;
    update.validate()?;
    Ok(update)
}

pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Bytes, CodecError> {
    encode(PayloadKind::Snapshot, snapshot)
}

pub fn decode_snapshot(data: &[u8]) -> Result<Snapshot, CodecError> {
    let snapshot: Snapshot = options().deserialize(body(PayloadKind::Snapshot, data)?)?;
    snapshot.validate()?;
    Ok(snapshot)
}
