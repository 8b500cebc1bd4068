//! Editor binding.
//!
//! Connects a local [`TextControl`] to a client replica of a room's document:
//! local edits become updates sent to the server, server messages are merged
//! and rendered back into the control, and remote selections are drawn as
//! cursor overlays.

pub mod control;
pub mod cursors;

pub use control::{diff, PlainTextControl, TextChange, TextControl, TextSelection};
pub use cursors::{build_overlays, CursorOverlay, LineCol};

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sync::codec::{self, CodecError};
use crate::sync::presence::{AwarenessState, Selection};
use crate::sync::protocol::{ClientMessage, ErrorCode, PeerInfo, ServerMessage};
use crate::sync::{Document, DocumentError, PeerId, RoomId, Update};

/// Errors raised by an [`EditorBinding`]
#[derive(Debug, Error)]
pub enum EditorError {
    #[error("Editor is not mounted")]
    NotMounted,

    #[error("Change at {offset}+{len} is outside the document ({doc_len} chars)")]
    OutOfRange {
        offset: usize,
        len: usize,
        doc_len: usize,
    },

    #[error("Server rejected request ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport closed")]
    TransportClosed,
}

/// Where the binding is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Detached,
    /// `Join` sent, waiting for `Joined`
    Joining,
    Mounted,
    Unmounted,
}

/// Binds one room's document to a text control.
pub struct EditorBinding<C: TextControl> {
    room_id: RoomId,
    doc: Document,
    control: C,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state: BindingState,
    you: Option<PeerInfo>,
    peers: HashMap<PeerId, PeerInfo>,
}

impl<C: TextControl> EditorBinding<C> {
    /// Create a binding with a fresh replica; nothing is sent until [`mount`](Self::mount).
    pub fn new(
        room_id: impl Into<String>,
        control: C,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self::with_document(room_id, Document::with_random_replica(), control, outbound)
    }

    pub fn with_document(
        room_id: impl Into<String>,
        doc: Document,
        control: C,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            doc,
            control,
            outbound,
            state: BindingState::Detached,
            you: None,
            peers: HashMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Mutable access for driving the control; report edits through
    /// [`on_local_change`](Self::on_local_change).
    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    /// How the server sees this peer, once joined
    pub fn you(&self) -> Option<&PeerInfo> {
        self.you.as_ref()
    }

    /// Other peers currently in the room
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    /// Join the room
    pub fn mount(&mut self, credentials: Option<String>) -> Result<(), EditorError> {
        if self.state == BindingState::Unmounted {
            return Err(EditorError::NotMounted);
        }
        self.send(ClientMessage::Join {
            room_id: self.room_id.clone(),
            credentials,
        })?;
        self.state = BindingState::Joining;
        Ok(())
    }

    /// Leave the room, clear remote cursors and stop handling events
    pub fn unmount(&mut self) -> Result<(), EditorError> {
        if self.state == BindingState::Unmounted {
            return Ok(());
        }
        let joined = self.state != BindingState::Detached;
        self.state = BindingState::Unmounted;
        self.peers.clear();
        self.control.render_overlays(&[]);

        if joined {
            self.send(ClientMessage::Leave {
                room_id: self.room_id.clone(),
            })?;
        }
        Ok(())
    }

    /// Apply a change the user already made in the control and send the
    /// resulting update. Returns `None` when the change was empty.
    pub fn on_local_change(&mut self, change: TextChange) -> Result<Option<Update>, EditorError> {
        if !matches!(self.state, BindingState::Joining | BindingState::Mounted) {
            return Err(EditorError::NotMounted);
        }

        let Some((offset, delete_len, insert)) = change.into_splice() else {
            return Ok(None);
        };
        let doc_len = self.doc.len();
        if offset + delete_len > doc_len {
            return Err(EditorError::OutOfRange {
                offset,
                len: delete_len,
                doc_len,
            });
        }

        let update = self
            .doc
            .apply_local_replace(offset..offset + delete_len, &insert)?;
        let bytes = codec::encode_update(&update)?;
        self.send(ClientMessage::Update {
            room_id: self.room_id.clone(),
            update: bytes.to_vec(),
        })?;

        // Local edits move remote cursors too
        self.render_overlays();
        Ok(Some(update))
    }

    /// Publish the local selection (character offsets) to the room
    pub fn set_local_selection(
        &mut self,
        selection: Option<TextSelection>,
        is_typing: bool,
    ) -> Result<(), EditorError> {
        if self.state != BindingState::Mounted {
            return Err(EditorError::NotMounted);
        }
        self.control.set_selection(selection);

        let selection = selection.map(|s| Selection {
            anchor: self.doc.anchor_at(s.anchor),
            head: self.doc.anchor_at(s.head),
        });
        self.send(ClientMessage::Awareness {
            room_id: self.room_id.clone(),
            state: AwarenessState {
                selection,
                is_typing,
            },
        })
    }

    /// Handle one message from the server
    pub fn on_server_message(&mut self, msg: &ServerMessage) -> Result<(), EditorError> {
        if matches!(self.state, BindingState::Detached | BindingState::Unmounted) {
            return Ok(());
        }

        match msg {
            ServerMessage::Joined {
                room_id,
                you,
                peers,
                snapshot,
                recent_updates,
            } if *room_id == self.room_id => {
                self.you = Some(you.clone());
                self.peers = peers
                    .iter()
                    .map(|p| (p.peer_id.clone(), p.clone()))
                    .collect();
                self.load_state(snapshot, recent_updates)?;
                self.state = BindingState::Mounted;
                debug!(
                    "Mounted room {} ({} chars, {} peers)",
                    self.room_id,
                    self.doc.len(),
                    self.peers.len()
                );
            }
            ServerMessage::Update {
                room_id, update, ..
            } if *room_id == self.room_id => self.apply_remote(update)?,
            ServerMessage::Resync { room_id, snapshot } if *room_id == self.room_id => {
                self.load_state(snapshot, &[])?;
            }
            ServerMessage::ResyncRequest { room_id } if *room_id == self.room_id => {
                let state = codec::encode_update(&self.doc.state_as_update())?;
                self.send(ClientMessage::Update {
                    room_id: self.room_id.clone(),
                    update: state.to_vec(),
                })?;
            }
            ServerMessage::PeerJoined { room_id, peer } if *room_id == self.room_id => {
                self.peers.insert(peer.peer_id.clone(), peer.clone());
                self.render_overlays();
            }
            ServerMessage::PeerLeft {
                room_id, peer_id, ..
            } if *room_id == self.room_id => {
                self.peers.remove(peer_id);
                self.render_overlays();
            }
            ServerMessage::Awareness {
                room_id,
                peer_id,
                state,
            } if *room_id == self.room_id => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.awareness = state.clone();
                    self.render_overlays();
                }
            }
            ServerMessage::Presence {
                room_id,
                peer_id,
                status,
            } if *room_id == self.room_id => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.status = *status;
                    self.render_overlays();
                } else if let Some(you) = self.you.as_mut().filter(|y| y.peer_id == *peer_id) {
                    you.status = *status;
                }
            }
            ServerMessage::Left { room_id } if *room_id == self.room_id => {
                self.state = BindingState::Unmounted;
                self.peers.clear();
                self.control.render_overlays(&[]);
            }
            ServerMessage::Error {
                code,
                message,
                room_id: Some(room_id),
            } if *room_id == self.room_id => {
                if self.state == BindingState::Joining {
                    self.state = BindingState::Detached;
                }
                return Err(EditorError::Server {
                    code: *code,
                    message: message.clone(),
                });
            }
            ServerMessage::Welcome { .. }
            | ServerMessage::Error { .. }
            | ServerMessage::Goodbye { .. }
            | ServerMessage::Joined { .. }
            | ServerMessage::Left { .. }
            | ServerMessage::PeerJoined { .. }
            | ServerMessage::PeerLeft { .. }
            | ServerMessage::Update { .. }
            | ServerMessage::ResyncRequest { .. }
            | ServerMessage::Resync { .. }
            | ServerMessage::Awareness { .. }
            | ServerMessage::Presence { .. }
            | ServerMessage::Pong { .. } => {}
        }
        Ok(())
    }

    /// Merge the catch-up state into the replica, keeping local edits
    fn load_state(&mut self, snapshot: &[u8], tail: &[Vec<u8>]) -> Result<(), EditorError> {
        let before = self.capture_selection();

        let snapshot = match codec::decode_snapshot(snapshot) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Undecodable snapshot for room {}: {}", self.room_id, e);
                return self.request_resync();
            }
        };
        self.doc.merge_snapshot(&snapshot)?;

        let mut broken = false;
        for bytes in tail {
            match codec::decode_update(bytes) {
                Ok(update) => {
                    self.doc.merge_remote(&update)?;
                }
                Err(e) => {
                    warn!("Skipping undecodable update in room {}: {}", self.room_id, e);
                    broken = true;
                }
            }
        }

        self.render(before);
        if broken {
            self.request_resync()?;
        }
        Ok(())
    }

    fn apply_remote(&mut self, bytes: &[u8]) -> Result<(), EditorError> {
        let update = match codec::decode_update(bytes) {
            Ok(update) => update,
            Err(e) => {
                warn!("Undecodable update in room {}: {}", self.room_id, e);
                return self.request_resync();
            }
        };

        let before = self.capture_selection();
        let outcome = self.doc.merge_remote(&update)?;
        if outcome.inserted > 0 || outcome.deleted > 0 {
            self.render(before);
        }
        Ok(())
    }

    /// The control's selection as anchors, so it survives the merge
    fn capture_selection(&self) -> Option<Selection> {
        self.control.selection().map(|s| Selection {
            anchor: self.doc.anchor_at(s.anchor),
            head: self.doc.anchor_at(s.head),
        })
    }

    fn render(&mut self, selection: Option<Selection>) {
        self.control.set_text(&self.doc.visible_text());
        let restored = selection.and_then(|s| {
            Some(TextSelection {
                anchor: self.doc.resolve_anchor(&s.anchor)?,
                head: self.doc.resolve_anchor(&s.head)?,
            })
        });
        if selection.is_some() {
            self.control.set_selection(restored);
        }
        self.render_overlays();
    }

    fn render_overlays(&mut self) {
        let overlays = build_overlays(&self.doc, self.peers.values());
        self.control.render_overlays(&overlays);
    }

    fn request_resync(&self) -> Result<(), EditorError> {
        self.send(ClientMessage::ResyncRequest {
            room_id: self.room_id.clone(),
        })
    }

    fn send(&self, msg: ClientMessage) -> Result<(), EditorError> {
        self.outbound
            .send(msg)
            .map_err(|_| EditorError::TransportClosed)
    }
}
