//! Remote cursor overlays.

use crate::sync::presence::PresenceStatus;
use crate::sync::protocol::PeerInfo;
use crate::sync::Document;

/// Zero-based line and column (in characters)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineCol {
    pub line: usize,
    pub column: usize,
}

impl LineCol {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Position of the character offset `offset` in `text`, clamped to the end
    pub fn at(text: &str, offset: usize) -> Self {
        let mut pos = LineCol::new(0, 0);
        for ch in text.chars().take(offset) {
            if ch == '\n' {
                pos.line += 1;
                pos.column = 0;
            } else {
                pos.column += 1;
            }
        }
        pos
    }
}

/// A remote peer's caret and selection as the control should draw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOverlay {
    pub peer_id: String,
    pub label: String,
    pub color: String,
    pub status: PresenceStatus,
    /// Where the selection started
    pub anchor: LineCol,
    /// Where the caret is
    pub head: LineCol,
}

impl CursorOverlay {
    pub fn has_selection(&self) -> bool {
        self.anchor != self.head
    }
}

/// Resolve every peer's selection against `doc`.
///
/// Peers without a selection, or whose anchors refer to characters this
/// replica has not seen yet, get no overlay.
pub fn build_overlays<'a>(
    doc: &Document,
    peers: impl IntoIterator<Item = &'a PeerInfo>,
) -> Vec<CursorOverlay> {
    let text = doc.visible_text();
    let mut overlays: Vec<CursorOverlay> = peers
        .into_iter()
        .filter_map(|peer| {
            let selection = peer.awareness.selection?;
            let anchor = doc.resolve_anchor(&selection.anchor)?;
            let head = doc.resolve_anchor(&selection.head)?;
            Some(CursorOverlay {
                peer_id: peer.peer_id.clone(),
                label: peer.name.clone(),
                color: peer.color.clone(),
                status: peer.status,
                anchor: LineCol::at(&text, anchor),
                head: LineCol::at(&text, head),
            })
        })
        .collect();
    overlays.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    overlays
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::document::Anchor;
    use crate::sync::presence::{AwarenessState, Selection};
    use crate::sync::update::Id;

    fn peer(peer_id: &str, selection: Option<Selection>) -> PeerInfo {
        PeerInfo {
            peer_id: peer_id.to_string(),
            user_id: format!("user-{}", peer_id),
            name: peer_id.to_uppercase(),
            avatar_url: None,
            color: "#45B7D1".to_string(),
            status: PresenceStatus::Active,
            awareness: AwarenessState {
                selection,
                is_typing: false,
            },
            joined_at: 0,
        }
    }

    #[test]
    fn test_line_col() {
        let text = "fn main() {\n    run();\n}";
        assert_eq!(LineCol::at(text, 0), LineCol::new(0, 0));
        assert_eq!(LineCol::at(text, 11), LineCol::new(0, 11));
        assert_eq!(LineCol::at(text, 12), LineCol::new(1, 0));
        assert_eq!(LineCol::at(text, 16), LineCol::new(1, 4));
        assert_eq!(LineCol::at(text, 1000), LineCol::new(2, 1));
    }

    #[test]
    fn test_overlays_resolve_anchors() {
        let mut doc = Document::new(1);
        doc.apply_local_insert(0, "ab\ncd").unwrap();

        let caret = Selection::caret(doc.anchor_at(4));
        let range = Selection {
            anchor: Anchor::Start,
            head: doc.anchor_at(2),
        };
        let peers = vec![
            peer("zed", Some(caret)),
            peer("amy", Some(range)),
            peer("idle", None),
        ];

        let overlays = build_overlays(&doc, &peers);
        assert_eq!(overlays.len(), 2);
        assert_eq!(overlays[0].label, "AMY");
        assert!(overlays[0].has_selection());
        assert_eq!(overlays[0].head, LineCol::new(0, 2));
        assert_eq!(overlays[1].peer_id, "zed");
        assert_eq!(overlays[1].head, LineCol::new(1, 1));
        assert!(!overlays[1].has_selection());
    }

    #[test]
    fn test_unknown_anchor_is_skipped() {
        let doc = Document::new(1);
        let ghost = Selection::caret(Anchor::After(Id::new(9, 3)));

        assert!(build_overlays(&doc, &[peer("p", Some(ghost))]).is_empty());
    }
}
