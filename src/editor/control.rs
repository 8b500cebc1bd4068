//! Local text controls.

use super::cursors::CursorOverlay;

/// Selection in a control, in character offsets; `anchor == head` is a caret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSelection {
    pub anchor: usize,
    pub head: usize,
}

impl TextSelection {
    pub fn caret(at: usize) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }
}

/// A change the user made in the control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextChange {
    /// Delete `delete_len` characters at `offset`, then insert `insert` there
    Splice {
        offset: usize,
        delete_len: usize,
        insert: String,
    },
    /// Whole-buffer change for controls that only report full contents
    Replace { before: String, after: String },
}

impl TextChange {
    /// Reduce the change to a single splice, or `None` if it changes nothing.
    pub fn into_splice(self) -> Option<(usize, usize, String)> {
        match self {
            TextChange::Splice {
                offset,
                delete_len,
                insert,
            } => {
                if delete_len == 0 && insert.is_empty() {
                    None
                } else {
                    Some((offset, delete_len, insert))
                }
            }
            TextChange::Replace { before, after } => diff(&before, &after),
        }
    }
}

/// Minimal splice turning `before` into `after` by trimming the common
/// prefix and suffix. Offsets count characters.
pub fn diff(before: &str, after: &str) -> Option<(usize, usize, String)> {
    if before == after {
        return None;
    }

    let old: Vec<char> = before.chars().collect();
    let new: Vec<char> = after.chars().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // The suffix may not overlap the prefix
    let room = (old.len() - prefix).min(new.len() - prefix);
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .take(room)
        .count();

    let delete_len = old.len() - suffix - prefix;
    let insert: String = new[prefix..new.len() - suffix].iter().collect();
    Some((prefix, delete_len, insert))
}

/// The editing surface an [`EditorBinding`](super::EditorBinding) drives.
pub trait TextControl {
    /// Current contents
    fn text(&self) -> String;

    /// Replace the contents without reporting a local change
    fn set_text(&mut self, text: &str);

    fn selection(&self) -> Option<TextSelection>;

    fn set_selection(&mut self, selection: Option<TextSelection>);

    /// Draw remote cursors; an empty slice clears them
    fn render_overlays(&mut self, overlays: &[CursorOverlay]);
}

/// In-memory control for tests and headless clients.
#[derive(Debug, Clone, Default)]
pub struct PlainTextControl {
    text: String,
    selection: Option<TextSelection>,
    overlays: Vec<CursorOverlay>,
}

impl PlainTextControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn overlays(&self) -> &[CursorOverlay] {
        &self.overlays
    }

    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Type `input` over the current selection (or at the end) like a user
    /// would, leaving a caret behind it.
    pub fn type_text(&mut self, input: &str) -> TextChange {
        let selection = self
            .selection
            .unwrap_or_else(|| TextSelection::caret(self.len()));
        self.splice(selection.start(), selection.end() - selection.start(), input)
    }

    /// Delete `count` characters before the caret.
    pub fn backspace(&mut self, count: usize) -> TextChange {
        let selection = self
            .selection
            .unwrap_or_else(|| TextSelection::caret(self.len()));
        if selection.start() != selection.end() {
            return self.splice(selection.start(), selection.end() - selection.start(), "");
        }
        let start = selection.head.saturating_sub(count);
        self.splice(start, selection.head - start, "")
    }

    /// Swap the whole buffer, as a formatter or paste-all would.
    pub fn replace_all(&mut self, text: &str) -> TextChange {
        let before = std::mem::replace(&mut self.text, text.to_string());
        self.selection = Some(TextSelection::caret(self.len()));
        TextChange::Replace {
            before,
            after: self.text.clone(),
        }
    }

    fn splice(&mut self, offset: usize, delete_len: usize, insert: &str) -> TextChange {
        let start = byte_offset(&self.text, offset);
        let end = byte_offset(&self.text, offset + delete_len);
        self.text.replace_range(start..end, insert);
        self.selection = Some(TextSelection::caret(offset + insert.chars().count()));
        TextChange::Splice {
            offset,
            delete_len,
            insert: insert.to_string(),
        }
    }
}

impl TextControl for PlainTextControl {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn selection(&self) -> Option<TextSelection> {
        self.selection
    }

    fn set_selection(&mut self, selection: Option<TextSelection>) {
        self.selection = selection;
    }

    fn render_overlays(&mut self, overlays: &[CursorOverlay]) {
        self.overlays = overlays.to_vec();
    }
}

/// Byte index of the character at `offset`, clamped to the end.
fn byte_offset(text: &str, offset: usize) -> usize {
    text.char_indices()
        .nth(offset)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}
