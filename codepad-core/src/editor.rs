//! Editing-surface model: positions, edits and content-change events.
//!
//! Coordinates follow the Monaco convention: 1-based line numbers and
//! 1-based columns, with columns and flat offsets counted in UTF-16 code
//! units. Lines are separated by `\n`.
//!
//! ```text
//! host keystroke ──► EditorModel::apply_edits()
//!                          │
//!                          ▼
//!                  ContentChangedEvent ──► subscribed listeners
//! ```

use serde::{Deserialize, Serialize};

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}

/// Byte index of the UTF-16 `offset` in `text`.
///
/// Offsets past the end clamp to `text.len()`; an offset that falls
/// inside a surrogate pair rounds down to the start of that character.
pub fn byte_index(text: &str, offset: u32) -> usize {
    let mut units = 0u32;
    for (idx, ch) in text.char_indices() {
        let next = units + ch.len_utf16() as u32;
        if next > offset {
            return idx;
        }
        units = next;
    }
    text.len()
}

/// Line/column of a flat UTF-16 offset (clamped to the text bounds).
pub fn position_at(text: &str, offset: u32) -> Position {
    let before = &text[..byte_index(text, offset)];
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let line_number = before.matches('\n').count() as u32 + 1;
    Position::new(line_number, utf16_len(&before[line_start..]) + 1)
}

/// Flat UTF-16 offset of a line/column.
///
/// Lines past the end map to the end of the text; columns past the end of
/// their line clamp to the line end.
pub fn offset_at(text: &str, position: Position) -> u32 {
    let target = position.line_number.max(1);
    let mut offset = 0u32;
    for (index, line) in text.split('\n').enumerate() {
        let line_len = utf16_len(line);
        if index as u32 + 1 == target {
            return offset + (position.column.max(1) - 1).min(line_len);
        }
        offset += line_len + 1;
    }
    utf16_len(text)
}

/// 1-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line_number: u32,
    pub column: u32,
}

impl Position {
    pub const START: Position = Position { line_number: 1, column: 1 };

    pub fn new(line_number: u32, column: u32) -> Self {
        Self { line_number, column }
    }
}

/// Inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start: Position::new(start_line, start_column),
            end: Position::new(end_line, end_column),
        }
    }

    pub fn collapsed(at: Position) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A single replacement: the text in `range` becomes `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    pub text: String,
}

impl TextEdit {
    pub fn replace(range: Range, text: impl Into<String>) -> Self {
        Self { range, text: text.into() }
    }

    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Self::replace(Range::collapsed(at), text)
    }

    pub fn delete(range: Range) -> Self {
        Self::replace(range, String::new())
    }
}

/// One span of a content-change notification.
///
/// `range`, `range_offset` and `range_length` describe the replaced span
/// in the model as it stood after the preceding changes of the same event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChange {
    pub range: Range,
    pub range_offset: u32,
    pub range_length: u32,
    pub text: String,
}

/// Notification emitted after the model content changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChangedEvent {
    pub changes: Vec<ContentChange>,
    /// Model version after the change.
    pub version_id: u64,
    /// Whole content was replaced via `set_value`.
    pub is_flush: bool,
}

pub type ContentListener = Box<dyn FnMut(&ContentChangedEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The editing surface as seen by the sync layer.
///
/// Listeners are invoked synchronously from inside `set_value` and
/// `apply_edits`, after the content has been updated.
pub trait EditorModel: Send + 'static {
    fn value(&self) -> String;

    fn set_value(&mut self, text: &str);

    /// Apply `edits` in order; each range refers to the content left by
    /// the previous edit. Out-of-range positions are clamped.
    fn apply_edits(&mut self, edits: &[TextEdit]);

    fn subscribe(&mut self, listener: ContentListener) -> ListenerId;

    /// Returns `false` if `id` was not registered.
    fn unsubscribe(&mut self, id: ListenerId) -> bool;

    fn len(&self) -> u32 {
        utf16_len(&self.value())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position_at(&self, offset: u32) -> Position {
        position_at(&self.value(), offset)
    }

    fn offset_at(&self, position: Position) -> u32 {
        offset_at(&self.value(), position)
    }
}

/// In-memory editing surface.
#[derive(Default)]
pub struct TextModel {
    text: String,
    version_id: u64,
    listeners: Vec<(ListenerId, ContentListener)>,
    next_listener: u64,
}

impl TextModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn version_id(&self) -> u64 {
        self.version_id
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Borrow the current content without cloning.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn emit(&mut self, changes: Vec<ContentChange>, is_flush: bool) {
        self.version_id += 1;
        let event = ContentChangedEvent {
            changes,
            version_id: self.version_id,
            is_flush,
        };
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for TextModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextModel")
            .field("text", &self.text)
            .field("version_id", &self.version_id)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl EditorModel for TextModel {
    fn value(&self) -> String {
        self.text.clone()
    }

    fn set_value(&mut self, text: &str) {
        let old_len = utf16_len(&self.text);
        let change = ContentChange {
            range: Range {
                start: Position::START,
                end: position_at(&self.text, old_len),
            },
            range_offset: 0,
            range_length: old_len,
            text: text.to_string(),
        };
        self.text = text.to_string();
        self.emit(vec![change], true);
    }

    fn apply_edits(&mut self, edits: &[TextEdit]) {
        let mut changes = Vec::with_capacity(edits.len());
        for edit in edits {
            let a = offset_at(&self.text, edit.range.start);
            let b = offset_at(&self.text, edit.range.end);
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            if start == end && edit.text.is_empty() {
                continue;
            }
            changes.push(ContentChange {
                range: Range {
                    start: position_at(&self.text, start),
                    end: position_at(&self.text, end),
                },
                range_offset: start,
                range_length: end - start,
                text: edit.text.clone(),
            });
            let from = byte_index(&self.text, start);
            let to = byte_index(&self.text, end);
            self.text.replace_range(from..to, &edit.text);
        }
        if !changes.is_empty() {
            self.emit(changes, false);
        }
    }

    fn subscribe(&mut self, listener: ContentListener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, listener));
        id
    }

    fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn len(&self) -> u32 {
        utf16_len(&self.text)
    }

    fn position_at(&self, offset: u32) -> Position {
        position_at(&self.text, offset)
    }

    fn offset_at(&self, position: Position) -> u32 {
        offset_at(&self.text, position)
    }
}
