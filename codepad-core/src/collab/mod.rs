//! Replicated text handle backed by a yrs document.
//!
//! ```text
//!  local writes ──► TextHandle ──► observe_updates() ──► transport
//!                     │    ▲
//!        observe() ◄──┘    └── apply_update() ◄── remote bytes
//! ```
//!
//! Every mutation runs in a transaction tagged with an origin so observers
//! can tell who caused a change. All offsets are UTF-16 code units.

use std::fmt;

use yrs::types::Delta;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Observable, OffsetKind, Options, Origin, Out, ReadTxn, StateVector,
    Subscription, Text, TextRef, Transact, Update,
};

use crate::editor::{self, Position};

/// Name of the shared text inside every document.
pub const TEXT_NAME: &str = "monaco";

/// Origin of edits made through [`TextHandle::insert`] / [`TextHandle::delete`].
pub const LOCAL_ORIGIN: &str = "codepad:local";
/// Origin of updates received from other participants.
pub const REMOTE_ORIGIN: &str = "codepad:remote";
/// Origin of the one-time initial content insert.
pub const SEED_ORIGIN: &str = "codepad:seed";

/// Stand-in for non-text content so offsets stay aligned.
pub const EMBED_PLACEHOLDER: char = '\u{FFFC}';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to register observer: {0}")]
    Observer(String),
}

impl From<yrs::encoding::read::Error> for TextError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        TextError::Decode(e.to_string())
    }
}

/// One entry of a text delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Retain(u32),
    Insert(String),
    Delete(u32),
}

impl ChangeOp {
    fn from_delta(delta: &Delta) -> Self {
        match delta {
            Delta::Inserted(Out::Any(Any::String(s)), _) => ChangeOp::Insert(s.to_string()),
            Delta::Inserted(_, _) => ChangeOp::Insert(EMBED_PLACEHOLDER.to_string()),
            Delta::Deleted(len) => ChangeOp::Delete(*len),
            Delta::Retain(len, _) => ChangeOp::Retain(*len),
        }
    }
}

/// True if `origin` is the transaction origin named `name`.
pub fn origin_is(origin: Option<&Origin>, name: &str) -> bool {
    origin.is_some_and(|o| o.as_ref() == name.as_bytes())
}

/// Handle to a replicated text. Clones share the same document.
#[derive(Clone)]
pub struct TextHandle {
    doc: Doc,
    text: TextRef,
}

impl TextHandle {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self { doc, text }
    }

    /// Build a handle whose content is the given encoded update.
    pub fn from_update(update: &[u8]) -> Result<Self, TextError> {
        let handle = Self::new();
        handle.apply_update(update)?;
        Ok(handle)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn insert(&self, offset: u32, text: &str) {
        self.insert_with_origin(offset, text, LOCAL_ORIGIN);
    }

    pub fn delete(&self, offset: u32, len: u32) {
        self.delete_with_origin(offset, len, LOCAL_ORIGIN);
    }

    /// Insert under `origin`, clamping `offset` to the current length.
    pub fn insert_with_origin(&self, offset: u32, text: &str, origin: &str) {
        if text.is_empty() {
            return;
        }
        let mut txn = self.doc.transact_mut_with(origin);
        let offset = offset.min(self.text.len(&txn));
        self.text.insert(&mut txn, offset, text);
    }

    /// Delete `[offset, offset + len)` under `origin`, clamped to bounds.
    pub fn delete_with_origin(&self, offset: u32, len: u32, origin: &str) {
        let mut txn = self.doc.transact_mut_with(origin);
        let total = self.text.len(&txn);
        let start = offset.min(total);
        let len = len.min(total - start);
        if len > 0 {
            self.text.remove_range(&mut txn, start, len);
        }
    }

    /// Replace `[offset, offset + len)` with `text` in one transaction.
    pub fn replace_with_origin(&self, offset: u32, len: u32, text: &str, origin: &str) {
        let mut txn = self.doc.transact_mut_with(origin);
        let total = self.text.len(&txn);
        let start = offset.min(total);
        let len = len.min(total - start);
        if len > 0 {
            self.text.remove_range(&mut txn, start, len);
        }
        if !text.is_empty() {
            self.text.insert(&mut txn, start, text);
        }
    }

    /// Insert `content` only if the text is currently empty.
    ///
    /// The check and the insert share one transaction. Returns whether
    /// anything was inserted.
    pub fn seed_if_empty(&self, content: &str) -> bool {
        if content.is_empty() {
            return false;
        }
        let mut txn = self.doc.transact_mut_with(SEED_ORIGIN);
        let existing = self.text.len(&txn);
        if existing > 0 {
            log::debug!("Seed skipped, text already holds {existing} units");
            return false;
        }
        self.text.insert(&mut txn, 0, content);
        true
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat UTF-16 offset of a line/column in the current content.
    pub fn offset_at(&self, position: Position) -> u32 {
        editor::offset_at(&self.to_string(), position)
    }

    /// Register `f` for every committed change to the text.
    ///
    /// `f` runs inside the committing transaction and must not open
    /// another transaction on this handle. Dropping the returned
    /// subscription unregisters it.
    pub fn observe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&[ChangeOp], Option<&Origin>) + Send + Sync + 'static,
    {
        self.text.observe(move |txn, event| {
            let ops: Vec<ChangeOp> = event.delta(txn).iter().map(ChangeOp::from_delta).collect();
            f(&ops, txn.origin());
        })
    }

    /// Register `f` for every encoded (v1) update produced by this document.
    pub fn observe_updates<F>(&self, f: F) -> Result<Subscription, TextError>
    where
        F: Fn(&[u8], Option<&Origin>) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| f(&event.update, txn.origin()))
            .map_err(|e| TextError::Observer(format!("{e:?}")))
    }

    /// Encoded state vector of everything this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encoded update holding what a replica with state vector `sv` lacks.
    pub fn diff_since(&self, sv: &[u8]) -> Result<Vec<u8>, TextError> {
        let sv = StateVector::decode_v1(sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply an update received from another replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), TextError> {
        self.apply_update_with_origin(update, REMOTE_ORIGIN)
    }

    pub fn apply_update_with_origin(&self, update: &[u8], origin: &str) -> Result<(), TextError> {
        log::trace!("Applying {} byte update ({origin})", update.len());
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| TextError::Apply(format!("{e:?}")))
    }
}

impl Default for TextHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let txn = self.doc.transact();
        f.write_str(&self.text.get_string(&txn))
    }
}

impl fmt::Debug for TextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextHandle")
            .field("client_id", &self.client_id())
            .field("len", &self.len())
            .finish()
    }
}
