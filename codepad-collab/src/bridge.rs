//! Two-way binding between a replicated text and an editing surface.
//!
//! ```text
//!   surface change ──► listener ──► TextHandle (bridge origin)
//!                                        │
//!                      skipped ◄─────────┤ own origin
//!                                        │
//!   surface edits ◄── observer ◄─────────┘ any other origin
//!         │
//!         └─► listener ignores it while the suppression counter is > 0
//! ```
//!
//! Neither direction ever echoes back into the other, so an edit crosses
//! the bridge at most once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use codepad_core::collab::origin_is;
use codepad_core::editor::utf16_len;
use codepad_core::{ChangeOp, ContentChangedEvent, EditorModel, Range, TextEdit, TextHandle};
use uuid::Uuid;
use yrs::Subscription;

fn lock<M>(surface: &Mutex<M>) -> MutexGuard<'_, M> {
    surface.lock().unwrap_or_else(|e| e.into_inner())
}

/// Counts nested remote applications; the surface listener stays silent
/// while any are in progress.
struct Suppress<'a>(&'a AtomicUsize);

impl<'a> Suppress<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for Suppress<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mirror text ops onto the surface, walking them with a cursor.
fn apply_ops<M: EditorModel>(surface: &mut M, ops: &[ChangeOp]) {
    let mut cursor = 0u32;
    for op in ops {
        match op {
            ChangeOp::Retain(n) => cursor = cursor.saturating_add(*n),
            ChangeOp::Insert(text) => {
                let at = surface.position_at(cursor);
                surface.apply_edits(&[TextEdit::insert(at, text.as_str())]);
                cursor = cursor.saturating_add(utf16_len(text));
            }
            ChangeOp::Delete(n) => {
                let len = surface.len();
                let start = cursor.min(len);
                let end = cursor.saturating_add(*n).min(len);
                if end > start {
                    let range = Range {
                        start: surface.position_at(start),
                        end: surface.position_at(end),
                    };
                    surface.apply_edits(&[TextEdit::delete(range)]);
                }
            }
        }
    }
}

pub struct SyncBridge {
    origin: String,
    depth: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    subscription: Option<Subscription>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl SyncBridge {
    /// Load the handle's content into the surface and start mirroring.
    pub fn new<M: EditorModel>(handle: &TextHandle, surface: Arc<Mutex<M>>) -> Self {
        let origin = format!("codepad:bridge:{}", Uuid::new_v4());
        let depth = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));

        lock(&surface).set_value(&handle.to_string());

        let subscription = {
            let surface = surface.clone();
            let depth = depth.clone();
            let active = active.clone();
            let own = origin.clone();
            handle.observe(move |ops, txn_origin| {
                if !active.load(Ordering::Acquire) || origin_is(txn_origin, &own) {
                    return;
                }
                let mut surface = lock(&surface);
                let _suppress = Suppress::enter(&depth);
                apply_ops(&mut *surface, ops);
            })
        };

        let listener_id = {
            let handle = handle.clone();
            let depth = depth.clone();
            let active = active.clone();
            let own = origin.clone();
            lock(&surface).subscribe(Box::new(move |event: &ContentChangedEvent| {
                if !active.load(Ordering::Acquire) || depth.load(Ordering::SeqCst) > 0 {
                    return;
                }
                for change in &event.changes {
                    let offset = handle.offset_at(change.range.start);
                    handle.replace_with_origin(offset, change.range_length, &change.text, &own);
                }
            }))
        };

        let detach: Box<dyn FnOnce() + Send> = Box::new(move || {
            lock(&surface).unsubscribe(listener_id);
        });

        log::debug!("Bridge {origin} attached");
        Self {
            origin,
            depth,
            active,
            subscription: Some(subscription),
            detach: Some(detach),
        }
    }

    /// Transaction origin used for edits coming from the surface.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Nesting depth of remote edits currently being applied.
    pub fn suppression_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Stop mirroring in both directions. Idempotent.
    ///
    /// Must not be called from inside a surface listener: it locks the
    /// surface to unregister.
    pub fn destroy(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        drop(self.subscription.take());
        if let Some(detach) = self.detach.take() {
            detach();
        }
        log::debug!("Bridge {} detached", self.origin);
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        self.destroy();
    }
}
