//! Lifecycle of one open document.
//!
//! ```text
//!            open()             Connected
//!  Unbound ──────────► Connecting ────────► Bound
//!     ▲                    ▲                  │
//!     │                    └── Disconnected ──┤
//!     │                                       │ close()
//!     └──────────────── Closing ◄─────────────┘
//! ```
//!
//! All events are handled one at a time by the owner of the session.
//! Teardown runs in reverse construction order: bridge, transport, text.

use std::sync::{Arc, Mutex};

use codepad_core::{Document, EditorModel, TextError, TextHandle};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::SyncBridge;
use crate::client::{ConnectionState, SessionConfig, SyncEvent, TransportSession};
use crate::presence::{PresenceManager, RosterEntry};
use crate::protocol::{CursorRange, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Connecting,
    Bound,
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("document id must not be empty")]
    EmptyDocumentId,
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),
    #[error("text error: {0}")]
    Text(#[from] TextError),
}

/// What to open.
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    pub doc_id: String,
    /// Inserted once if the shared text is still empty after the first sync.
    pub initial_content: Option<String>,
}

impl OpenRequest {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            initial_content: None,
        }
    }

    pub fn with_initial_content(mut self, content: impl Into<String>) -> Self {
        self.initial_content = Some(content.into());
        self
    }
}

pub struct DocumentSession {
    doc_id: String,
    state: SessionState,
    handle: Option<TextHandle>,
    transport: Option<TransportSession>,
    bridge: Option<SyncBridge>,
    presence: PresenceManager,
    events: Option<mpsc::Receiver<SyncEvent>>,
    initial_content: Option<String>,
    seed_attempted: bool,
    seeded: bool,
    synced: bool,
}

impl DocumentSession {
    /// Create the text and start connecting. Requires a Tokio runtime.
    pub fn open(config: &SessionConfig, request: OpenRequest) -> Result<Self, SessionError> {
        if request.doc_id.trim().is_empty() {
            return Err(SessionError::EmptyDocumentId);
        }
        let handle = TextHandle::new();
        let presence = PresenceManager::new();
        let mut transport =
            TransportSession::connect(config, &request.doc_id, presence.local_id(), &handle)?;
        let events = transport.take_event_rx();

        log::info!("Opened document {} as {}", request.doc_id, presence.identity().name);
        Ok(Self {
            doc_id: request.doc_id,
            state: SessionState::Connecting,
            handle: Some(handle),
            transport: Some(transport),
            bridge: None,
            presence,
            events,
            initial_content: request.initial_content.filter(|c| !c.is_empty()),
            seed_attempted: false,
            seeded: false,
            synced: false,
        })
    }

    /// Open a catalog document, seeding with its stored content.
    pub fn open_document(config: &SessionConfig, document: &Document) -> Result<Self, SessionError> {
        let mut request = OpenRequest::new(document.id.clone());
        request.initial_content = document.initial_content().map(str::to_string);
        Self::open(config, request)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Unbound | SessionState::Closing)
    }

    pub fn handle(&self) -> Option<&TextHandle> {
        self.handle.as_ref()
    }

    /// Current shared text, or `None` once closed.
    pub fn text(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.to_string())
    }

    pub fn local_id(&self) -> Uuid {
        self.presence.local_id()
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceManager {
        &mut self.presence
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.presence.roster()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map_or(ConnectionState::Closed, |t| t.connection_state())
    }

    pub fn has_surface(&self) -> bool {
        self.bridge.is_some()
    }

    /// Whether this session inserted the initial content.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Whether the one seeding decision has been made, inserted or not.
    pub fn seed_attempted(&self) -> bool {
        self.seed_attempted
    }

    pub fn has_synced(&self) -> bool {
        self.synced
    }

    /// Bind an editing surface. Replaces any surface bound before.
    pub fn attach_surface<M: EditorModel>(&mut self, surface: Arc<Mutex<M>>) {
        let Some(handle) = self.handle.as_ref() else {
            log::debug!("attach_surface on closed session {}", self.doc_id);
            return;
        };
        if let Some(mut old) = self.bridge.take() {
            old.destroy();
        }
        self.bridge = Some(SyncBridge::new(handle, surface));
    }

    pub fn detach_surface(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.destroy();
        }
    }

    /// Update the local cursor; sent right away while bound.
    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) {
        if self.is_closed() {
            return;
        }
        let update = self.presence.set_cursor(cursor);
        if self.state != SessionState::Bound {
            return;
        }
        if let (Some(state), Some(transport)) = (update, self.transport.as_ref()) {
            if let Err(e) = transport.set_local_presence(Some(&state)) {
                log::warn!("Failed to send cursor: {e}");
            }
        }
    }

    /// Insert the initial content if the shared text is empty and no seed
    /// happened yet. Returns whether text was inserted.
    pub fn seed_if_empty(&mut self) -> bool {
        if self.is_closed() || self.seed_attempted {
            return false;
        }
        let (Some(handle), Some(content)) = (self.handle.as_ref(), self.initial_content.as_deref()) else {
            return false;
        };
        self.seed_attempted = true;
        self.seeded = handle.seed_if_empty(content);
        if self.seeded {
            log::info!("Seeded document {} with {} bytes", self.doc_id, content.len());
        }
        self.seeded
    }

    pub fn handle_event(&mut self, event: SyncEvent) {
        if self.is_closed() {
            log::trace!("Dropping {event:?} for closed session {}", self.doc_id);
            return;
        }
        let (Some(handle), Some(transport)) = (self.handle.as_ref(), self.transport.as_ref()) else {
            return;
        };

        match event {
            SyncEvent::Connected => {
                self.state = SessionState::Bound;
                if let Err(e) = transport.send_sync_step1(handle.state_vector()) {
                    log::warn!("Failed to start sync for {}: {e}", self.doc_id);
                }
                let state = self.presence.publish();
                if let Err(e) = transport.set_local_presence(Some(&state)) {
                    log::warn!("Failed to publish presence: {e}");
                }
            }
            SyncEvent::Disconnected => {
                self.state = SessionState::Connecting;
                self.presence.clear_remote();
                log::info!("Document {} offline, edits continue locally", self.doc_id);
            }
            SyncEvent::Synced(diff) => {
                if let Err(e) = handle.apply_update(&diff) {
                    log::warn!("Failed to apply sync response: {e}");
                }
                let first = !self.synced;
                self.synced = true;
                if first {
                    self.seed_if_empty();
                }
            }
            SyncEvent::SyncRequested(sv) => match handle.diff_since(&sv) {
                Ok(diff) => {
                    if let Err(e) = transport.send_sync_step2(diff) {
                        log::warn!("Failed to answer sync request: {e}");
                    }
                }
                Err(e) => log::warn!("Invalid state vector from relay: {e}"),
            },
            SyncEvent::RemoteUpdate { peer_id, update } => {
                if let Err(e) = handle.apply_update(&update) {
                    log::warn!("Failed to apply update from {peer_id}: {e}");
                }
            }
            SyncEvent::RemotePresence { peer_id, clock, state } => {
                self.presence.apply_remote(peer_id, clock, state);
            }
            SyncEvent::PeerJoined(peer_id) => {
                log::debug!("Peer {peer_id} joined {}", self.doc_id);
            }
            SyncEvent::PeerLeft(peer_id) => {
                self.presence.remove_peer(&peer_id);
            }
        }
    }

    /// Handle every event already queued. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let Some(mut rx) = self.events.take() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
            handled += 1;
            if self.is_closed() {
                return handled;
            }
        }
        self.events = Some(rx);
        handled
    }

    /// Wait for the next event and handle it. `false` once the session is
    /// closed or the transport is gone.
    pub async fn process_next(&mut self) -> bool {
        let Some(mut rx) = self.events.take() else {
            return false;
        };
        match rx.recv().await {
            Some(event) => {
                self.handle_event(event);
                if !self.is_closed() {
                    self.events = Some(rx);
                }
                true
            }
            None => false,
        }
    }

    /// Tear everything down. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Unbound && self.handle.is_none() {
            return;
        }
        self.state = SessionState::Closing;
        if let Some(mut bridge) = self.bridge.take() {
            bridge.destroy();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        self.events = None;
        self.handle = None;
        self.presence.clear_remote();
        self.state = SessionState::Unbound;
        log::info!("Closed document {}", self.doc_id);
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}
