//! Presence: who is in the document and where their cursor is.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceManager::set_cursor()  ──► PresenceState ──► Awareness message
//!                                                          │  (relay)
//!                                                          ▼
//!                                       remote PresenceManager::apply_remote()
//!                                                          │
//!                                                          ▼
//!                                              roster listener (UI)
//! ```
//!
//! Each participant writes only its own entry. Remote entries are
//! last-writer-wins on the sender's presence clock.

use indexmap::IndexMap;
use uuid::Uuid;

use crate::protocol::{CursorRange, PresenceState, UserIdentity};

/// Colors handed out to participants.
pub const PALETTE: [&str; 8] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
];

const PSEUDONYM_LEN: usize = 5;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `User_` followed by five base-36 characters taken from `id`.
pub fn pseudonym(id: Uuid) -> String {
    let mut bits = id.as_u128() >> 8;
    let mut name = String::from("User_");
    for _ in 0..PSEUDONYM_LEN {
        name.push(BASE36[(bits % 36) as usize] as char);
        bits /= 36;
    }
    name
}

pub fn palette_color(id: Uuid) -> &'static str {
    PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize]
}

/// One visible participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub peer_id: Uuid,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
    pub is_local: bool,
}

pub type RosterListener = Box<dyn FnMut(&[RosterEntry]) + Send>;

#[derive(Debug, Clone)]
struct RemoteEntry {
    clock: u64,
    state: PresenceState,
}

pub struct PresenceManager {
    local_id: Uuid,
    identity: UserIdentity,
    cursor: Option<CursorRange>,
    /// Local state has been published on the current connection.
    online: bool,
    remote: IndexMap<Uuid, RemoteEntry>,
    listener: Option<RosterListener>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(local_id: Uuid) -> Self {
        Self {
            local_id,
            identity: UserIdentity {
                name: pseudonym(local_id),
                color: palette_color(local_id).to_string(),
            },
            cursor: None,
            online: false,
            remote: IndexMap::new(),
            listener: None,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn cursor(&self) -> Option<CursorRange> {
        self.cursor
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn local_state(&self) -> PresenceState {
        PresenceState {
            user: Some(self.identity.clone()),
            cursor: self.cursor,
        }
    }

    /// Mark the local state as published and return it for sending.
    pub fn publish(&mut self) -> PresenceState {
        let first = !self.online;
        self.online = true;
        if first {
            self.notify();
        }
        self.local_state()
    }

    /// Store the local cursor. Returns the state to send if online.
    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) -> Option<PresenceState> {
        if self.cursor == cursor {
            return None;
        }
        self.cursor = cursor;
        if !self.online {
            return None;
        }
        self.notify();
        Some(self.local_state())
    }

    /// Apply a remote update. `None` removes the entry. Returns whether
    /// anything changed.
    pub fn apply_remote(&mut self, peer_id: Uuid, clock: u64, state: Option<PresenceState>) -> bool {
        if peer_id == self.local_id {
            return false;
        }
        if let Some(existing) = self.remote.get(&peer_id) {
            if existing.clock >= clock {
                log::trace!("Ignoring stale presence from {peer_id} ({clock} <= {})", existing.clock);
                return false;
            }
        }
        match state {
            Some(state) => {
                match self.remote.get_mut(&peer_id) {
                    Some(entry) => {
                        entry.clock = clock;
                        entry.state = state;
                    }
                    None => {
                        self.remote.insert(peer_id, RemoteEntry { clock, state });
                    }
                }
            }
            None => {
                if self.remote.shift_remove(&peer_id).is_none() {
                    return false;
                }
            }
        }
        self.notify();
        true
    }

    /// Drop a participant that disconnected.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        let removed = self.remote.shift_remove(peer_id).is_some();
        if removed {
            log::debug!("Presence of {peer_id} removed");
            self.notify();
        }
        removed
    }

    /// Forget every remote participant and go offline.
    pub fn clear_remote(&mut self) {
        let had_entries = !self.remote.is_empty() || self.online;
        self.remote.clear();
        self.online = false;
        if had_entries {
            self.notify();
        }
    }

    /// Visible participants: the local one first once published, then
    /// remote ones in arrival order. Entries without identity are skipped.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let local = self.online.then(|| RosterEntry {
            peer_id: self.local_id,
            name: self.identity.name.clone(),
            color: self.identity.color.clone(),
            cursor: self.cursor,
            is_local: true,
        });
        let remote = self.remote.iter().filter_map(|(id, entry)| {
            entry.state.user.as_ref().map(|user| RosterEntry {
                peer_id: *id,
                name: user.name.clone(),
                color: user.color.clone(),
                cursor: entry.state.cursor,
                is_local: false,
            })
        });
        local.into_iter().chain(remote).collect()
    }

    /// Raw states of everyone known, including invisible ones.
    pub fn states(&self) -> Vec<(Uuid, PresenceState)> {
        let local = self.online.then(|| (self.local_id, self.local_state()));
        local
            .into_iter()
            .chain(self.remote.iter().map(|(id, e)| (*id, e.state.clone())))
            .collect()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Replace the roster listener. It runs synchronously after every change.
    pub fn on_roster_change(&mut self, listener: RosterListener) {
        self.listener = Some(listener);
    }

    fn notify(&mut self) {
        if self.listener.is_none() {
            return;
        }
        let roster = self.roster();
        if let Some(listener) = self.listener.as_mut() {
            listener(&roster);
        }
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}
