//! # codepad-collab: real-time collaborative text editing
//!
//! Keeps an editing surface and a replicated text in step, ships updates
//! and presence over WebSocket, and relays them between participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  SyncBridge  ┌────────────┐        WebSocket        ┌─────────────┐
//! │ EditorModel  │ ◄──────────► │ TextHandle │ ◄─ TransportSession ──► │ SyncServer  │
//! │ (surface)    │              │ (yrs)      │                         │ (relay)     │
//! └──────────────┘              └────────────┘                         └──────┬──────┘
//!        ▲                                                                    │
//!        │ roster                                                     ┌───────┴───────┐
//! ┌──────┴─────────┐                                                  │ BroadcastGroup│
//! │ PresenceManager│ ◄──────────── Awareness messages ──────────────► │ (per room)    │
//! └────────────────┘                                                  └───────────────┘
//! ```
//!
//! [`session::DocumentSession`] owns one of each client-side component per
//! open document and drives them from transport events.
//!
//! ## Modules
//!
//! - [`protocol`]: bincode wire messages and presence payloads
//! - [`broadcast`]: per-room fan-out
//! - [`server`]: WebSocket relay
//! - [`client`]: reconnecting transport session
//! - [`bridge`]: surface ↔ text binding
//! - [`presence`]: identity, cursors and roster
//! - [`session`]: per-document lifecycle

pub mod bridge;
pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use bridge::SyncBridge;
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ConnectionState, SessionConfig, SyncEvent, TransportSession};
pub use presence::{PresenceManager, RosterEntry, RosterListener, PALETTE};
pub use protocol::{CursorRange, MessageType, PresenceState, ProtocolError, SyncMessage, UserIdentity};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{DocumentSession, OpenRequest, SessionError, SessionState};
