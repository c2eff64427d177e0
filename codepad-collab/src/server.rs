//! WebSocket relay with one room per document.
//!
//! ```text
//! Client A ──┐
//!            ├── Room (doc_id) ── TextHandle ── BroadcastGroup
//! Client B ──┘        │
//!                     └── presence: last Awareness message per peer
//! ```
//!
//! Each room keeps an authoritative in-memory replica so late joiners can
//! catch up through the state-vector handshake:
//!
//! ```text
//! client                     relay
//!   │── PeerJoined ───────────►│  (stored presence replayed to client)
//!   │── SyncStep1(sv_c) ──────►│
//!   │◄── SyncStep2(diff) ──────│
//!   │◄── SyncStep1(sv_r) ──────│
//!   │── SyncStep2(diff) ──────►│  applied, fanned out as Delta
//! ```
//!
//! A connection whose broadcast receiver lags has missed fanned-out
//! updates; it is sent the room's full state and state vector again, plus
//! the stored presence of everyone else.
//!
//! Room state is dropped once the last peer leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use codepad_core::TextHandle;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::protocol::{websocket_config, MessageType, ProtocolError, SyncMessage, DEFAULT_MAX_MESSAGE_SIZE};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Messages buffered per connection before it lags.
    pub broadcast_capacity: usize,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CODEPAD_BIND_ADDR` and `CODEPAD_MAX_PEERS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("CODEPAD_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("CODEPAD_MAX_PEERS") {
            match raw.parse() {
                Ok(n) => config.max_peers_per_room = n,
                Err(_) => log::warn!("Ignoring invalid CODEPAD_MAX_PEERS={raw}"),
            }
        }
        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_connections: u64,
}

struct StoredPresence {
    clock: u64,
    encoded: Arc<Vec<u8>>,
}

struct DocumentRoom {
    text: TextHandle,
    broadcast: Arc<BroadcastGroup>,
    presence: HashMap<Uuid, StoredPresence>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            text: TextHandle::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            presence: HashMap::new(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, DocumentRoom>>>;

pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current text of a room, if it exists.
    pub async fn room_text(&self, doc_id: &str) -> Option<String> {
        self.rooms.read().await.get(doc_id).map(|r| r.text.to_string())
    }
}

/// Per-connection state once the peer has announced itself.
struct Membership {
    peer_id: Uuid,
    doc_id: String,
    rx: broadcast::Receiver<Envelope>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_config = websocket_config(config.max_message_size);
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;

    log::debug!("WebSocket connection established from {addr}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut member: Option<Membership> = None;
    let result = pump(ws_stream, addr, &rooms, &stats, &config, &mut member).await;

    if let Some(m) = member {
        leave_room(&rooms, &m.doc_id, m.peer_id).await;
    }
    let mut s = stats.write().await;
    s.active_connections -= 1;
    s.active_rooms = rooms.read().await.len();

    result
}

/// Message loop of one connection; `member` is set once the peer joins.
async fn pump(
    ws_stream: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    rooms: &Rooms,
    stats: &Arc<RwLock<ServerStats>>,
    config: &ServerConfig,
    member: &mut Option<Membership>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let sync_msg = match SyncMessage::decode(&data) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Failed to decode message from {addr}: {e}");
                        continue;
                    }
                };
                {
                    let mut s = stats.write().await;
                    s.total_messages += 1;
                    s.total_bytes += data.len() as u64;
                }

                if sync_msg.msg_type == MessageType::PeerJoined {
                    if member.is_some() {
                        log::warn!("Duplicate join from {addr}, ignoring");
                        continue;
                    }
                    match join_room(rooms, config, &sync_msg).await {
                        Some((rx, snapshot)) => {
                            *member = Some(Membership {
                                peer_id: sync_msg.peer_id,
                                doc_id: sync_msg.doc_id,
                                rx,
                            });
                            stats.write().await.active_rooms = rooms.read().await.len();
                            for encoded in snapshot {
                                ws_sender.send(Message::Binary(encoded.to_vec().into())).await?;
                            }
                        }
                        None => {
                            stats.write().await.rejected_connections += 1;
                            ws_sender.send(Message::Close(None)).await?;
                            break;
                        }
                    }
                    continue;
                }

                let Some(m) = member.as_ref() else {
                    log::debug!("Message {:?} from {addr} before join, ignoring", sync_msg.msg_type);
                    continue;
                };
                for reply in handle_room_message(rooms, m, sync_msg).await {
                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                }
            }

            msg = async {
                match member.as_mut() {
                    Some(m) => m.rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(m) = member.as_ref() else {
                    continue;
                };
                match msg {
                    Ok(envelope) => {
                        if envelope.from == m.peer_id {
                            continue;
                        }
                        ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {} lagged by {n} messages, resyncing", m.peer_id);
                        for frame in resync(rooms, m).await? {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    Ok(())
}

/// Add the sender to its room. Returns the broadcast receiver and the
/// stored presence to replay, or `None` when the room is full.
async fn join_room(
    rooms: &Rooms,
    config: &ServerConfig,
    msg: &SyncMessage,
) -> Option<(broadcast::Receiver<Envelope>, Vec<Arc<Vec<u8>>>)> {
    let mut rooms_w = rooms.write().await;
    let room = rooms_w
        .entry(msg.doc_id.clone())
        .or_insert_with(|| DocumentRoom::new(config.broadcast_capacity));

    if room.broadcast.peer_count().await >= config.max_peers_per_room {
        log::warn!("Room {} is full ({} peers), rejecting {}", msg.doc_id, config.max_peers_per_room, msg.peer_id);
        if room.broadcast.peer_count().await == 0 {
            rooms_w.remove(&msg.doc_id);
        }
        return None;
    }

    let rx = room.broadcast.add_peer(msg.peer_id).await;
    let snapshot = room.presence.values().map(|p| p.encoded.clone()).collect();
    if let Err(e) = room.broadcast.broadcast(msg) {
        log::warn!("Failed to announce {}: {e}", msg.peer_id);
    }
    log::info!("Peer {} joined doc {}", msg.peer_id, msg.doc_id);
    Some((rx, snapshot))
}

/// Apply a message from a joined peer. Returns direct replies.
async fn handle_room_message(rooms: &Rooms, member: &Membership, msg: SyncMessage) -> Vec<SyncMessage> {
    let doc_id = member.doc_id.as_str();
    let mut rooms_w = rooms.write().await;
    let Some(room) = rooms_w.get_mut(doc_id) else {
        return Vec::new();
    };

    match msg.msg_type {
        MessageType::SyncStep1 => match room.text.diff_since(&msg.payload) {
            Ok(diff) => vec![
                SyncMessage::sync_step2(Uuid::nil(), doc_id, diff),
                SyncMessage::sync_step1(Uuid::nil(), doc_id, room.text.state_vector()),
            ],
            Err(e) => {
                log::warn!("Bad state vector from {}: {e}", member.peer_id);
                Vec::new()
            }
        },

        MessageType::SyncStep2 | MessageType::Delta => {
            if let Err(e) = room.text.apply_update(&msg.payload) {
                log::warn!("Rejected update from {}: {e}", member.peer_id);
                return Vec::new();
            }
            log::trace!("Update from {} ({} bytes) in {doc_id}", member.peer_id, msg.payload.len());
            let fanout = msg.retagged(MessageType::Delta);
            if let Err(e) = room.broadcast.broadcast(&fanout) {
                log::warn!("Failed to fan out update: {e}");
            }
            Vec::new()
        }

        MessageType::Awareness => {
            let peer_id = member.peer_id;
            let stale = room.presence.get(&peer_id).is_some_and(|p| p.clock > msg.clock);
            if stale {
                log::trace!("Dropping stale presence from {peer_id}");
                return Vec::new();
            }
            let encoded = match msg.encode() {
                Ok(e) => Arc::new(e),
                Err(e) => {
                    log::warn!("Failed to encode presence: {e}");
                    return Vec::new();
                }
            };
            match msg.presence_state() {
                Ok(Some(_)) => {
                    room.presence.insert(peer_id, StoredPresence { clock: msg.clock, encoded: encoded.clone() });
                }
                Ok(None) => {
                    room.presence.remove(&peer_id);
                }
                Err(e) => {
                    log::warn!("Invalid presence from {peer_id}: {e}");
                    return Vec::new();
                }
            }
            room.broadcast.broadcast_raw(peer_id, encoded);
            Vec::new()
        }

        MessageType::Ping => vec![SyncMessage::pong(Uuid::nil())],

        other => {
            log::debug!("Unhandled message type: {other:?}");
            Vec::new()
        }
    }
}

/// Frames that bring a peer which missed fanned-out messages back in
/// step: the room's full state, its state vector, and the stored presence
/// of the other peers.
async fn resync(rooms: &Rooms, member: &Membership) -> Result<Vec<Arc<Vec<u8>>>, ProtocolError> {
    let rooms_r = rooms.read().await;
    let Some(room) = rooms_r.get(&member.doc_id) else {
        return Ok(Vec::new());
    };
    let doc_id = member.doc_id.as_str();
    let mut frames = vec![
        Arc::new(SyncMessage::sync_step2(Uuid::nil(), doc_id, room.text.encode_state()).encode()?),
        Arc::new(SyncMessage::sync_step1(Uuid::nil(), doc_id, room.text.state_vector()).encode()?),
    ];
    frames.extend(
        room.presence
            .iter()
            .filter(|(id, _)| **id != member.peer_id)
            .map(|(_, p)| p.encoded.clone()),
    );
    Ok(frames)
}

async fn leave_room(rooms: &Rooms, doc_id: &str, peer_id: Uuid) {
    let mut rooms_w = rooms.write().await;
    let Some(room) = rooms_w.get_mut(doc_id) else {
        return;
    };
    room.broadcast.remove_peer(&peer_id).await;
    room.presence.remove(&peer_id);
    if let Err(e) = room.broadcast.broadcast(&SyncMessage::peer_left(peer_id, doc_id)) {
        log::warn!("Failed to announce departure of {peer_id}: {e}");
    }
    log::info!("Peer {peer_id} left doc {doc_id}");

    if room.broadcast.peer_count().await == 0 {
        rooms_w.remove(doc_id);
        log::info!("Room {doc_id} removed (empty)");
    }
}
