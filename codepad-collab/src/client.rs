//! WebSocket transport for one document session.
//!
//! ```text
//!  TextHandle ── observe_updates ──┐
//!  send_sync_step1/2, presence ────┤ unbounded mpsc
//!                                  ▼
//!                          driver task ◄──► WebSocket {endpoint}/{doc_id}
//!                                  │
//!                                  ▼ mpsc(event_capacity)
//!                              SyncEvent
//! ```
//!
//! The driver reconnects with exponential backoff. Outbound messages are
//! dropped while offline; the sync handshake after reconnecting carries
//! whatever the relay missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use codepad_core::collab::{origin_is, REMOTE_ORIGIN};
use codepad_core::TextHandle;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::Subscription;

use crate::protocol::{
    websocket_config, MessageType, PresenceState, ProtocolError, SyncMessage, DEFAULT_MAX_MESSAGE_SIZE,
};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/document";

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL; the document id is appended as the last path segment.
    pub endpoint: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub event_capacity: usize,
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(10),
            event_capacity: 256,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    /// Defaults with the endpoint taken from `CODEPAD_ENDPOINT` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("CODEPAD_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn document_url(&self, doc_id: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), doc_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Events delivered to the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Incremental update from another participant.
    RemoteUpdate { peer_id: Uuid, update: Vec<u8> },
    /// Relay state vector; answer with `send_sync_step2`.
    SyncRequested(Vec<u8>),
    /// Relay's answer to our state vector.
    Synced(Vec<u8>),
    RemotePresence {
        peer_id: Uuid,
        clock: u64,
        state: Option<PresenceState>,
    },
    PeerJoined(Uuid),
    PeerLeft(Uuid),
}

impl SyncEvent {
    fn from_message(msg: SyncMessage) -> Option<Self> {
        let event = match msg.msg_type {
            MessageType::Delta => SyncEvent::RemoteUpdate {
                peer_id: msg.peer_id,
                update: msg.payload,
            },
            MessageType::SyncStep1 => SyncEvent::SyncRequested(msg.payload),
            MessageType::SyncStep2 => SyncEvent::Synced(msg.payload),
            MessageType::Awareness => match msg.presence_state() {
                Ok(state) => SyncEvent::RemotePresence {
                    peer_id: msg.peer_id,
                    clock: msg.clock,
                    state,
                },
                Err(e) => {
                    log::warn!("Invalid presence from {}: {e}", msg.peer_id);
                    return None;
                }
            },
            MessageType::PeerJoined => SyncEvent::PeerJoined(msg.peer_id),
            MessageType::PeerLeft => SyncEvent::PeerLeft(msg.peer_id),
            MessageType::Ping | MessageType::Pong => return None,
        };
        Some(event)
    }
}

/// Duplex channel between one replicated text and the relay.
pub struct TransportSession {
    peer_id: Uuid,
    doc_id: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    update_sub: Option<Subscription>,
    presence_clock: AtomicU64,
}

impl TransportSession {
    /// Start the connection driver and forward local updates of `handle`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        config: &SessionConfig,
        doc_id: &str,
        peer_id: Uuid,
        handle: &TextHandle,
    ) -> Result<Self, ProtocolError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let clock = AtomicU64::new(0);
        let update_tx = out_tx.clone();
        let update_doc = doc_id.to_string();
        let update_sub = handle
            .observe_updates(move |update, origin| {
                if origin_is(origin, REMOTE_ORIGIN) {
                    return;
                }
                let n = clock.fetch_add(1, Ordering::Relaxed) + 1;
                match SyncMessage::delta(peer_id, &update_doc, n, update.to_vec()).encode() {
                    Ok(bytes) => {
                        let _ = update_tx.send(bytes);
                    }
                    Err(e) => log::error!("Failed to encode local update: {e}"),
                }
            })
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;

        let driver = Driver {
            url: config.document_url(doc_id),
            peer_id,
            doc_id: doc_id.to_string(),
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max.max(config.reconnect_min),
            max_message_size: config.max_message_size,
            state: state.clone(),
            event_tx,
        };
        tokio::spawn(driver.run(out_rx));

        Ok(Self {
            peer_id,
            doc_id: doc_id.to_string(),
            state,
            outgoing_tx: Some(out_tx),
            event_rx: Some(event_rx),
            update_sub: Some(update_sub),
            presence_clock: AtomicU64::new(0),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::sync_step1(self.peer_id, &self.doc_id, state_vector))
    }

    pub fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::sync_step2(self.peer_id, &self.doc_id, diff))
    }

    /// Publish (or with `None`, withdraw) our presence. Dropped when offline.
    pub fn set_local_presence(&self, state: Option<&PresenceState>) -> Result<(), ProtocolError> {
        if self.connection_state() != ConnectionState::Connected {
            return Ok(());
        }
        let clock = self.presence_clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(&SyncMessage::awareness(self.peer_id, &self.doc_id, clock, state)?)
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?).map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.outgoing_tx.is_none()
    }

    /// Stop forwarding updates and close the connection. Idempotent.
    pub fn destroy(&mut self) {
        drop(self.update_sub.take());
        if self.outgoing_tx.take().is_some() {
            log::debug!("Transport for doc {} shutting down", self.doc_id);
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum Outcome {
    Lost,
    Shutdown,
}

struct Driver {
    url: String,
    peer_id: Uuid,
    doc_id: String,
    reconnect_min: Duration,
    reconnect_max: Duration,
    max_message_size: usize,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Driver {
    fn set_state(&self, next: ConnectionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    async fn run(self, mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut backoff = self.reconnect_min;
        loop {
            self.set_state(ConnectionState::Connecting);
            let ws_config = websocket_config(self.max_message_size);
            match tokio_tungstenite::connect_async_with_config(&self.url, Some(ws_config), false).await {
                Ok((ws_stream, _)) => {
                    backoff = self.reconnect_min;
                    match self.session(ws_stream, &mut out_rx).await {
                        Outcome::Shutdown => break,
                        Outcome::Lost => {
                            self.set_state(ConnectionState::Disconnected);
                            log::info!("Connection to {} lost", self.url);
                            if self.event_tx.send(SyncEvent::Disconnected).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    log::debug!("Connect to {} failed: {e}", self.url);
                }
            }

            // Wait out the backoff, discarding outbound traffic.
            let sleep = tokio::time::sleep(backoff);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    out = out_rx.recv() => {
                        if out.is_none() {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                    }
                }
            }
            backoff = (backoff * 2).min(self.reconnect_max);
        }
        self.set_state(ConnectionState::Closed);
    }

    async fn session<S>(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        out_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Outcome
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut writer, mut reader) = ws_stream.split();

        let join = match SyncMessage::peer_joined(self.peer_id, &self.doc_id).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode join: {e}");
                return Outcome::Lost;
            }
        };
        if writer.send(Message::Binary(join.into())).await.is_err() {
            return Outcome::Lost;
        }

        self.set_state(ConnectionState::Connected);
        log::info!("Connected to {}", self.url);
        if self.event_tx.send(SyncEvent::Connected).await.is_err() {
            return Outcome::Shutdown;
        }

        loop {
            tokio::select! {
                out = out_rx.recv() => match out {
                    Some(bytes) => {
                        if writer.send(Message::Binary(bytes.into())).await.is_err() {
                            return Outcome::Lost;
                        }
                    }
                    None => {
                        let _ = writer.send(Message::Close(None)).await;
                        return Outcome::Shutdown;
                    }
                },
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable message: {e}");
                                continue;
                            }
                        };
                        if sync_msg.peer_id == self.peer_id {
                            continue;
                        }
                        log::trace!("Received {:?} from {}", sync_msg.msg_type, sync_msg.peer_id);
                        if let Some(event) = SyncEvent::from_message(sync_msg) {
                            if self.event_tx.send(event).await.is_err() {
                                return Outcome::Shutdown;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if writer.send(Message::Pong(data)).await.is_err() {
                            return Outcome::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return Outcome::Lost,
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
