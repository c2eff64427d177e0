//! Integration tests for the transport against a real relay.
//!
//! These tests start a server on a free port and connect real
//! transports, exercising the handshake, fan-out and reconnects.

use codepad_collab::client::{ConnectionState, SessionConfig, SyncEvent, TransportSession};
use codepad_collab::protocol::{MessageType, SyncMessage};
use codepad_collab::server::{ServerConfig, SyncServer};
use codepad_core::TextHandle;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port; returns it with the client endpoint.
async fn start_test_server(max_peers_per_room: usize) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    }));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}/ws/document"))
}

fn config(endpoint: &str) -> SessionConfig {
    SessionConfig {
        endpoint: endpoint.to_string(),
        reconnect_min: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        event_capacity: 64,
        ..SessionConfig::default()
    }
}

fn connect(endpoint: &str, doc_id: &str, handle: &TextHandle) -> (TransportSession, Receiver<SyncEvent>) {
    let mut transport = TransportSession::connect(&config(endpoint), doc_id, Uuid::new_v4(), handle).unwrap();
    let events = transport.take_event_rx().unwrap();
    (transport, events)
}

/// Wait until the relay has created the room for `doc_id`.
async fn wait_for_room(server: &SyncServer, doc_id: &str) {
    timeout(Duration::from_secs(3), async {
        while server.room_text(doc_id).await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room was never created");
}

/// Wait for the first event matching `pred`, skipping others.
async fn expect_event<F>(events: &mut Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    let deadline = Duration::from_secs(3);
    timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(e) if pred(&e) => return e,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_transport_connects() {
    let (_server, endpoint) = start_test_server(10).await;
    let handle = TextHandle::new();
    let (transport, mut events) = connect(&endpoint, "doc-connect", &handle);

    expect_event(&mut events, |e| *e == SyncEvent::Connected).await;
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_handshake_brings_late_joiner_up_to_date() {
    let (server, endpoint) = start_test_server(10).await;
    let doc = "doc-handshake";

    // Alice has content before the relay knows anything.
    let alice = TextHandle::new();
    alice.insert(0, "written offline\n");
    let (a, mut a_events) = connect(&endpoint, doc, &alice);
    expect_event(&mut a_events, |e| *e == SyncEvent::Connected).await;
    a.send_sync_step1(alice.state_vector()).unwrap();

    expect_event(&mut a_events, |e| matches!(e, SyncEvent::Synced(_))).await;
    let SyncEvent::SyncRequested(relay_sv) =
        expect_event(&mut a_events, |e| matches!(e, SyncEvent::SyncRequested(_))).await
    else {
        unreachable!()
    };
    a.send_sync_step2(alice.diff_since(&relay_sv).unwrap()).unwrap();

    timeout(Duration::from_secs(3), async {
        while server.room_text(doc).await.as_deref() != Some("written offline\n") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never received offline edits");

    // Bob joins afterwards and catches up from the relay alone.
    let bob = TextHandle::new();
    let (b, mut b_events) = connect(&endpoint, doc, &bob);
    expect_event(&mut b_events, |e| *e == SyncEvent::Connected).await;
    b.send_sync_step1(bob.state_vector()).unwrap();
    let SyncEvent::Synced(diff) = expect_event(&mut b_events, |e| matches!(e, SyncEvent::Synced(_))).await else {
        unreachable!()
    };
    bob.apply_update(&diff).unwrap();
    assert_eq!(bob.to_string(), "written offline\n");
}

#[tokio::test]
async fn test_local_updates_fan_out() {
    let (server, endpoint) = start_test_server(10).await;
    let doc = "doc-fanout";

    let alice = TextHandle::new();
    let bob = TextHandle::new();
    let (_a, mut a_events) = connect(&endpoint, doc, &alice);
    wait_for_room(&server, doc).await;
    let (_b, mut b_events) = connect(&endpoint, doc, &bob);
    expect_event(&mut b_events, |e| *e == SyncEvent::Connected).await;
    expect_event(&mut a_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;

    alice.insert(0, "hello from alice");
    let SyncEvent::RemoteUpdate { update, .. } =
        expect_event(&mut b_events, |e| matches!(e, SyncEvent::RemoteUpdate { .. })).await
    else {
        unreachable!()
    };
    bob.apply_update(&update).unwrap();
    assert_eq!(bob.to_string(), "hello from alice");

    // Applying a remote update does not bounce it back.
    let echoed = timeout(Duration::from_millis(200), async {
        loop {
            if let Some(SyncEvent::RemoteUpdate { .. }) = a_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(echoed.is_err(), "remote update was re-broadcast");
}

#[tokio::test]
async fn test_peer_joined_and_left() {
    let (server, endpoint) = start_test_server(10).await;
    let doc = "doc-peers";

    let alice = TextHandle::new();
    let (_a, mut a_events) = connect(&endpoint, doc, &alice);
    wait_for_room(&server, doc).await;

    let bob = TextHandle::new();
    let mut b = TransportSession::connect(&config(&endpoint), doc, Uuid::new_v4(), &bob).unwrap();
    let bob_id = b.peer_id();
    let mut b_events = b.take_event_rx().unwrap();
    expect_event(&mut b_events, |e| *e == SyncEvent::Connected).await;

    expect_event(&mut a_events, |e| *e == SyncEvent::PeerJoined(bob_id)).await;
    b.destroy();
    expect_event(&mut a_events, |e| *e == SyncEvent::PeerLeft(bob_id)).await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, endpoint) = start_test_server(10).await;

    let one = TextHandle::new();
    let two = TextHandle::new();
    let (_a, mut a_events) = connect(&endpoint, "room-one", &one);
    let (_b, mut b_events) = connect(&endpoint, "room-two", &two);
    expect_event(&mut a_events, |e| *e == SyncEvent::Connected).await;
    expect_event(&mut b_events, |e| *e == SyncEvent::Connected).await;

    one.insert(0, "only in room one");
    let leaked = timeout(Duration::from_millis(200), async {
        loop {
            if let Some(SyncEvent::RemoteUpdate { .. }) = b_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(leaked.is_err());
}

#[tokio::test]
async fn test_full_room_rejects_peer() {
    let (server, endpoint) = start_test_server(1).await;
    let doc = "doc-full";

    let first = TextHandle::new();
    let (_a, _a_events) = connect(&endpoint, doc, &first);
    wait_for_room(&server, doc).await;

    let second = TextHandle::new();
    let (_b, mut b_events) = connect(&endpoint, doc, &second);
    expect_event(&mut b_events, |e| *e == SyncEvent::Disconnected).await;
    assert!(server.stats().await.rejected_connections >= 1);
}

#[tokio::test]
async fn test_reconnects_after_connection_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // A relay that reads the join of each connection and hangs up on the first.
    tokio::spawn(async move {
        let mut accepted = 0;
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            accepted += 1;
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Binary(data))) = ws.next().await {
                let msg = SyncMessage::decode(&data).unwrap();
                assert_eq!(msg.msg_type, MessageType::PeerJoined);
                assert_eq!(msg.doc_id, "doc-reconnect");
            }
            if accepted == 1 {
                let _ = ws.close(None).await;
            } else {
                tokio::spawn(async move { while ws.next().await.is_some() {} });
            }
        }
    });

    let handle = TextHandle::new();
    let (transport, mut events) = connect(&format!("ws://127.0.0.1:{port}/ws/document"), "doc-reconnect", &handle);
    expect_event(&mut events, |e| *e == SyncEvent::Connected).await;
    expect_event(&mut events, |e| *e == SyncEvent::Disconnected).await;
    expect_event(&mut events, |e| *e == SyncEvent::Connected).await;
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, endpoint) = start_test_server(10).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{endpoint}/doc-ping"))
        .await
        .unwrap();

    let peer = Uuid::new_v4();
    let join = SyncMessage::peer_joined(peer, "doc-ping").encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();
    ws.send(Message::Binary(SyncMessage::ping(peer).encode().unwrap().into()))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected binary reply, got {reply:?}");
    };
    assert_eq!(SyncMessage::decode(&data).unwrap().msg_type, MessageType::Pong);
}
