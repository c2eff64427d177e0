use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use codepad_collab::broadcast::BroadcastGroup;
use codepad_collab::presence::PresenceManager;
use codepad_collab::protocol::{CursorRange, PresenceState, SyncMessage, UserIdentity};
use codepad_collab::SyncBridge;
use codepad_core::{EditorModel, Position, TextEdit, TextHandle, TextModel};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const DOC: &str = "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b";

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let delta = vec![0u8; 64];

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), black_box(DOC), black_box(1), black_box(delta.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let encoded = SyncMessage::delta(Uuid::new_v4(), DOC, 1, vec![0u8; 64]).encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let state = PresenceState {
        user: Some(UserIdentity {
            name: "User_k3j9x".into(),
            color: "#45B7D1".into(),
        }),
        cursor: Some(CursorRange::caret(Position::new(12, 4))),
    };

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(black_box(peer), DOC, black_box(1), Some(&state)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let mut receivers = Vec::new();
    for _ in 0..100 {
        receivers.push(rt.block_on(group.add_peer(Uuid::new_v4())));
    }
    let writer = Uuid::new_v4();
    let encoded = Arc::new(SyncMessage::delta(writer, DOC, 1, vec![0u8; 64]).encode().unwrap());

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(writer, encoded.clone()));
            for rx in receivers.iter_mut() {
                let _ = rx.try_recv();
            }
        })
    });
}

fn bench_bridge_local_keystroke(c: &mut Criterion) {
    let handle = TextHandle::new();
    handle.insert(0, &"let value = compute();\n".repeat(200));
    let surface = Arc::new(Mutex::new(TextModel::new()));
    let _bridge = SyncBridge::new(&handle, surface.clone());

    c.bench_function("bridge_local_keystroke", |b| {
        b.iter(|| {
            surface
                .lock()
                .unwrap()
                .apply_edits(&[TextEdit::insert(black_box(Position::new(100, 5)), "x")]);
        })
    });
}

fn bench_bridge_remote_update(c: &mut Criterion) {
    let source = TextHandle::new();
    source.insert(0, &"line\n".repeat(100));
    let base = source.encode_state();
    let sv = source.state_vector();
    source.insert(250, "typed");
    let update = source.diff_since(&sv).unwrap();

    c.bench_function("bridge_remote_update", |b| {
        b.iter_batched(
            || {
                let handle = TextHandle::from_update(&base).unwrap();
                let surface = Arc::new(Mutex::new(TextModel::new()));
                let bridge = SyncBridge::new(&handle, surface.clone());
                (handle, surface, bridge)
            },
            |(handle, surface, _bridge)| {
                handle.apply_update(black_box(&update)).unwrap();
                black_box(surface.lock().unwrap().len());
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_presence_apply(c: &mut Criterion) {
    let mut presence = PresenceManager::new();
    let peers: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();
    let state = PresenceState {
        user: Some(UserIdentity {
            name: "peer".into(),
            color: "#FF6B6B".into(),
        }),
        cursor: None,
    };
    let mut clock = 0u64;

    c.bench_function("presence_apply_50_peers", |b| {
        b.iter(|| {
            clock += 1;
            for peer in &peers {
                presence.apply_remote(*peer, clock, Some(state.clone()));
            }
            black_box(presence.roster().len());
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_awareness_encode,
    bench_broadcast_fan_out,
    bench_bridge_local_keystroke,
    bench_bridge_remote_update,
    bench_presence_apply,
);
criterion_main!(benches);
