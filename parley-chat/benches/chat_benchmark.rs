use criterion::{criterion_group, criterion_main, Criterion};
use parley_chat::fanout::FanoutBridge;
use parley_chat::history::HistoryLog;
use parley_chat::protocol::{BridgeFrame, ChatMessage, ClientEvent, RoomEvent, ServerEvent};
use parley_chat::rooms::LocalRooms;
use parley_chat::store::MemoryStore;
use std::hint::black_box;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

fn bench_frame_encode(c: &mut Criterion) {
    let msg = ChatMessage::new("general", "bob", "x".repeat(64));
    let frame = BridgeFrame::new(Uuid::new_v4(), "general", RoomEvent::Message(msg));

    c.bench_function("bridge_frame_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let msg = ChatMessage::new("general", "bob", "x".repeat(64));
    let encoded = BridgeFrame::new(Uuid::new_v4(), "general", RoomEvent::Message(msg))
        .encode()
        .unwrap();

    c.bench_function("bridge_frame_decode_64B", |b| {
        b.iter(|| black_box(BridgeFrame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_client_event_decode(c: &mut Criterion) {
    let raw = r#"{"event":"message","data":{"room":"general","username":"bob","text":"hello there"}}"#;

    c.bench_function("client_event_decode", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(raw)).unwrap()))
    });
}

fn bench_server_event_encode(c: &mut Criterion) {
    let event = ServerEvent::Message(ChatMessage::new("general", "bob", "hello there"));

    c.bench_function("server_event_encode", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_local_deliver_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("local_deliver_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let local = LocalRooms::new();
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = mpsc::channel(16);
                    local.add_member("general", Uuid::new_v4(), tx).await;
                    receivers.push(rx);
                }

                let event = ServerEvent::Message(ChatMessage::new("general", "bob", "hi"));
                black_box(local.deliver("general", black_box(&event), None).await);
            });
        })
    });
}

fn bench_history_append_1000(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("history_append_1000_over_capacity", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = HistoryLog::with_capacity(Arc::new(MemoryStore::new()), 100);
                for i in 0..1000 {
                    let msg = ChatMessage::new("r", "bob", format!("{i}"));
                    log.append("r", &msg).await.unwrap();
                }
                black_box(log.recent("r", 50).await.unwrap());
            });
        })
    });
}

fn bench_fanout_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(LocalRooms::new());
    let bridge = FanoutBridge::new(Arc::new(MemoryStore::new()), "bench", local.clone());
    let (tx, mut rx) = mpsc::channel(1024);
    rt.block_on(local.add_member("general", Uuid::new_v4(), tx));

    let payload = BridgeFrame::new(
        Uuid::new_v4(),
        "general",
        RoomEvent::Message(ChatMessage::new("general", "bob", "hi")),
    )
    .encode()
    .unwrap();

    c.bench_function("fanout_dispatch_one_member", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(bridge.dispatch(black_box(&payload)).await);
                let _ = rx.try_recv();
            });
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_client_event_decode,
    bench_server_event_encode,
    bench_local_deliver_100_members,
    bench_history_append_1000,
    bench_fanout_dispatch,
);
criterion_main!(benches);
