use criterion::{criterion_group, criterion_main, Criterion};
use quill_sync::hub::HubFrame;
use quill_sync::{
    BroadcastGroup, ChangeEvent, ClientMessage, Outbound, RocksStore, ServerMessage, StoreConfig,
    TextChange,
};
use std::hint::black_box;
use uuid::Uuid;

/// A few KB of prose, the size of a typical shared note.
fn sample_text() -> String {
    "Lorem ipsum dolor sit amet, consectetur adipiscing elit.\n".repeat(64)
}

fn bench_text_change_decode(c: &mut Criterion) {
    let frame = ClientMessage::TextChange(TextChange::with_cursor(sample_text(), 42))
        .encode()
        .unwrap();

    c.bench_function("text_change_decode_3KB", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_text_change_decode_raw(c: &mut Criterion) {
    let frame = format!(
        r#"{{"event":"text-change","data":{}}}"#,
        serde_json::to_string(&sample_text()).unwrap()
    );

    c.bench_function("text_change_decode_raw_string_3KB", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_receive_text_encode(c: &mut Criterion) {
    let msg = ServerMessage::receive_text(sample_text());

    c.bench_function("receive_text_encode_3KB", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_change_event_codec(c: &mut Criterion) {
    let event = ChangeEvent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        TextChange::with_cursor(sample_text(), 7),
    );
    let encoded = event.encode().unwrap();

    c.bench_function("change_event_encode_3KB", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });

    c.bench_function("change_event_decode_3KB", |b| {
        b.iter(|| {
            black_box(ChangeEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_hub_publish_frame(c: &mut Criterion) {
    let event = ChangeEvent::new(Uuid::new_v4(), Uuid::new_v4(), TextChange::new(sample_text()));

    c.bench_function("hub_publish_frame_encode", |b| {
        b.iter(|| {
            let frame = HubFrame::Publish {
                id: black_box(1),
                event: event.clone(),
            };
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_fanout_100_connections(c: &mut Criterion) {
    c.bench_function("fanout_1000_snapshots_x_100_connections", |b| {
        b.iter_custom(|iters| {
            let group: BroadcastGroup<Outbound> = BroadcastGroup::new(1024);
            let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
            let me = Uuid::new_v4();

            let start = std::time::Instant::now();
            for _ in 0..iters {
                for i in 0..1000 {
                    let msg = ServerMessage::receive_text(format!("v{i}"));
                    group.send(Outbound::to_all(msg));
                }
                for rx in receivers.iter_mut() {
                    while let Ok(out) = rx.try_recv() {
                        black_box(out.is_for(me));
                    }
                }
            }
            start.elapsed()
        })
    });
}

fn bench_rocks_store_document(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::for_testing(dir.path());
    config.sync_writes = false;
    let store = RocksStore::open(config).unwrap();
    let text = sample_text();

    c.bench_function("rocks_store_document_3KB", |b| {
        b.iter(|| {
            store.store_document(black_box(&text)).unwrap();
        })
    });

    c.bench_function("rocks_load_document_3KB", |b| {
        b.iter(|| {
            black_box(store.load_document().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_text_change_decode,
    bench_text_change_decode_raw,
    bench_receive_text_encode,
    bench_change_event_codec,
    bench_hub_publish_frame,
    bench_fanout_100_connections,
    bench_rocks_store_document,
);
criterion_main!(benches);
