use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use plaza_core::{Collection, DocumentBridge, Entity, PeerEntry, SpaceDocument};
use std::hint::black_box;

fn bench_local_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document Writes");
    group.throughput(Throughput::Elements(1));

    group.bench_function("update_peer_position", |b| {
        let mut bridge = DocumentBridge::new();
        bridge.set_local_peer(Some("p1".into()));
        bridge.mark_synced();
        bridge.add_peer("p1", &PeerEntry::new("Alice", 0.0, 0.0)).unwrap();
        let mut x = 0.0;

        // Grows the document's history, same as a user dragging an avatar.
        b.iter(|| {
            x += 1.0;
            black_box(bridge.update_peer_position("p1", x, x).unwrap());
        })
    });

    group.bench_function("insert_note_text", |b| {
        let doc = SpaceDocument::new();
        let mut i = 0u32;
        b.iter(|| {
            black_box(doc.insert_text("n1", i, "a"));
            i += 1;
        })
    });

    group.finish();
}

fn bench_remote_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document Apply");
    group.throughput(Throughput::Elements(1));

    let source = SpaceDocument::new();
    let delta = source.set(
        Collection::Peers,
        "p2",
        &PeerEntry::new("Bob", 2000.0, 2000.0).to_fields(),
    );

    group.bench_function("apply_remote_delta", |b| {
        // Re-applying an integrated update is a no-op, so this measures decode
        // plus the idempotence check.
        let mut bridge = DocumentBridge::new();
        bridge.mark_synced();
        b.iter(|| {
            black_box(bridge.apply_remote(black_box(&delta)).unwrap());
        })
    });

    group.bench_function("late_join_full_state", |b| {
        let big = SpaceDocument::new();
        for i in 0..200 {
            let id = format!("p{i}");
            big.set(Collection::Peers, &id, &PeerEntry::new(id.clone(), i as f64, i as f64).to_fields());
        }
        let state = big.full_state();
        b.iter(|| {
            let fresh = SpaceDocument::new();
            fresh.apply_update(black_box(&state)).unwrap();
            black_box(fresh.len(Collection::Peers));
        })
    });

    group.finish();
}

criterion_group!(benches, bench_local_writes, bench_remote_apply);
criterion_main!(benches);
