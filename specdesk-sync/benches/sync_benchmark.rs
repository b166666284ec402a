use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use specdesk_sync::broadcast::BroadcastGroup;
use specdesk_sync::cache::ClientCache;
use specdesk_sync::etag::ETag;
use specdesk_sync::files::FilePayload;
use specdesk_sync::patch::{apply_patch, unified_diff};
use specdesk_sync::protocol::{encode, ChangeEvent, ChangeKind, ServerMessage};

fn document(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("- requirement {i}: the system shall do thing {i}\n"))
        .collect()
}

fn edited(doc: &str) -> String {
    doc.replace("requirement 500:", "requirement 500 (revised):") + "- appended requirement\n"
}

fn bench_etag_compute(c: &mut Criterion) {
    let doc = document(1000);
    c.bench_function("etag_compute_1000_lines", |b| {
        b.iter(|| black_box(ETag::compute(black_box(&doc))))
    });
}

fn bench_unified_diff(c: &mut Criterion) {
    let old = document(1000);
    let new = edited(&old);
    c.bench_function("unified_diff_1000_lines", |b| {
        b.iter(|| black_box(unified_diff("spec.md", black_box(&old), black_box(&new))))
    });
}

fn bench_apply_patch(c: &mut Criterion) {
    let old = document(1000);
    let new = edited(&old);
    let diff = unified_diff("spec.md", &old, &new);
    c.bench_function("apply_patch_1000_lines", |b| {
        b.iter(|| black_box(apply_patch(black_box(&old), black_box(&diff)).unwrap()))
    });
}

fn bench_cache_apply_change(c: &mut Criterion) {
    let old = document(1000);
    let new = edited(&old);
    let payload = FilePayload::new(new.clone(), 0);
    let event = ChangeEvent::updated(
        "/project",
        "spec.md",
        ChangeKind::Modified,
        unified_diff("spec.md", &old, &new),
        payload,
    );

    c.bench_function("cache_apply_diff_1000_lines", |b| {
        b.iter(|| {
            let mut cache = ClientCache::new(8);
            cache.insert("spec.md", FilePayload::new(old.clone(), 0));
            black_box(cache.apply_change(black_box(&event)));
        })
    });
}

fn bench_encode_change(c: &mut Criterion) {
    let old = document(100);
    let new = edited(&old);
    let msg = ServerMessage::Change(ChangeEvent::updated(
        "/project",
        "spec.md",
        ChangeKind::Modified,
        unified_diff("spec.md", &old, &new),
        FilePayload::new(new, usize::MAX),
    ));
    c.bench_function("encode_change_100_lines", |b| {
        b.iter(|| black_box(encode(black_box(&msg)).unwrap()))
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    let event = ChangeEvent::removed("/project", "spec.md");
    c.bench_function("broadcast_1000_events_100_subscribers", |b| {
        b.iter(|| {
            let group = BroadcastGroup::new(2048);
            let subscribers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
            for _ in 0..1000 {
                black_box(group.broadcast(event.clone()));
            }
            black_box(subscribers.len());
        })
    });
}

criterion_group!(
    benches,
    bench_etag_compute,
    bench_unified_diff,
    bench_apply_patch,
    bench_cache_apply_change,
    bench_encode_change,
    bench_broadcast_100_subscribers,
);
criterion_main!(benches);
