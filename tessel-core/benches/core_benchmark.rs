use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use tessel_core::engine::ops::{Shadow, Staging};
use tessel_core::engine::Engine;
use tessel_core::persist::{CommitRecord, LoadedLog};
use tessel_core::{CollectionKind, Document, DocumentConfig, Error, Schema};

fn volatile_doc() -> Document {
    Document::open("bench", Arc::new(Schema::permissive()), DocumentConfig::volatile())
}

fn bench_single_commit(c: &mut Criterion) {
    let doc = volatile_doc();
    let notes = doc.sequence("notes").unwrap();

    c.bench_function("commit_push_one", |b| {
        b.iter(|| notes.push(black_box(json!({"id": "m1", "data": "hello"}))).unwrap())
    });
}

fn bench_batched_commit(c: &mut Criterion) {
    let doc = volatile_doc();
    let notes = doc.sequence("notes").unwrap();
    let meta = doc.map("meta").unwrap();

    c.bench_function("commit_batch_32_ops", |b| {
        b.iter(|| {
            doc.transact(|tx| {
                let mut seq = tx.sequence(&notes)?;
                for i in 0..16 {
                    seq.push(json!(i));
                }
                let mut map = tx.map(&meta)?;
                for i in 0..16 {
                    map.set(&format!("k{i}"), json!(i))?;
                }
                Ok::<_, Error>(())
            })
            .unwrap()
        })
    });
}

fn bench_observed_commit(c: &mut Criterion) {
    let doc = volatile_doc();
    let notes = doc.sequence("notes").unwrap();
    for i in 0..100 {
        notes.push(json!(i)).unwrap();
    }
    let _obs: Vec<_> = (0..8)
        .map(|_| doc.observe("notes", CollectionKind::Sequence).unwrap())
        .collect();

    c.bench_function("commit_with_8_observers_100_items", |b| {
        b.iter(|| {
            notes.push(json!("x")).unwrap();
            notes.delete_range(100, 1).unwrap();
        })
    });
}

fn bench_replay(c: &mut Criterion) {
    let mut engine = Engine::new(usize::MAX);
    let mut commits = Vec::new();
    for i in 0..500u64 {
        let mut staging = Staging::new(i);
        let value = engine.snapshot("notes", CollectionKind::Sequence).unwrap();
        staging.install("notes", Shadow::from_value(CollectionKind::Sequence, value));
        staging.insert("notes", usize::MAX, vec![json!({"id": i, "title": "note"})]);
        let commit = engine.apply(staging.ops()).unwrap().unwrap();
        commits.push(CommitRecord {
            version: commit.version,
            tx: commit.tx,
            update: commit.update,
            state_vector: commit.state_vector,
        });
    }
    let log = LoadedLog {
        snapshot: None,
        commits,
    };

    c.bench_function("replay_500_commits", |b| {
        b.iter(|| black_box(Engine::restore(usize::MAX, black_box(&log)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_single_commit,
    bench_batched_commit,
    bench_observed_commit,
    bench_replay,
);
criterion_main!(benches);
