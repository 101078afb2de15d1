//! Benchmarks for the recording file access layer

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use tempfile::NamedTempFile;

use spectrec::storage::Recording;

fn bench_store_chunks(c: &mut Criterion) {
    let payload = vec![0x5Au8; 16 * 1024];

    c.bench_function("store_100_chunks", |b| {
        b.iter(|| {
            let rec = Recording::new(Cursor::new(Vec::new())).unwrap();

            for i in 1..=100 {
                rec.store_chunk(black_box(i), black_box(&payload[..])).unwrap();
            }
        });
    });
}

fn bench_retrieve_chunk(c: &mut Criterion) {
    let rec = Recording::new(Cursor::new(Vec::new())).unwrap();
    let payload = vec![0x5Au8; 16 * 1024];
    for i in 1..=100 {
        rec.store_chunk(i, &payload[..]).unwrap();
    }

    c.bench_function("retrieve_chunk", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(payload.len());
            rec.retrieve_chunk_to(black_box(50), &mut out).unwrap();
            black_box(out);
        });
    });
}

fn bench_open_recording(c: &mut Criterion) {
    let file = NamedTempFile::new().unwrap();
    let payload = vec![0x5Au8; 4 * 1024];

    {
        let rec = Recording::new(file.reopen().unwrap()).unwrap();
        for i in 1..=200 {
            rec.store_chunk(i, &payload[..]).unwrap();
        }
    }

    c.bench_function("open_recording_200_chunks", |b| {
        b.iter(|| {
            let rec = Recording::new(file.reopen().unwrap()).unwrap();
            black_box(rec.position());
        });
    });
}

criterion_group!(
    benches,
    bench_store_chunks,
    bench_retrieve_chunk,
    bench_open_recording
);
criterion_main!(benches);
