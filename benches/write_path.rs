//! Write path benchmarks.

use collector_io::memory::mapping::page_size;
use collector_io::memory::Arena;
use collector_io::prelude::*;
use collector_io::signal::SignalsBlocked;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

/// Bounds the files a long run leaves behind; later writes are refused.
const SIZE_LIMIT_MB: u64 = 1024;

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    EngineConfig::new(dir.path()).with_size_limit_mb(SIZE_LIMIT_MB)
}

fn bench_write_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_record");

    for payload in [16usize, 64, 256] {
        let dir = tempfile::tempdir().unwrap();
        let engine = CaptureEngine::new(config(&dir)).unwrap();
        let profile = engine.create_handle("profile").unwrap();
        let bytes = vec![0xA5u8; payload];

        group.throughput(Throughput::Bytes(payload as u64));
        group.bench_with_input(BenchmarkId::from_parameter(payload), &bytes, |b, bytes| {
            b.iter(|| {
                let _ = profile.write_record(RecordKind::Profile.as_u32(), bytes);
            });
        });
        engine.close().unwrap();
    }

    group.finish();
}

fn bench_write_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_string");

    for len in [32usize, 512] {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir).with_text_buffers(16 * page_size(), 8);
        let engine = CaptureEngine::new(config).unwrap();
        let log = engine.create_handle("log.xml").unwrap();
        let line = vec![b'x'; len];

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &line, |b, line| {
            b.iter(|| {
                let _ = log.write_string(line);
            });
        });
        engine.close().unwrap();
    }

    group.finish();
}

fn bench_concurrent_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_records");

    let dir = tempfile::tempdir().unwrap();
    let engine = CaptureEngine::new(config(&dir).with_lanes(4)).unwrap();
    let profile = engine.create_handle("profile").unwrap();

    group.throughput(Throughput::Elements(4 * 1000));
    group.bench_function("4_threads_1000_records_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let profile = Arc::clone(&profile);
                    std::thread::spawn(move || {
                        for _ in 0..1000 {
                            let _ = profile.write_record_on(t, RecordKind::Profile.as_u32(), &[0; 32]);
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
    engine.close().unwrap();
}

fn bench_arena_fixed(c: &mut Criterion) {
    let arena = Arena::new(64 * 1024);
    c.bench_function("arena_alloc_free_64", |b| {
        b.iter(|| {
            let sig = SignalsBlocked::enter();
            let ptr = arena.alloc_fixed(64, &sig).expect("arena mapping failed");
            unsafe { arena.free_fixed(ptr, 64, &sig) };
        });
    });
}

criterion_group!(
    benches,
    bench_write_record,
    bench_write_string,
    bench_concurrent_records,
    bench_arena_fixed
);
criterion_main!(benches);
