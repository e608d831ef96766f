//! Streaming throughput benchmarks.
//!
//! Measures sequential reads of stored and compressed entries through the
//! ring, with and without the background producer, and random-order opens
//! that force repositioning.
//!
//! Run with:
//! ```bash
//! cargo bench --bench streaming
//! ```

#![allow(clippy::expect_used)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use spindle_storage::{ArchiveRegistry, MemoryDevice, MountOptions, NoopNotifier, RegistryConfig};
use spindle_test_utils::{ArchiveBuilder, patterned_bytes};
use std::hint::black_box;
use std::sync::Arc;

const ENTRY_COUNT: usize = 32;
const ENTRY_SIZE: usize = 64 * 1024;

fn names() -> Vec<String> {
    (0..ENTRY_COUNT).map(|i| format!("bench/{i:03}.bin")).collect()
}

fn mounted(compressed: bool, background: bool) -> ArchiveRegistry {
    let mut builder = ArchiveBuilder::new();
    for (i, name) in names().iter().enumerate() {
        let data = patterned_bytes(ENTRY_SIZE, i as u8);
        builder = if compressed {
            builder.compressed(name, data)
        } else {
            builder.stored(name, data)
        };
    }
    let device = MemoryDevice::new(2048);
    device.insert("bench.spk", builder.build());
    let registry = ArchiveRegistry::new(
        RegistryConfig::default(),
        Arc::new(device),
        Arc::new(NoopNotifier),
    )
    .expect("Failed to create registry");
    registry
        .mount(
            "bench.spk",
            MountOptions::default().with_background_thread(background),
        )
        .expect("Failed to mount benchmark archive");
    registry
}

fn read_entries(registry: &ArchiveRegistry, names: &[String], buf: &mut [u8]) -> usize {
    let mut total = 0;
    for name in names {
        let mut cursor = registry.open(name).expect("Failed to open entry");
        loop {
            let n = cursor.read(buf).expect("Failed to read entry");
            if n == 0 {
                break;
            }
            total += n;
        }
    }
    total
}

/// Benchmark sequential reads of every entry in directory order.
fn bench_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential");
    group.throughput(Throughput::Bytes((ENTRY_COUNT * ENTRY_SIZE) as u64));
    let names = names();

    for compressed in [false, true] {
        for background in [false, true] {
            let registry = mounted(compressed, background);
            let label = format!(
                "{}/{}",
                if compressed { "zlib" } else { "stored" },
                if background { "background" } else { "sync" }
            );
            group.bench_function(BenchmarkId::from_parameter(label), |b| {
                let mut buf = vec![0u8; 16 * 1024];
                b.iter(|| black_box(read_entries(&registry, &names, &mut buf)));
            });
        }
    }
    group.finish();
}

/// Benchmark opening entries out of order, which repositions the ring.
fn bench_scattered(c: &mut Criterion) {
    let registry = mounted(false, true);
    let mut names = names();
    // Deterministic shuffle: stride through the table.
    names = (0..ENTRY_COUNT)
        .map(|i| names[(i * 13) % ENTRY_COUNT].clone())
        .collect();

    c.bench_function("scattered_opens", |b| {
        let mut buf = vec![0u8; 4096];
        b.iter(|| black_box(read_entries(&registry, &names, &mut buf)));
    });
}

/// Benchmark name lookups without reading.
fn bench_stat(c: &mut Criterion) {
    let registry = mounted(false, false);
    let names = names();
    c.bench_function("stat_all", |b| {
        b.iter(|| {
            for name in &names {
                black_box(registry.stat(name).expect("Failed to stat entry"));
            }
        });
    });
}

criterion_group!(benches, bench_sequential, bench_scattered, bench_stat);
criterion_main!(benches);
