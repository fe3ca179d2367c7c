//! Benchmark for storage system selection
//!
//! Clean selections take the read path only; the commit path is exercised by
//! a group whose active set has to be topped up on every call.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ring_archiver::{
    ArchiverMetrics, BackendRegistry, GroupConfig, GroupRegistry, MemoryBackend,
    StorageSystemSelector,
};
use std::sync::Arc;

const GROUP: &str = r#"
id: bench
parallelism: 4
systems:
  - { id: fs1, uri: "mem://fs1" }
  - { id: fs2, uri: "mem://fs2" }
  - { id: fs3, uri: "mem://fs3" }
  - { id: fs4, uri: "mem://fs4" }
  - { id: fs5, uri: "mem://fs5" }
  - { id: fs6, uri: "mem://fs6" }
"#;

fn registry() -> (GroupRegistry, Vec<MemoryBackend>) {
    let backends = Arc::new(BackendRegistry::new());
    let mut media = Vec::new();
    for i in 1..=6 {
        let backend = MemoryBackend::new(format!("fs{}", i), 1 << 30);
        backends.insert(Arc::new(backend.clone()));
        media.push(backend);
    }
    let metrics = ArchiverMetrics::new().unwrap();
    let selector = StorageSystemSelector::new(backends, metrics);
    let registry = GroupRegistry::new(selector, 8);

    let config: GroupConfig = serde_yaml::from_str(GROUP).unwrap();
    registry.insert(config.to_group().unwrap()).unwrap();
    (registry, media)
}

fn bench_round_robin(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    group.throughput(Throughput::Elements(1));

    let (registry, _media) = registry();
    // Fill the active set once
    registry.select("bench", 1).unwrap();

    group.bench_function("select_clean", |b| {
        b.iter(|| registry.select(black_box("bench"), black_box(1024)).unwrap());
    });

    group.finish();
}

fn bench_failover(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    group.throughput(Throughput::Elements(1));

    let (registry, media) = registry();
    registry.select("bench", 1).unwrap();

    group.bench_function("select_with_failover", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let offline = &media[counter % media.len()];
            offline.set_writable(false);
            let selected = registry.select(black_box("bench"), 1024).unwrap();
            offline.set_writable(true);
            selected
        });
    });

    group.finish();
}

fn bench_concurrent_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    group.throughput(Throughput::Elements(400));

    let (registry, _media) = registry();
    let registry = Arc::new(registry);
    registry.select("bench", 1).unwrap();

    group.bench_function("concurrent_select_4x100", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let registry = registry.clone();
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            let _ = registry.select("bench", 1024);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_round_robin,
    bench_failover,
    bench_concurrent_select
);
criterion_main!(benches);
