//! Insert routing throughput, warm cache vs. chunk creation

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hyperchunk_core::catalog::Catalog;
use hyperchunk_core::dimension::DimensionSpec;
use hyperchunk_core::hypertable::{EngineConfig, HypertableManager};
use hyperchunk_core::{Row, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const INTERVAL: i64 = 3_600_000_000;

fn setup() -> (HypertableManager, hyperchunk_core::HypertableId) {
    let catalog = Arc::new(Catalog::in_memory());
    let manager = HypertableManager::new(catalog, EngineConfig::default());
    let id = manager
        .create_hypertable(
            "metrics",
            vec![DimensionSpec::time("time", INTERVAL), DimensionSpec::space("device", 8)],
            0,
            None,
        )
        .unwrap();
    (manager, id)
}

fn rows(n: usize, span: i64) -> Vec<Row> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|_| {
            Row::new()
                .with("time", Value::Timestamp(rng.gen_range(0..span)))
                .with("device", format!("device-{}", rng.gen_range(0..64)))
        })
        .collect()
}

fn bench_routing(c: &mut Criterion) {
    let (manager, id) = setup();
    let warm = rows(10_000, 24 * INTERVAL);
    for row in &warm {
        manager.insert_row(id, row).unwrap();
    }

    c.bench_function("routing/warm_cache", |b| {
        b.iter(|| {
            for row in &warm {
                black_box(manager.insert_row(id, row).unwrap());
            }
        })
    });

    c.bench_function("routing/create_chunks", |b| {
        b.iter_batched(
            || (setup(), rows(1_000, 1_000 * INTERVAL)),
            |((manager, id), rows)| {
                for row in &rows {
                    black_box(manager.insert_row(id, row).unwrap());
                }
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_routing);
criterion_main!(benches);
