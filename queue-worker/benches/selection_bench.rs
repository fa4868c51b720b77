//! Benchmarks for weighted executor selection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use queue_worker::executor::{select_weighted, ExecutorDescriptor};

fn descriptors(count: u32) -> Vec<ExecutorDescriptor> {
    (0..count)
        .map(|i| ExecutorDescriptor::new(format!("executor-{i}"), i % 5))
        .collect()
}

fn selection_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_weighted");
    for count in [2, 8, 64] {
        let set = descriptors(count);
        let mut rng = StdRng::seed_from_u64(7);
        group.bench_with_input(BenchmarkId::from_parameter(count), &set, |b, set| {
            b.iter(|| black_box(select_weighted(black_box(set), &mut rng)));
        });
    }
    group.finish();
}

criterion_group!(benches, selection_benchmark);
criterion_main!(benches);
