use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pog::{
    attest::{prover::multiply, SeedPair},
    matrix::{product_cell, SeededMatrix, Strategy},
};
use pprof::criterion::{Output, PProfProfiler};

fn bench_materialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("materialize");
    for n in [256, 1024] {
        let matrix = SeededMatrix::new(42, n);
        group.throughput(Throughput::Elements((n * n) as u64));
        for strategy in [Strategy::Scalar, Strategy::detect()] {
            group.bench_with_input(BenchmarkId::new(format!("{strategy:?}"), n), &n, |b, _| {
                b.iter(|| matrix.materialize(black_box(strategy)))
            });
        }
    }
}

fn bench_product_cell(c: &mut Criterion) {
    let (a, b) = SeedPair { a: 42, b: 7 }.matrices(4096);
    c.bench_function("product_cell_4096", |bench| {
        bench.iter(|| product_cell(&a, &b, black_box(17), black_box(4000)))
    });
}

fn bench_multiply(c: &mut Criterion) {
    let (a, b) = SeedPair { a: 42, b: 7 }.matrices(256);
    c.bench_function("multiply_256", |bench| {
        bench.iter(|| multiply(&a, &b, black_box(Strategy::detect())))
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().with_profiler(PProfProfiler::new(1000, Output::Flamegraph(None)));
    targets=bench_materialize,bench_product_cell,bench_multiply
);

criterion_main!(benches);
