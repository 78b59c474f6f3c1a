//! Benchmarks for the vela-incremental runtime.
//!
//! Target: single-row incremental maintenance well under 100μs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vela_core::{Key, Record, SortSpec, Value};
use vela_incremental::{
    consolidate, Delta, DistinctOp, Operator, TopKConfig, TopKOp, Tuple,
};

fn emp(id: i64, salary: i64) -> Tuple {
    let mut r = Record::new();
    r.set("id", Value::Int(id));
    r.set("salary", Value::Int(salary));
    Tuple::new(Key::Int(id), Value::Record(r))
}

fn bench_consolidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("consolidate");

    for size in [10, 100, 1000] {
        let batch: Vec<Delta<Tuple>> = (0..size)
            .map(|i| Delta::insert(emp(i % (size / 2 + 1), i)))
            .collect();
        group.bench_with_input(BenchmarkId::new("mixed", size), &batch, |b, batch| {
            b.iter(|| consolidate(black_box(batch.clone())))
        });
    }

    group.finish();
}

fn bench_distinct(c: &mut Criterion) {
    let mut group = c.benchmark_group("distinct");

    for size in [10, 100, 1000] {
        let batch: Vec<Delta<Tuple>> = (0..size).map(|i| Delta::insert(emp(i, i))).collect();
        group.bench_with_input(BenchmarkId::new("inserts", size), &batch, |b, batch| {
            b.iter(|| {
                let mut op = DistinctOp::new();
                let mut out = Vec::new();
                op.on_batch(0, black_box(batch.clone()), &mut out).unwrap();
                out
            })
        });
    }

    group.finish();
}

fn bench_topk_single_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("topk");

    for size in [100, 1000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("insert_into_full_window", size),
            &size,
            |b, &size| {
                let mut op = TopKOp::new(TopKConfig {
                    specs: vec![SortSpec::desc()],
                    sort_key: Box::new(|t: &Tuple| {
                        vec![t
                            .payload
                            .as_record()
                            .and_then(|r| r.get("salary"))
                            .cloned()
                            .unwrap_or(Value::Null)]
                    }),
                    offset: 0,
                    limit: Some(10),
                });
                let seed: Vec<Delta<Tuple>> =
                    (0..size).map(|i| Delta::insert(emp(i, i * 7 % 100_000))).collect();
                let mut out = Vec::new();
                op.on_batch(0, seed, &mut out).unwrap();

                let mut next_id = size;
                b.iter(|| {
                    let mut out = Vec::new();
                    op.on_batch(
                        0,
                        vec![Delta::insert(emp(next_id, 99_999))],
                        &mut out,
                    )
                    .unwrap();
                    next_id += 1;
                    black_box(out)
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_consolidate,
    bench_distinct,
    bench_topk_single_update
);
criterion_main!(benches);
