use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use monitor::{Monitor, Status};
use std::hint::black_box;

fn register_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_status");

    group.bench_function("in_order", |b| {
        let mut monitor = Monitor::new(5, 2).unwrap();
        let mut sequence = 0u64;
        b.iter(|| {
            sequence += 1;
            monitor.register_status(black_box(sequence), Status::Up);
        });
    });

    group.bench_function("large_jump", |b| {
        let mut monitor = Monitor::new(5, 2).unwrap();
        let mut sequence = 0u64;
        b.iter(|| {
            sequence += 100;
            monitor.register_status(black_box(sequence), Status::Down);
        });
    });

    group.finish();
}

fn status_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("status");

    for threshold in [2usize, 5, 10] {
        let mut monitor = Monitor::new(threshold, threshold).unwrap();
        for sequence in 1..=threshold as u64 {
            monitor.register_status(sequence, Status::Pending);
        }

        group.bench_with_input(
            BenchmarkId::new("all_pending", threshold),
            &monitor,
            |b, monitor| b.iter(|| black_box(monitor.status())),
        );
    }

    group.finish();
}

criterion_group!(benches, register_benchmark, status_benchmark);
criterion_main!(benches);
