//! Task-throughput benchmark using criterion.
//!
//! Measures how fast the scheduler can push a burst of trivial tasks
//! through the worker pool, including the wait-group synchronization that
//! real callers use to observe completion.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft::{schedule, Scheduler, WaitGroup};

const TASKS_PER_ITER: usize = 10_000;

fn bench_task_burst(c: &mut Criterion) {
    let workers = Scheduler::default_worker_thread_count();
    let mut scheduler = Scheduler::new();
    scheduler.set_worker_thread_count(workers);
    scheduler.bind();

    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(TASKS_PER_ITER as u64));
    group.sample_size(20);

    group.bench_function(BenchmarkId::new("task_burst", workers), |b| {
        b.iter(|| {
            let wg = WaitGroup::new(TASKS_PER_ITER);
            for _ in 0..TASKS_PER_ITER {
                let wg = wg.clone();
                schedule(move || {
                    wg.done();
                });
            }
            wg.wait();
        });
    });

    group.finish();
    Scheduler::unbind();
}

criterion_group!(benches, bench_task_burst);
criterion_main!(benches);
