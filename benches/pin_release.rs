//! Throughput of `pin`/release under contention, modernized from the
//! teacher's `bin/bench_criterion.rs` onto stable `criterion`.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use splitref::AtomicSlot;

const OPS_PER_THREAD: u64 = 20_000;

fn pin_release_single_threaded(c: &mut Criterion) {
    let slot = AtomicSlot::new(0u64);
    c.bench_function("pin_release/1_thread", |b| {
        b.iter(|| {
            for _ in 0..OPS_PER_THREAD {
                let pinned = slot.pin();
                std::hint::black_box(&*pinned);
            }
        });
    });
}

fn pin_release_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pin_release/contended");
    for threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let slot = Arc::new(AtomicSlot::new(0u64));
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        let slot = Arc::clone(&slot);
                        scope.spawn(move || {
                            for _ in 0..OPS_PER_THREAD {
                                let pinned = slot.pin();
                                std::hint::black_box(&*pinned);
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, pin_release_single_threaded, pin_release_contended);
criterion_main!(benches);
