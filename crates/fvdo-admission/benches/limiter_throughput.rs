//! Admission hot-path benchmarks: uncontended poll/release cycles and
//! contended acquire/release across threads.

use criterion::{criterion_group, criterion_main, Criterion};
use fvdo_admission::Limiter;
use std::sync::Arc;
use std::thread;

fn uncontended_poll(c: &mut Criterion) {
    let limiter = Limiter::new(2000);
    c.bench_function("limiter_poll_release_uncontended", |b| {
        b.iter(|| {
            assert!(limiter.acquire_poll());
            limiter.release_one();
        });
    });
}

fn contended_acquire(c: &mut Criterion) {
    c.bench_function("limiter_acquire_release_4_threads", |b| {
        b.iter(|| {
            let limiter = Arc::new(Limiter::new(64));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    thread::spawn(move || {
                        for _ in 0..256 {
                            limiter.acquire_blocking();
                            limiter.release_one();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(benches, uncontended_poll, contended_acquire);
criterion_main!(benches);
