//! Multi-threaded contention on a single named channel.

use std::{hint::black_box, sync::Arc, thread};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use statecast::{NamedStore, Payload, StateHandler};

const THREAD_COUNTS: &[usize] = &[1, 2, 4, 8];
const UPDATES_PER_THREAD: usize = 1_000;

fn bench_shared_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_channel");

    for &threads in THREAD_COUNTS {
        group.bench_with_input(
            BenchmarkId::new("update_and_read", threads),
            &threads,
            |b, &threads| {
                let store = Arc::new(NamedStore::new());
                store
                    .subscribe("watchlist", StateHandler::new(|state| {
                        black_box(state);
                    }))
                    .unwrap();
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let store = store.clone();
                            thread::spawn(move || {
                                for i in 0..UPDATES_PER_THREAD {
                                    store
                                        .update_state("Watchlist", Payload::new((t + i) % 2 == 0))
                                        .unwrap();
                                    black_box(store.get_current_state("watchlist").unwrap());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_shared_channel);
criterion_main!(benches);
