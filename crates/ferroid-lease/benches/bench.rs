use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use ferroid_lease::{
    CoordinationSession, LeaseMonitor, MemoryCluster, MemorySession, SlotAllocator,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::runtime::Builder;

const BASE: &str = "/bench";

// Claims per benchmark iteration; also the pool size so the counter path is
// exercised without ever exhausting the pool.
const TOTAL_CLAIMS: u32 = 1024;

// Long enough that nothing expires while measuring.
const TTL: Duration = Duration::from_secs(3600);

/// Benchmarks sequential claims that each grow the counter.
fn benchmark_sequential_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential/counter");
    group.throughput(Throughput::Elements(u64::from(TOTAL_CLAIMS)));

    group.bench_function(format!("elems/{TOTAL_CLAIMS}"), |b| {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(1)
            .build()
            .unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let mut elapsed = Duration::ZERO;

            for _ in 0..iters {
                let cluster = MemoryCluster::new();
                let session = Arc::new(cluster.session());
                let allocator = SlotAllocator::new(LeaseMonitor::spawn());

                let start = Instant::now();
                for _ in 0..TOTAL_CLAIMS {
                    let claim = allocator
                        .claim_expiring(&session, TOTAL_CLAIMS, BASE, TTL)
                        .await
                        .unwrap();
                    black_box(claim);
                }
                elapsed += start.elapsed();

                allocator.monitor().shutdown();
            }

            elapsed
        });
    });

    group.finish();
}

/// Benchmarks claims that are all served from the reuse queue.
fn benchmark_sequential_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential/reuse");
    group.throughput(Throughput::Elements(u64::from(TOTAL_CLAIMS)));

    group.bench_function(format!("elems/{TOTAL_CLAIMS}"), |b| {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(1)
            .build()
            .unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let mut elapsed = Duration::ZERO;

            for _ in 0..iters {
                let cluster = MemoryCluster::new();
                let session = Arc::new(cluster.session());
                for slot in 0..TOTAL_CLAIMS {
                    session.push(&format!("{BASE}/queue"), slot).await.unwrap();
                }
                let allocator = SlotAllocator::new(LeaseMonitor::spawn());

                let start = Instant::now();
                for _ in 0..TOTAL_CLAIMS {
                    let claim = allocator
                        .claim_expiring(&session, TOTAL_CLAIMS, BASE, TTL)
                        .await
                        .unwrap();
                    black_box(claim);
                }
                elapsed += start.elapsed();

                allocator.monitor().shutdown();
            }

            elapsed
        });
    });

    group.finish();
}

/// Benchmarks many tasks racing for slots of one shared pool.
fn benchmark_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    group.sample_size(10);
    group.sampling_mode(criterion::SamplingMode::Flat);
    group.throughput(Throughput::Elements(u64::from(TOTAL_CLAIMS)));

    for num_tasks in [1, 4, 16, 64] {
        let claims_per_task = TOTAL_CLAIMS / num_tasks;

        group.bench_function(format!("elems/{TOTAL_CLAIMS}/tasks/{num_tasks}"), |b| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();

            b.to_async(&rt).iter_custom(move |iters| async move {
                let mut elapsed = Duration::ZERO;

                for _ in 0..iters {
                    let cluster = MemoryCluster::new();
                    let session: Arc<MemorySession> = Arc::new(cluster.session());
                    let allocator = SlotAllocator::new(LeaseMonitor::spawn());

                    let start = Instant::now();
                    let tasks: Vec<_> = (0..num_tasks)
                        .map(|_| {
                            let session = Arc::clone(&session);
                            let allocator = allocator.clone();
                            tokio::spawn(async move {
                                for _ in 0..claims_per_task {
                                    let claim = allocator
                                        .claim_expiring(&session, TOTAL_CLAIMS, BASE, TTL)
                                        .await
                                        .unwrap();
                                    black_box(claim);
                                }
                            })
                        })
                        .collect();
                    for task in tasks {
                        task.await.unwrap();
                    }
                    elapsed += start.elapsed();

                    allocator.monitor().shutdown();
                }

                elapsed
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_counter,
    benchmark_sequential_reuse,
    benchmark_contended,
);
criterion_main!(benches);
