use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{DateTime, Utc};
use mediasync_jobs::{InMemoryJobStore, JobId, JobRecord, JobSelector, JobStore};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
struct Payload {
    visible: bool,
    received_at: i64,
}

/// Visible first, then newest.
struct VisibleFirst {
    limit: usize,
    now: DateTime<Utc>,
}

impl JobSelector<Payload> for VisibleFirst {
    fn limit(&self) -> usize {
        self.limit
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn compare(&self, a: &JobRecord<Payload>, b: &JobRecord<Payload>) -> Ordering {
        b.data
            .visible
            .cmp(&a.data.visible)
            .then_with(|| b.data.received_at.cmp(&a.data.received_at))
    }
}

fn populated_store(runtime: &tokio::runtime::Runtime, size: usize) -> InMemoryJobStore<Payload> {
    let store = InMemoryJobStore::new();
    let records = (0..size)
        .map(|i| {
            JobRecord::new(
                JobId::new(format!("job-{i}")),
                Payload {
                    visible: i % 50 == 0,
                    received_at: i as i64,
                },
            )
        })
        .collect();
    runtime
        .block_on(JobStore::<Payload, VisibleFirst>::insert(&store, records))
        .unwrap();
    store
}

fn bench_next_jobs(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("in_memory_next_jobs");

    for backlog in [100usize, 1_000, 10_000].iter() {
        let store = populated_store(&runtime, *backlog);
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, _| {
            b.iter(|| {
                let query = VisibleFirst {
                    limit: 3,
                    now: Utc::now(),
                };
                let jobs = runtime.block_on(store.next_jobs(query)).unwrap();
                black_box(jobs)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_next_jobs);
criterion_main!(benches);
