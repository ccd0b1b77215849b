//! Orchestration overhead benchmarks.
//!
//! These measure the client-side cost the harness adds around every
//! benchmarked call, using an in-process connection factory.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crudbench_core::{
    ConnectionFactory, ConnectionPool, DatasetGenerator, FakeDataGenerator, ManagedConnection,
    RecordShape, Result,
};
use tokio::runtime::Runtime;

struct NoopConnection;

#[async_trait]
impl ManagedConnection for NoopConnection {
    fn is_connected(&self) -> bool {
        true
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

struct NoopFactory;

#[async_trait]
impl ConnectionFactory for NoopFactory {
    type Connection = NoopConnection;

    async fn connect(&self) -> Result<NoopConnection> {
        Ok(NoopConnection)
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_checkout_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/checkout");
    let rt = runtime();

    for size in [1usize, 20, 125] {
        let pool = ConnectionPool::new(NoopFactory, size);
        group.bench_with_input(BenchmarkId::new("sequential", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let conn = pool.checkout().await.unwrap();
                conn.release().await;
            });
        });
    }

    group.finish();
}

fn bench_concurrent_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/concurrent");
    let rt = runtime();

    for clients in [2usize, 8, 32] {
        let pool = ConnectionPool::new(NoopFactory, 8);
        group.bench_with_input(BenchmarkId::new("clients", clients), &clients, |b, &clients| {
            b.to_async(&rt).iter(|| async {
                let checkouts = (0..clients).map(|_| pool.checkout());
                let conns = futures::future::try_join_all(checkouts).await.unwrap();
                for conn in conns {
                    conn.release().await;
                }
            });
        });
    }

    group.finish();
}

fn bench_dataset_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixtures/generate");
    let generator = FakeDataGenerator::default();

    for records in [1_000usize, 10_000] {
        for shape in [RecordShape::Small, RecordShape::Big] {
            let id = BenchmarkId::new(shape.as_str(), records);
            group.bench_with_input(id, &records, |b, &records| {
                b.iter(|| black_box(generator.generate(records, 2, shape)));
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_checkout_release,
    bench_concurrent_checkout,
    bench_dataset_generation,
);
criterion_main!(benches);
