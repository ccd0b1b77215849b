//! Integration tests for the benchmark matrix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crudbench_core::{
    Backend, BenchConfig, Dataset, DatasetGenerator, Error, FakeDataGenerator, IndexCreator,
    IndexKind, IndexSelection, MemorySink, OperationName, Record, RecordShape, Repository, Result,
    RetryPolicy, TestRunner, Timed, TimingMethod,
};

type Store = Arc<Mutex<HashMap<String, Vec<Record>>>>;

/// In-memory backend that remembers which dataset each insert saw.
struct MemoryBackend {
    name: String,
    base: String,
    store: Store,
    first_chunks: Arc<Mutex<Vec<(String, usize)>>>,
    /// Targets present in the store at each target's first insert.
    live_targets: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    fail_open: bool,
}

impl MemoryBackend {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: format!("test_{}", name.to_lowercase()),
            store: Arc::default(),
            first_chunks: Arc::default(),
            live_targets: Arc::default(),
            fail_open: false,
        }
    }

    fn failing(name: &str) -> Self {
        Self {
            fail_open: true,
            ..Self::new(name)
        }
    }
}

struct MemoryRepository {
    target: String,
    store: Store,
    first_chunks: Arc<Mutex<Vec<(String, usize)>>>,
    live_targets: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

#[async_trait]
impl IndexCreator for MemoryRepository {
    async fn create_foreign_key_index(&self) -> bool {
        true
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn target_name(&self) -> &str {
        &self.target
    }

    fn record_shape(&self) -> RecordShape {
        RecordShape::Small
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.store.lock().entry(self.target.clone()).or_default();
        Ok(())
    }

    async fn create_bulk(&self, records: &[Record]) -> Timed<u64> {
        let mut store = self.store.lock();
        if store.get(&self.target).map_or(true, Vec::is_empty) {
            let mut live: Vec<String> = store.keys().cloned().collect();
            live.sort();
            self.live_targets.lock().push((self.target.clone(), live));
            self.first_chunks
                .lock()
                .push((self.target.clone(), records.as_ptr() as usize));
        }
        let rows = store.entry(self.target.clone()).or_default();
        rows.extend_from_slice(records);
        Timed::new(records.len() as u64, Duration::from_millis(2), TimingMethod::Database)
    }

    async fn fetch_all(&self, client_id: i64) -> Timed<Vec<Record>> {
        let rows = self
            .store
            .lock()
            .get(&self.target)
            .map(|rows| rows.iter().filter(|r| r.client_id() == client_id).cloned().collect())
            .unwrap_or_default();
        Timed::new(rows, Duration::from_millis(4), TimingMethod::WallClock)
    }

    async fn update_all(&self, client_id: i64, _shape: RecordShape) -> Timed<u64> {
        let count = self
            .store
            .lock()
            .get(&self.target)
            .map(|rows| rows.iter().filter(|r| r.client_id() == client_id).count())
            .unwrap_or(0);
        Timed::new(count as u64, Duration::from_millis(1), TimingMethod::Database)
    }

    async fn delete_all(&self, client_id: i64) -> Timed<u64> {
        let mut store = self.store.lock();
        let Some(rows) = store.get_mut(&self.target) else {
            return Timed::zero();
        };
        let before = rows.len();
        rows.retain(|r| r.client_id() != client_id);
        Timed::new((before - rows.len()) as u64, Duration::from_millis(1), TimingMethod::Database)
    }

    async fn clear(&self) -> bool {
        self.store.lock().remove(&self.target);
        true
    }

    async fn drop_targets_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut store = self.store.lock();
        let dropped: Vec<String> = store.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        for name in &dropped {
            store.remove(name);
        }
        Ok(dropped)
    }

    async fn close(&self) {}
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_target_name(&self) -> &str {
        &self.base
    }

    async fn open_repository(&self, target: &str) -> Result<Box<dyn Repository>> {
        if self.fail_open && target != self.base {
            return Err(Error::Connection("backend unavailable".to_string()));
        }
        Ok(Box::new(MemoryRepository {
            target: target.to_string(),
            store: self.store.clone(),
            first_chunks: self.first_chunks.clone(),
            live_targets: self.live_targets.clone(),
        }))
    }

    async fn close(&self) {}
}

struct CountingGenerator {
    inner: FakeDataGenerator,
    calls: Arc<AtomicUsize>,
}

impl DatasetGenerator for CountingGenerator {
    fn generate(&self, records_per_client: usize, clients: usize, shape: RecordShape) -> Dataset {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(records_per_client, clients, shape)
    }
}

fn backends(list: &[&Arc<MemoryBackend>]) -> Vec<Arc<dyn Backend>> {
    list.iter()
        .map(|backend| Arc::clone(backend) as Arc<dyn Backend>)
        .collect()
}

fn small_config() -> BenchConfig {
    BenchConfig::new()
        .with_records_per_client(20)
        .with_clients(2)
        .with_batch_size(15)
        .with_iterations(2)
        .with_index(IndexSelection::All)
        .with_record_shape(RecordShape::Small)
        .with_retry(RetryPolicy::new(1, Duration::ZERO))
}

#[tokio::test]
async fn test_full_matrix_produces_every_result() {
    let mysql = Arc::new(MemoryBackend::new("MySQL"));
    let mongo = Arc::new(MemoryBackend::new("MongoDB"));
    let sink = MemorySink::new();

    let mut runner = TestRunner::new(small_config(), backends(&[&mysql, &mongo]))
        .unwrap()
        .with_sink(sink.clone());
    let report = runner.run().await;

    // 2 index types x 2 iterations x 2 backends x 4 phases
    assert_eq!(report.len(), 32);
    assert_eq!(report.for_backend("MySQL").count(), 16);
    assert_eq!(report.for_operation(OperationName::Delete).count(), 8);
    assert!(report.results.iter().all(|r| r.records == 40 && r.threads == 2));

    let first = &report.results[0];
    assert_eq!(first.database, "MySQL");
    assert_eq!(first.operation, OperationName::Insert);
    assert_eq!(first.indexes_type, IndexKind::NoIndexes);
    assert_eq!(first.iteration, 1);
    // 3 chunks of at most 15 records, 2 ms each
    assert_eq!(first.time, 6.0);
    assert_eq!(first.timing_method, TimingMethod::Database);

    let fetch = &report.results[1];
    assert_eq!(fetch.operation, OperationName::FetchAll);
    assert_eq!(fetch.time, 4.0);
    assert_eq!(fetch.timing_method, TimingMethod::WallClock);

    assert_eq!(sink.published_indexes(), vec![IndexKind::NoIndexes, IndexKind::ForeignKey]);
    assert_eq!(sink.results().len(), 32);
    runner.close().await;
}

#[tokio::test]
async fn test_backends_share_iteration_dataset() {
    let mysql = Arc::new(MemoryBackend::new("MySQL"));
    let mongo = Arc::new(MemoryBackend::new("MongoDB"));
    let calls = Arc::new(AtomicUsize::new(0));
    let generator = CountingGenerator {
        inner: FakeDataGenerator::default(),
        calls: calls.clone(),
    };

    let config = small_config().with_index(IndexSelection::Only(IndexKind::ForeignKey));
    let mut runner = TestRunner::new(config, backends(&[&mysql, &mongo]))
        .unwrap()
        .with_generator(generator);
    runner.run().await;

    // Once per iteration, never per backend.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mysql_chunks = mysql.first_chunks.lock().clone();
    let mongo_chunks = mongo.first_chunks.lock().clone();
    assert_eq!(mysql_chunks.len(), 2);
    assert_eq!(mongo_chunks.len(), 2);
    for iteration in 0..2 {
        assert_eq!(mysql_chunks[iteration].1, mongo_chunks[iteration].1);
    }
    assert_eq!(mysql_chunks[0].0, "test_mysql_test_foreign_key_iter_1");
    assert_eq!(mongo_chunks[1].0, "test_mongodb_test_foreign_key_iter_2");
}

#[tokio::test]
async fn test_failing_backend_records_zero_results() {
    let broken = Arc::new(MemoryBackend::failing("Broken"));
    let healthy = Arc::new(MemoryBackend::new("Healthy"));
    let config = small_config()
        .with_index(IndexSelection::Only(IndexKind::NoIndexes))
        .with_iterations(1);

    let mut runner = TestRunner::new(config, backends(&[&broken, &healthy])).unwrap();
    let report = runner.run().await;

    assert_eq!(report.len(), 8);
    let broken: Vec<_> = report.for_backend("Broken").collect();
    assert_eq!(broken.len(), 4);
    assert!(broken
        .iter()
        .all(|r| r.time == 0.0 && r.timing_method == TimingMethod::Unmeasured));

    let healthy: Vec<_> = report.for_backend("Healthy").collect();
    assert!(healthy.iter().all(|r| r.time > 0.0));
}

#[tokio::test]
async fn test_storage_dropped_after_run() {
    let backend = Arc::new(MemoryBackend::new("MySQL"));
    let config = small_config().with_delete(false);

    let mut runner = TestRunner::new(config, backends(&[&backend])).unwrap();
    let report = runner.run().await;

    assert_eq!(report.for_operation(OperationName::Delete).count(), 0);
    assert_eq!(report.len(), 12);
    assert!(backend.store.lock().is_empty());
}

#[tokio::test]
async fn test_previous_iteration_dropped_before_next_insert() {
    let backend = Arc::new(MemoryBackend::new("MySQL"));
    let config = small_config()
        .with_index(IndexSelection::Only(IndexKind::NoIndexes))
        .with_iterations(3);

    let mut runner = TestRunner::new(config, backends(&[&backend])).unwrap();
    runner.run().await;

    let live = backend.live_targets.lock().clone();
    assert_eq!(live.len(), 3);
    for (target, present) in &live {
        // Only the target being filled exists when its first chunk lands.
        assert_eq!(present, &vec![target.clone()]);
    }
    assert_eq!(live[1].0, "test_mysql_test_no_indexes_iter_2");
}

#[tokio::test]
async fn test_client_comparison_per_backend_and_index() {
    let mysql = Arc::new(MemoryBackend::new("MySQL"));
    let mongo = Arc::new(MemoryBackend::new("MongoDB"));
    let sink = MemorySink::new();
    let config = small_config().with_update(false).with_delete(false);

    let mut runner = TestRunner::new(config, backends(&[&mysql, &mongo]))
        .unwrap()
        .with_sink(sink.clone());
    runner.run().await;

    let comparisons = sink.client_comparisons();
    assert_eq!(comparisons.len(), 4);
    for comparison in &comparisons {
        // 2 clients x 2 iterations of fetch timings
        assert_eq!(comparison.timings.len(), 4);
        assert!(comparison
            .timings
            .iter()
            .all(|t| t.operation == OperationName::FetchAll && t.records == 20));
    }
    assert!(comparisons
        .iter()
        .any(|c| c.backend == "MongoDB" && c.index == IndexKind::ForeignKey));
}

#[test]
fn test_invalid_config_rejected() {
    let config = small_config().with_clients(0);
    assert!(matches!(
        TestRunner::new(config, Vec::new()),
        Err(Error::Config(_))
    ));
}
