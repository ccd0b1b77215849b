//! Benchmark matrix driver.
//!
//! The runner walks index type, iteration and backend strictly in sequence
//! so that every backend is measured without contention from the others.
//! Parallelism only happens inside a phase, in each backend's executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use crate::config::BenchConfig;
use crate::error::Result;
use crate::fixtures::{DatasetGenerator, FakeDataGenerator};
use crate::index::IndexKind;
use crate::record::Dataset;
use crate::repository::Backend;
use crate::result::{ClientTiming, OperationName, OperationResult};
use crate::sink::{LogSink, ResultSink};
use crate::tester::{DatabaseTester, PhaseOutcome};
use crate::timing::TimingMethod;

/// Every result produced by one [`TestRunner::run`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub results: Vec<OperationResult>,
}

impl RunReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results of one backend, in run order.
    pub fn for_backend<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a OperationResult> {
        self.results.iter().filter(move |r| r.database == name)
    }

    /// Results of one operation, in run order.
    pub fn for_operation(&self, operation: OperationName) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(move |r| r.operation == operation)
    }
}

/// Runs the {index type x iteration x backend} matrix.
pub struct TestRunner {
    config: BenchConfig,
    testers: Vec<DatabaseTester>,
    generator: Box<dyn DatasetGenerator>,
    sink: Box<dyn ResultSink>,
    client_results: BTreeMap<(String, IndexKind), Vec<ClientTiming>>,
}

/// Builds result records for one iteration.
struct ResultContext<'a> {
    config: &'a BenchConfig,
    index: IndexKind,
    iteration: u32,
}

impl ResultContext<'_> {
    fn result(
        &self,
        database: &str,
        operation: OperationName,
        phase: Option<&PhaseOutcome>,
    ) -> OperationResult {
        let (time, timing_method) = match phase {
            Some(phase) => (phase.elapsed_ms(), phase.method),
            None => (0.0, TimingMethod::Unmeasured),
        };
        OperationResult {
            database: database.to_string(),
            operation,
            records: self.config.dataset_size() as u64,
            time,
            timestamp: Utc::now(),
            timing_method,
            indexes_type: self.index,
            threads: self.config.clients,
            iteration: self.iteration,
        }
    }
}

impl TestRunner {
    /// Create a runner over `backends`, run in the given order.
    ///
    /// Uses the seeded [`FakeDataGenerator`] and a [`LogSink`] until
    /// replaced.
    pub fn new(config: BenchConfig, backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        config.validate()?;
        let testers = backends
            .into_iter()
            .map(|backend| DatabaseTester::new(backend, config.clone()))
            .collect();
        Ok(Self {
            config,
            testers,
            generator: Box::new(FakeDataGenerator::default()),
            sink: Box::new(LogSink),
            client_results: BTreeMap::new(),
        })
    }

    pub fn with_generator(mut self, generator: impl DatasetGenerator + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn with_sink(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Run the full matrix. Phase failures become zero results.
    pub async fn run(&mut self) -> RunReport {
        let mut report = RunReport::default();

        for index in self.config.index.kinds() {
            tracing::info!(index = %index, "starting index type");
            self.cleanup().await;

            // Generated on the first backend of an iteration, reused by the rest.
            let mut cache: HashMap<u32, Arc<Dataset>> = HashMap::new();
            let mut index_results = Vec::new();

            for iteration in 1..=self.config.iterations {
                let span = tracing::info_span!("iteration", iteration, index = %index);
                self.run_iteration(index, iteration, &mut cache, &mut index_results)
                    .instrument(span)
                    .await;
            }

            self.cleanup().await;
            self.publish(index, &index_results);
            report.results.extend(index_results);
        }

        self.client_results.clear();
        tracing::info!(results = report.len(), "benchmark finished");
        report
    }

    async fn run_iteration(
        &mut self,
        index: IndexKind,
        iteration: u32,
        cache: &mut HashMap<u32, Arc<Dataset>>,
        results: &mut Vec<OperationResult>,
    ) {
        let Self {
            config,
            testers,
            generator,
            client_results,
            ..
        } = self;
        let config = &*config;
        let context = ResultContext {
            config,
            index,
            iteration,
        };

        for tester in testers.iter_mut() {
            let name = tester.name().to_string();
            tracing::info!(backend = %name, "testing backend");
            let clients = client_results.entry((name.clone(), index)).or_default();

            let cached = cache.get(&iteration).cloned();
            match tester
                .run_insert_fetch(index, iteration, cached, &**generator)
                .await
            {
                Ok(outcome) => {
                    results.push(context.result(&name, OperationName::Insert, Some(&outcome.insert)));
                    results.push(context.result(&name, OperationName::FetchAll, Some(&outcome.fetch)));
                    clients.extend(outcome.fetch.per_client);
                    cache.entry(iteration).or_insert(outcome.dataset);
                }
                Err(e) => {
                    tracing::error!(backend = %name, error = %e, "insert and fetch failed");
                    results.push(context.result(&name, OperationName::Insert, None));
                    results.push(context.result(&name, OperationName::FetchAll, None));
                }
            }

            if config.test_update {
                match tester.run_update().await {
                    Ok(outcome) => {
                        results.push(context.result(&name, OperationName::Update, Some(&outcome)));
                        clients.extend(outcome.per_client);
                    }
                    Err(e) => {
                        tracing::error!(backend = %name, error = %e, "update failed");
                        results.push(context.result(&name, OperationName::Update, None));
                    }
                }
            }

            if config.test_delete {
                match tester.run_delete().await {
                    Ok(outcome) => {
                        results.push(context.result(&name, OperationName::Delete, Some(&outcome)));
                        clients.extend(outcome.per_client);
                    }
                    Err(e) => {
                        tracing::error!(backend = %name, error = %e, "delete failed");
                        results.push(context.result(&name, OperationName::Delete, None));
                    }
                }
            }
        }
    }

    /// Drop leftover test tables and collections on every backend.
    async fn cleanup(&self) {
        for tester in &self.testers {
            match tester.cleanup().await {
                Ok(dropped) if !dropped.is_empty() => {
                    tracing::info!(backend = %tester.name(), dropped = dropped.len(), "dropped test storage");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(backend = %tester.name(), error = %e, "cleanup failed");
                }
            }
        }
    }

    fn publish(&mut self, index: IndexKind, results: &[OperationResult]) {
        if let Err(e) = self.sink.publish_results(index, results) {
            tracing::error!(index = %index, error = %e, "failed to publish results");
        }
        for ((backend, kind), timings) in &self.client_results {
            if *kind != index || timings.is_empty() {
                continue;
            }
            if let Err(e) = self.sink.publish_client_comparison(backend, index, timings) {
                tracing::error!(backend = %backend, index = %index, error = %e, "failed to publish client comparison");
            }
        }
    }

    /// Close every backend.
    pub async fn close(&mut self) {
        for tester in &mut self.testers {
            tracing::debug!(backend = %tester.name(), "closing backend");
            tester.close().await;
        }
    }
}
