//! Per-backend phase driver.
//!
//! A [`DatabaseTester`] runs one backend through the phases of a single
//! iteration: clear, generate or reuse data, insert, index, fetch, and
//! optionally update and delete. Each phase checks the state the previous
//! one left behind.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BenchConfig;
use crate::error::{Error, Result};
use crate::fixtures::DatasetGenerator;
use crate::index::IndexKind;
use crate::record::Dataset;
use crate::repository::{Backend, Repository};
use crate::result::{ClientTiming, OperationName};
use crate::timing::{Timed, TimingMethod};

/// Phase progress within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterState {
    Idle,
    Cleared,
    DataReady,
    Inserted,
    Indexed,
    Fetched,
    Updated,
    Deleted,
}

impl TesterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TesterState::Idle => "idle",
            TesterState::Cleared => "cleared",
            TesterState::DataReady => "data_ready",
            TesterState::Inserted => "inserted",
            TesterState::Indexed => "indexed",
            TesterState::Fetched => "fetched",
            TesterState::Updated => "updated",
            TesterState::Deleted => "deleted",
        }
    }
}

/// Aggregated timing of one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    /// Records inserted, fetched, updated or deleted.
    pub count: u64,
    /// Summed time for insert, per-client average for the other phases.
    pub elapsed: Duration,
    pub method: TimingMethod,
    /// Backend calls issued.
    pub calls: usize,
    pub per_client: Vec<ClientTiming>,
}

impl PhaseOutcome {
    fn empty() -> Self {
        Self {
            count: 0,
            elapsed: Duration::ZERO,
            method: TimingMethod::Unmeasured,
            calls: 0,
            per_client: Vec::new(),
        }
    }

    fn add<T>(&mut self, timed: &Timed<T>, count: u64) {
        self.count += count;
        self.elapsed += timed.elapsed;
        self.method = self.method.combine(timed.method);
        self.calls += 1;
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / 1_000_000.0
    }
}

/// Result of the insert and fetch phases.
#[derive(Debug, Clone)]
pub struct InsertFetchOutcome {
    pub insert: PhaseOutcome,
    pub fetch: PhaseOutcome,
    /// Dataset the phases ran on, for reuse by later backends.
    pub dataset: Arc<Dataset>,
}

/// Drives one backend through an iteration.
pub struct DatabaseTester {
    backend: Arc<dyn Backend>,
    config: BenchConfig,
    repository: Option<Box<dyn Repository>>,
    state: TesterState,
    iteration: u32,
}

impl DatabaseTester {
    pub fn new(backend: Arc<dyn Backend>, config: BenchConfig) -> Self {
        Self {
            backend,
            config,
            repository: None,
            state: TesterState::Idle,
            iteration: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn state(&self) -> TesterState {
        self.state
    }

    pub fn repository(&self) -> Option<&dyn Repository> {
        self.repository.as_deref()
    }

    /// Bind the tester to the target of one index type and iteration.
    ///
    /// A previously bound target is dropped before the new one is opened,
    /// so at most one iteration's data lives in the backend at a time.
    async fn bind(&mut self, index: IndexKind, iteration: u32) -> Result<&dyn Repository> {
        let target = self.backend.target_name(index, iteration);
        let reuse = matches!(&self.repository, Some(repo) if repo.target_name() == target);
        if !reuse {
            if let Some(previous) = self.repository.take() {
                if !previous.clear().await {
                    tracing::warn!(
                        backend = %self.backend.name(),
                        target = %previous.target_name(),
                        "could not drop previous target"
                    );
                }
                previous.close().await;
            }
            self.repository = Some(self.backend.open_repository(&target).await?);
        }
        self.iteration = iteration;
        self.state = TesterState::Idle;
        self.current()
    }

    fn current(&self) -> Result<&dyn Repository> {
        self.repository
            .as_deref()
            .ok_or_else(|| Error::Connection("no repository is open".to_string()))
    }

    /// Drop the iteration's target. Reports success when nothing was there.
    pub async fn clear(&mut self, index: IndexKind, iteration: u32) -> Result<bool> {
        let cleared = self.bind(index, iteration).await?.clear().await;
        if cleared {
            self.state = TesterState::Cleared;
        }
        Ok(cleared)
    }

    /// Drop every leftover test table or collection of this backend.
    pub async fn cleanup(&self) -> Result<Vec<String>> {
        let base = self.backend.base_target_name();
        let repository = self.backend.open_repository(base).await?;
        let dropped = repository.drop_targets_with_prefix(base).await;
        repository.close().await;
        dropped
    }

    /// Clear, insert the dataset, build the index and fetch every client.
    ///
    /// `cached` is reused as is. Without it a dataset is generated.
    pub async fn run_insert_fetch(
        &mut self,
        index: IndexKind,
        iteration: u32,
        cached: Option<Arc<Dataset>>,
        generator: &dyn DatasetGenerator,
    ) -> Result<InsertFetchOutcome> {
        let dataset = self.prepare(index, iteration, cached, generator).await?;
        let insert = self.insert(&dataset).await?;
        self.build_index(index).await?;
        let fetch = self.fetch().await?;

        tracing::info!(
            backend = %self.backend.name(),
            inserted = insert.count,
            insert_ms = insert.elapsed_ms(),
            fetched = fetch.count,
            fetch_ms = fetch.elapsed_ms(),
            "insert and fetch complete"
        );

        Ok(InsertFetchOutcome {
            insert,
            fetch,
            dataset,
        })
    }

    /// Bind and empty the iteration's target, then generate or reuse its dataset.
    pub async fn prepare(
        &mut self,
        index: IndexKind,
        iteration: u32,
        cached: Option<Arc<Dataset>>,
        generator: &dyn DatasetGenerator,
    ) -> Result<Arc<Dataset>> {
        let name = self.backend.name().to_string();
        let repository = self.bind(index, iteration).await?;
        if !repository.clear().await {
            tracing::warn!(backend = %name, "could not clear previous data");
        }
        repository.ensure_schema().await?;
        self.state = TesterState::Cleared;

        let dataset = match cached {
            Some(dataset) => dataset,
            None => Arc::new(generator.generate(
                self.config.records_per_client,
                self.config.clients,
                self.config.record_shape,
            )),
        };
        self.state = TesterState::DataReady;
        Ok(dataset)
    }

    /// Insert the dataset in `batch_size` chunks. Insert time is summed.
    pub async fn insert(&mut self, dataset: &Dataset) -> Result<PhaseOutcome> {
        self.expect_state(&[TesterState::DataReady], TesterState::Inserted)?;
        let batch_size = self.config.batch_size;
        let repository = self.current()?;
        tracing::info!(
            backend = %self.backend.name(),
            records = dataset.len(),
            batch_size,
            "inserting"
        );

        let mut insert = PhaseOutcome::empty();
        for chunk in dataset.chunks(batch_size) {
            let timed = repository.create_bulk(chunk).await;
            insert.add(&timed, timed.value);
        }
        self.state = TesterState::Inserted;
        Ok(insert)
    }

    /// Create the index of `index`. Returns whether an index was built.
    pub async fn build_index(&mut self, index: IndexKind) -> Result<bool> {
        self.expect_state(&[TesterState::Inserted], TesterState::Indexed)?;
        let created = match index {
            IndexKind::NoIndexes => false,
            _ => {
                let created = self.current()?.create_index(index).await;
                if !created {
                    tracing::warn!(
                        backend = %self.backend.name(),
                        index = %index,
                        "index was not created"
                    );
                }
                created
            }
        };
        self.state = TesterState::Indexed;
        Ok(created)
    }

    /// Fetch every client's records. Time is the per-client average.
    pub async fn fetch(&mut self) -> Result<PhaseOutcome> {
        self.expect_state(&[TesterState::Indexed], TesterState::Fetched)?;
        let clients = self.config.clients;
        let repository = self.current()?;
        tracing::info!(backend = %self.backend.name(), clients, "fetching");

        let mut fetch = PhaseOutcome::empty();
        for client_id in 0..clients as i64 {
            let timed = repository.fetch_all(client_id).await;
            let count = timed.value.len() as u64;
            fetch.add(&timed, count);
            fetch.per_client.push(client_timing(
                client_id,
                OperationName::FetchAll,
                &timed,
                count,
                self.iteration,
            ));
        }
        fetch.elapsed = average(fetch.elapsed, clients);
        self.state = TesterState::Fetched;
        Ok(fetch)
    }

    /// Update every client's records. Requires a completed fetch phase.
    pub async fn run_update(&mut self) -> Result<PhaseOutcome> {
        self.expect_state(&[TesterState::Fetched], TesterState::Updated)?;
        let shape = self.config.record_shape;
        let outcome = self
            .per_client(OperationName::Update, |repo, client_id| {
                Box::pin(async move { repo.update_all(client_id, shape).await })
            })
            .await?;
        self.state = TesterState::Updated;
        Ok(outcome)
    }

    /// Delete every client's records. Requires a completed fetch or update phase.
    pub async fn run_delete(&mut self) -> Result<PhaseOutcome> {
        self.expect_state(
            &[TesterState::Fetched, TesterState::Updated],
            TesterState::Deleted,
        )?;
        let outcome = self
            .per_client(OperationName::Delete, |repo, client_id| {
                Box::pin(async move { repo.delete_all(client_id).await })
            })
            .await?;
        self.state = TesterState::Deleted;
        Ok(outcome)
    }

    async fn per_client<F>(&self, operation: OperationName, call: F) -> Result<PhaseOutcome>
    where
        F: for<'a> Fn(
            &'a dyn Repository,
            i64,
        ) -> futures::future::BoxFuture<'a, Timed<u64>>,
    {
        let repository = self.current()?;
        let clients = self.config.clients;
        let mut outcome = PhaseOutcome::empty();
        for client_id in 0..clients as i64 {
            let timed = call(repository, client_id).await;
            outcome.add(&timed, timed.value);
            outcome.per_client.push(client_timing(
                client_id,
                operation,
                &timed,
                timed.value,
                self.iteration,
            ));
        }
        outcome.elapsed = average(outcome.elapsed, clients);
        tracing::info!(
            backend = %self.backend.name(),
            operation = %operation,
            records = outcome.count,
            time_ms = outcome.elapsed_ms(),
            "phase complete"
        );
        Ok(outcome)
    }

    fn expect_state(&self, allowed: &[TesterState], next: TesterState) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Release the repository and the backend.
    pub async fn close(&mut self) {
        if let Some(repository) = self.repository.take() {
            repository.close().await;
        }
        self.backend.close().await;
        self.state = TesterState::Idle;
    }
}

fn client_timing<T>(
    client_id: i64,
    operation: OperationName,
    timed: &Timed<T>,
    records: u64,
    iteration: u32,
) -> ClientTiming {
    ClientTiming {
        client_id,
        operation,
        records,
        time: timed.elapsed_ms(),
        iteration,
    }
}

fn average(total: Duration, clients: usize) -> Duration {
    if clients == 0 {
        Duration::ZERO
    } else {
        total / clients as u32
    }
}
