//! Benchmark configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::IndexSelection;
use crate::record::RecordShape;
use crate::retry::RetryPolicy;

/// Default number of records generated per simulated client.
pub const DEFAULT_RECORDS_PER_CLIENT: usize = 500_000;

/// Default maximum records per bulk insert call.
pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// Default number of simulated clients.
pub const DEFAULT_CLIENTS: usize = 2;

/// Default number of iterations per index type.
pub const DEFAULT_ITERATIONS: u32 = 2;

/// Default relational pool size.
pub const DEFAULT_SQL_POOL_SIZE: usize = 20;

/// Default document store pool size.
pub const DEFAULT_MONGO_POOL_SIZE: usize = 125;

/// Default relational table base name.
pub const DEFAULT_SQL_TABLE: &str = "test_table";

/// Default document collection base name.
pub const DEFAULT_MONGO_COLLECTION: &str = "test_collection";

/// Default document database.
pub const DEFAULT_MONGO_DATABASE: &str = "crudbench";

/// Matrix-level benchmark configuration.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Records generated for each simulated client.
    pub records_per_client: usize,

    /// Maximum records per bulk insert call.
    pub batch_size: usize,

    /// Number of simulated clients.
    pub clients: usize,

    /// Iterations per index type.
    pub iterations: u32,

    /// Index types to run.
    pub index: IndexSelection,

    /// Record layout.
    pub record_shape: RecordShape,

    /// Run the update phase.
    pub test_update: bool,

    /// Run the delete phase.
    pub test_delete: bool,

    /// Retry policy applied to every benchmarked call.
    pub retry: RetryPolicy,
}

impl BenchConfig {
    pub fn new() -> Self {
        Self {
            records_per_client: DEFAULT_RECORDS_PER_CLIENT,
            batch_size: DEFAULT_BATCH_SIZE,
            clients: DEFAULT_CLIENTS,
            iterations: DEFAULT_ITERATIONS,
            index: IndexSelection::All,
            record_shape: RecordShape::Big,
            test_update: true,
            test_delete: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_records_per_client(mut self, records: usize) -> Self {
        self.records_per_client = records;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_index(mut self, index: IndexSelection) -> Self {
        self.index = index;
        self
    }

    pub fn with_record_shape(mut self, shape: RecordShape) -> Self {
        self.record_shape = shape;
        self
    }

    pub fn with_update(mut self, enabled: bool) -> Self {
        self.test_update = enabled;
        self
    }

    pub fn with_delete(mut self, enabled: bool) -> Self {
        self.test_delete = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Total records in one iteration's dataset.
    pub fn dataset_size(&self) -> usize {
        self.records_per_client.saturating_mul(self.clients)
    }

    /// Reject values the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            return Err(Error::Config("clients must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        if self.iterations == 0 {
            return Err(Error::Config("iterations must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Relational backend connection settings.
#[derive(Debug, Clone)]
pub struct SqlBackendConfig {
    /// Connection URL, `mysql://...` or `sqlite://...`.
    pub url: String,

    /// Base table name; iteration tables are derived from it.
    pub table: String,

    /// Pooled connection capacity.
    pub pool_size: usize,

    /// Concurrent query workers. Defaults to the pool size.
    pub max_workers: Option<usize>,
}

impl SqlBackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: DEFAULT_SQL_TABLE.to_string(),
            pool_size: DEFAULT_SQL_POOL_SIZE,
            max_workers: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or(self.pool_size).max(1)
    }
}

/// Document backend connection settings.
#[derive(Debug, Clone)]
pub struct MongoBackendConfig {
    pub url: String,
    pub database: String,
    /// Base collection name; iteration collections are derived from it.
    pub collection: String,
    /// Driver connection pool size.
    pub pool_size: usize,
    /// Server selection and connect timeout.
    pub connect_timeout: Duration,
}

impl MongoBackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: DEFAULT_MONGO_DATABASE.to_string(),
            collection: DEFAULT_MONGO_COLLECTION.to_string(),
            pool_size: DEFAULT_MONGO_POOL_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
