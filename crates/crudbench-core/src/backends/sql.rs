//! Relational backend over sqlx's `Any` driver.
//!
//! MySQL is profiled through `performance_schema`. SQLite has no profiler and
//! always reports wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::AnyConnection;
use sqlx::query::Query;
use sqlx::{Any, Connection, Row};

use crate::config::SqlBackendConfig;
use crate::error::{Error, Result};
use crate::executor::{join_all, QueryConnection, QueryExecutor, SqlValue};
use crate::pool::{ConnectionFactory, ConnectionPool, ManagedConnection};
use crate::record::{PersonRecord, Record, RecordShape, ValueRecord};
use crate::repository::{Backend, IndexCreator, Repository};
use crate::retry::RetryPolicy;
use crate::timing::{profile, OperationClass, Profiler, Timed};

use super::validate_identifier;

const MYSQL_SESSION_SETTINGS: [&str; 5] = [
    "SET SESSION sql_mode = 'STRICT_TRANS_TABLES'",
    "SET SESSION innodb_lock_wait_timeout = 50",
    "SET SESSION wait_timeout = 28800",
    "SET SESSION interactive_timeout = 28800",
    "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED",
];

const CLIENT_INDEX: &str = "idx_client_id";

/// SQL flavour, derived from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Sqlite,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(SqlDialect::MySql),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(Error::Config(format!(
                "unsupported relational url scheme: {}",
                other
            ))),
        }
    }

    /// Display name used in results.
    pub fn display_name(&self) -> &'static str {
        match self {
            SqlDialect::MySql => "MySQL",
            SqlDialect::Sqlite => "SQLite",
        }
    }
}

/// Opens sessions for the relational pool.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    url: String,
    dialect: SqlDialect,
}

impl SqlConnector {
    pub fn new(url: impl Into<String>, dialect: SqlDialect) -> Self {
        Self {
            url: url.into(),
            dialect,
        }
    }
}

#[async_trait]
impl ConnectionFactory for SqlConnector {
    type Connection = SqlConnection;

    async fn connect(&self) -> Result<SqlConnection> {
        let mut conn = AnyConnection::connect(&self.url).await?;
        if self.dialect == SqlDialect::MySql {
            for statement in MYSQL_SESSION_SETTINGS {
                sqlx::Executor::execute(&mut conn, sqlx::raw_sql(statement)).await?;
            }
        }
        Ok(SqlConnection { inner: conn, live: true })
    }
}

/// A pooled relational session.
pub struct SqlConnection {
    inner: AnyConnection,
    live: bool,
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Null => query.bind(None::<i64>),
        };
    }
    query
}

#[async_trait]
impl ManagedConnection for SqlConnection {
    fn is_connected(&self) -> bool {
        self.live
    }

    async fn close(self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

#[async_trait]
impl QueryConnection for SqlConnection {
    type Row = AnyRow;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<AnyRow>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut self.inner)
            .await?;
        Ok(rows)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let result = if params.is_empty() {
            sqlx::Executor::execute(&mut self.inner, sqlx::raw_sql(sql)).await?
        } else {
            bind_all(sqlx::query(sql), params)
                .execute(&mut self.inner)
                .await?
        };
        Ok(result.rows_affected())
    }

    async fn execute_many(&mut self, sql: &str, batch: &[Vec<SqlValue>]) -> Result<u64> {
        let mut tx = self.inner.begin().await?;
        let mut affected = 0;
        for params in batch {
            affected += bind_all(sqlx::query(sql), params)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    fn mark_broken(&mut self) {
        self.live = false;
    }
}

struct SqlShared {
    executor: QueryExecutor<SqlConnector>,
    dialect: SqlDialect,
    shape: RecordShape,
    retry: RetryPolicy,
}

/// Relational benchmark backend.
///
/// Every repository opened by the backend shares one query executor.
pub struct SqlBackend {
    name: String,
    table: String,
    shared: Arc<SqlShared>,
}

impl SqlBackend {
    /// Connect and verify that a session can be opened.
    pub async fn connect(
        config: &SqlBackendConfig,
        shape: RecordShape,
        retry: RetryPolicy,
    ) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let dialect = SqlDialect::from_url(&config.url)?;
        validate_identifier(&config.table)?;

        let pool = ConnectionPool::new(SqlConnector::new(&config.url, dialect), config.pool_size);
        pool.checkout().await?.release().await;

        let executor = QueryExecutor::with_workers(pool, config.workers());
        tracing::info!(
            backend = dialect.display_name(),
            pool_size = config.pool_size,
            workers = executor.max_workers(),
            "connected relational backend"
        );

        Ok(Self {
            name: dialect.display_name().to_string(),
            table: config.table.clone(),
            shared: Arc::new(SqlShared {
                executor,
                dialect,
                shape,
                retry,
            }),
        })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.shared.dialect
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_target_name(&self) -> &str {
        &self.table
    }

    async fn open_repository(&self, target: &str) -> Result<Box<dyn Repository>> {
        validate_identifier(target)?;
        Ok(Box::new(SqlRepository {
            shared: self.shared.clone(),
            table: target.to_string(),
        }))
    }

    async fn close(&self) {
        self.shared.executor.shutdown().await;
        tracing::info!(backend = %self.name, "closed relational backend");
    }
}

/// Repository bound to one table.
pub struct SqlRepository {
    shared: Arc<SqlShared>,
    table: String,
}

impl SqlRepository {
    fn executor(&self) -> &QueryExecutor<SqlConnector> {
        &self.shared.executor
    }

    fn create_table_sql(&self) -> String {
        let t = &self.table;
        match (self.shared.dialect, self.shared.shape) {
            (SqlDialect::MySql, RecordShape::Big) => format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                 first_name VARCHAR(255) NOT NULL, \
                 last_name VARCHAR(255) NOT NULL, \
                 email VARCHAR(255) NOT NULL, \
                 address VARCHAR(255) NOT NULL, \
                 age BIGINT NOT NULL, \
                 client_id BIGINT NOT NULL) ENGINE=InnoDB"
            ),
            (SqlDialect::MySql, RecordShape::Small) => format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                 value BIGINT NOT NULL, \
                 client_id BIGINT NOT NULL) ENGINE=InnoDB"
            ),
            (SqlDialect::Sqlite, RecordShape::Big) => format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 first_name TEXT NOT NULL, \
                 last_name TEXT NOT NULL, \
                 email TEXT NOT NULL, \
                 address TEXT NOT NULL, \
                 age INTEGER NOT NULL, \
                 client_id INTEGER NOT NULL)"
            ),
            (SqlDialect::Sqlite, RecordShape::Small) => format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 value INTEGER NOT NULL, \
                 client_id INTEGER NOT NULL)"
            ),
        }
    }

    fn insert_sql(&self) -> String {
        match self.shared.shape {
            RecordShape::Big => format!(
                "INSERT INTO {} (first_name, last_name, email, address, age, client_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                self.table
            ),
            RecordShape::Small => format!(
                "INSERT INTO {} (value, client_id) VALUES (?, ?)",
                self.table
            ),
        }
    }

    fn select_sql(&self) -> String {
        match self.shared.shape {
            RecordShape::Big => format!(
                "SELECT first_name, last_name, email, address, age, client_id \
                 FROM {} WHERE client_id = ?",
                self.table
            ),
            RecordShape::Small => format!(
                "SELECT value, client_id FROM {} WHERE client_id = ?",
                self.table
            ),
        }
    }

    fn index_name(&self) -> String {
        match self.shared.dialect {
            SqlDialect::MySql => CLIENT_INDEX.to_string(),
            // SQLite index names are database-wide.
            SqlDialect::Sqlite => format!("{}_{}", self.table, CLIENT_INDEX),
        }
    }

    async fn index_exists(&self) -> Result<bool> {
        if self.shared.dialect == SqlDialect::Sqlite {
            return Ok(false);
        }
        let rows = self
            .executor()
            .submit(
                "SELECT COUNT(*) FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
                vec![self.table.as_str().into(), CLIENT_INDEX.into()],
            )
            .await?;
        let count: i64 = match rows.first() {
            Some(row) => row.try_get(0)?,
            None => 0,
        };
        Ok(count > 0)
    }

    /// Create the client id index. Returns false if it already existed.
    async fn ensure_client_index(&self) -> Result<bool> {
        if self.index_exists().await? {
            return Ok(false);
        }
        let sql = match self.shared.dialect {
            SqlDialect::MySql => {
                format!("CREATE INDEX {} ON {} (client_id)", self.index_name(), self.table)
            }
            SqlDialect::Sqlite => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (client_id)",
                self.index_name(),
                self.table
            ),
        };
        self.executor().submit_execute(sql, Vec::new()).await?;
        Ok(true)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let sql = match self.shared.dialect {
            SqlDialect::MySql => {
                "SELECT table_name AS name FROM information_schema.tables \
                 WHERE table_schema = DATABASE()"
            }
            SqlDialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table'",
        };
        let rows = self.executor().submit(sql, Vec::new()).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Error::from))
            .collect()
    }
}

fn record_params(record: &Record) -> Vec<SqlValue> {
    match record {
        Record::Full(p) => vec![
            p.first_name.as_str().into(),
            p.last_name.as_str().into(),
            p.email.as_str().into(),
            p.address.as_str().into(),
            p.age.into(),
            p.client_id.into(),
        ],
        Record::Minimal(v) => vec![v.value.into(), v.client_id.into()],
    }
}

/// Split records into at most `workers` contiguous parameter slices.
fn split_params(records: &[Record], workers: usize) -> Vec<Vec<Vec<SqlValue>>> {
    if records.is_empty() {
        return Vec::new();
    }
    let slice_len = records.len().div_ceil(workers.max(1));
    records
        .chunks(slice_len)
        .map(|slice| slice.iter().map(record_params).collect())
        .collect()
}

fn decode_record(row: &AnyRow, shape: RecordShape) -> Result<Record> {
    Ok(match shape {
        RecordShape::Big => Record::Full(PersonRecord {
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            address: row.try_get("address")?,
            age: row.try_get("age")?,
            client_id: row.try_get("client_id")?,
        }),
        RecordShape::Small => Record::Minimal(ValueRecord {
            value: row.try_get("value")?,
            client_id: row.try_get("client_id")?,
        }),
    })
}

fn digest_keyword(class: OperationClass) -> &'static str {
    match class {
        OperationClass::Insert => "INSERT",
        OperationClass::Find => "SELECT",
        OperationClass::Update => "UPDATE",
        OperationClass::Delete => "DELETE",
    }
}

/// `LIKE` patterns selecting the statement digests of one class on `table`.
fn digest_patterns(class: OperationClass, table: &str) -> [String; 2] {
    [
        format!("{}%", digest_keyword(class)),
        format!("%{}%", table),
    ]
}

#[async_trait]
impl Profiler for SqlRepository {
    async fn reset_profiling(&self) -> bool {
        if self.shared.dialect != SqlDialect::MySql {
            return false;
        }
        let statements = [
            "TRUNCATE TABLE performance_schema.events_statements_summary_by_digest",
            "TRUNCATE TABLE performance_schema.events_statements_history",
        ];
        for statement in statements {
            if let Err(e) = self.executor().submit_execute(statement, Vec::new()).await {
                tracing::warn!(error = %e, "could not reset performance_schema");
                return false;
            }
        }
        true
    }

    async fn profiled_time(&self, class: OperationClass) -> Option<Duration> {
        let rows = self
            .executor()
            .submit(
                "SELECT CAST(SUM(SUM_TIMER_WAIT) AS DOUBLE) \
                 FROM performance_schema.events_statements_summary_by_digest \
                 WHERE DIGEST_TEXT LIKE ? AND DIGEST_TEXT LIKE ?",
                digest_patterns(class, &self.table)
                    .into_iter()
                    .map(SqlValue::from)
                    .collect(),
            )
            .await;

        let picoseconds = match rows {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.try_get::<Option<f64>, _>(0).ok())
                .flatten(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read statement timings");
                None
            }
        }?;
        Some(Duration::from_secs_f64(picoseconds / 1e12))
    }
}

#[async_trait]
impl IndexCreator for SqlRepository {
    async fn create_foreign_key_index(&self) -> bool {
        match self.ensure_client_index().await {
            Ok(created) => {
                tracing::info!(table = %self.table, created, "client id index ready");
                true
            }
            Err(e) => {
                tracing::error!(table = %self.table, error = %e, "index creation failed");
                false
            }
        }
    }
}

#[async_trait]
impl Repository for SqlRepository {
    fn target_name(&self) -> &str {
        &self.table
    }

    fn record_shape(&self) -> RecordShape {
        self.shared.shape
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.executor()
            .submit_execute(self.create_table_sql(), Vec::new())
            .await?;
        Ok(())
    }

    async fn create_bulk(&self, records: &[Record]) -> Timed<u64> {
        let sql = self.insert_sql();
        let slices = split_params(records, self.executor().max_workers());
        let (executor, sql, slices) = (self.executor(), &sql, &slices);

        let result = profile(self, &self.shared.retry, OperationClass::Insert, move || async move {
            let tasks = slices
                .iter()
                .map(|rows| executor.submit_many(sql.as_str(), rows.clone()));
            let counts = join_all(tasks).await?;
            Ok(counts.into_iter().sum::<u64>())
        })
        .await;
        Timed::settle(result, &self.table, OperationClass::Insert)
    }

    async fn fetch_all(&self, client_id: i64) -> Timed<Vec<Record>> {
        let sql = self.select_sql();
        let (executor, sql, shape) = (self.executor(), &sql, self.shared.shape);

        let result = profile(self, &self.shared.retry, OperationClass::Find, move || async move {
            executor
                .submit(sql.as_str(), vec![SqlValue::Int(client_id)])
                .await
        })
        .await
        .and_then(|timed| {
            timed.try_map(|rows| {
                rows.iter()
                    .map(|row| decode_record(row, shape))
                    .collect::<Result<Vec<_>>>()
            })
        });
        Timed::settle(result, &self.table, OperationClass::Find)
    }

    async fn update_all(&self, client_id: i64, shape: RecordShape) -> Timed<u64> {
        let sql = match shape {
            RecordShape::Small => {
                format!("UPDATE {} SET value = value + 1 WHERE client_id = ?", self.table)
            }
            RecordShape::Big => format!(
                "UPDATE {} SET age = 30, first_name = 'test_name' WHERE client_id = ?",
                self.table
            ),
        };
        let (executor, sql) = (self.executor(), &sql);

        let result = profile(self, &self.shared.retry, OperationClass::Update, move || async move {
            executor
                .submit_execute(sql.as_str(), vec![SqlValue::Int(client_id)])
                .await
        })
        .await;
        Timed::settle(result, &self.table, OperationClass::Update)
    }

    async fn delete_all(&self, client_id: i64) -> Timed<u64> {
        let sql = format!("DELETE FROM {} WHERE client_id = ?", self.table);
        let (executor, sql) = (self.executor(), &sql);

        let result = profile(self, &self.shared.retry, OperationClass::Delete, move || async move {
            executor
                .submit_execute(sql.as_str(), vec![SqlValue::Int(client_id)])
                .await
        })
        .await;
        Timed::settle(result, &self.table, OperationClass::Delete)
    }

    async fn clear(&self) -> bool {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table);
        match self.executor().submit_execute(sql, Vec::new()).await {
            Ok(_) => {
                tracing::debug!(table = %self.table, "dropped table");
                true
            }
            Err(e) => {
                tracing::error!(table = %self.table, error = %e, "failed to drop table");
                false
            }
        }
    }

    async fn drop_targets_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dropped = Vec::new();
        for table in self.list_tables().await? {
            if !table.starts_with(prefix) || validate_identifier(&table).is_err() {
                continue;
            }
            self.executor()
                .submit_execute(format!("DROP TABLE IF EXISTS {}", table), Vec::new())
                .await?;
            tracing::info!(table = %table, "dropped table");
            dropped.push(table);
        }
        Ok(dropped)
    }

    async fn close(&self) {
        tracing::debug!(table = %self.table, "released repository");
    }
}
