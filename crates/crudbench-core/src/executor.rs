//! Bounded worker pool that runs statements on pooled connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::pool::{ConnectionFactory, ConnectionPool, ManagedConnection, PooledConnection};

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Null,
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

/// A connection that can run statements.
#[async_trait]
pub trait QueryConnection: ManagedConnection {
    /// Row type returned by queries.
    type Row: Send + 'static;

    /// Run a query and return every row.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Self::Row>>;

    /// Run a statement and return the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run one statement per parameter set in a single transaction.
    async fn execute_many(&mut self, sql: &str, batch: &[Vec<SqlValue>]) -> Result<u64>;

    /// Flag the session as unusable so the pool discards it.
    fn mark_broken(&mut self);
}

type RowOf<F> = <<F as ConnectionFactory>::Connection as QueryConnection>::Row;

/// Handle to a submitted statement.
///
/// Resolves to the statement result, or to [`Error::Worker`] if the task
/// panicked.
pub struct QueryTask<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> Future for QueryTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.map_err(Error::from).and_then(|r| r))
    }
}

/// Wait for every task, then return the first error in submission order.
///
/// No task is still running when an error is returned.
pub async fn join_all<T>(tasks: impl IntoIterator<Item = QueryTask<T>>) -> Result<Vec<T>> {
    futures::future::join_all(tasks).await.into_iter().collect()
}

/// Tracks submitted tasks that have not finished yet.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Runs statements on at most `max_workers` pooled connections at a time.
///
/// Submissions past the worker limit queue on the semaphore; the queue has no
/// depth limit.
pub struct QueryExecutor<F: ConnectionFactory>
where
    F::Connection: QueryConnection,
{
    pool: ConnectionPool<F>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> QueryExecutor<F>
where
    F::Connection: QueryConnection,
{
    /// Create an executor with one worker per pooled connection.
    pub fn new(pool: ConnectionPool<F>) -> Self {
        let max_workers = pool.capacity();
        Self::with_workers(pool, max_workers)
    }

    pub fn with_workers(pool: ConnectionPool<F>, max_workers: usize) -> Self {
        let max_workers = max_workers.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            pool,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            in_flight: Arc::new(InFlight::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Submitted tasks that have not completed.
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Submit a query returning rows.
    pub fn submit(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> QueryTask<Vec<RowOf<F>>> {
        let sql = sql.into();
        self.spawn(move |mut conn| async move {
            let result = match conn.connection_mut() {
                Ok(c) => c.query(&sql, &params).await,
                Err(e) => Err(e),
            };
            finish(conn, result).await
        })
    }

    /// Submit a single statement returning the affected row count.
    pub fn submit_execute(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> QueryTask<u64> {
        let sql = sql.into();
        self.spawn(move |mut conn| async move {
            let result = match conn.connection_mut() {
                Ok(c) => c.execute(&sql, &params).await,
                Err(e) => Err(e),
            };
            finish(conn, result).await
        })
    }

    /// Submit a statement executed once per parameter set on one connection.
    pub fn submit_many(
        &self,
        sql: impl Into<String>,
        batch: Vec<Vec<SqlValue>>,
    ) -> QueryTask<u64> {
        let sql = sql.into();
        self.spawn(move |mut conn| async move {
            let result = match conn.connection_mut() {
                Ok(c) => c.execute_many(&sql, &batch).await,
                Err(e) => Err(e),
            };
            finish(conn, result).await
        })
    }

    fn spawn<T, J, Fut>(&self, job: J) -> QueryTask<T>
    where
        T: Send + 'static,
        J: FnOnce(PooledConnection<F>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_shutdown() {
            return QueryTask {
                handle: tokio::spawn(async { Err(Error::ExecutorShutdown) }),
            };
        }

        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(self.in_flight.clone());
        let workers = self.workers.clone();
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| Error::ExecutorShutdown)?;
            let conn = pool.checkout().await?;
            job(conn).await
        });
        QueryTask { handle }
    }

    /// Stop accepting work, wait for every submitted task to finish and close
    /// idle connections.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let drained = self.in_flight.drained.notified();
            if self.pending() == 0 {
                break;
            }
            drained.await;
        }
        tracing::debug!(workers = self.max_workers, "query executor drained");
        self.pool.close_all().await;
    }
}

/// Release the connection after a statement, discarding it if the session broke.
async fn finish<F, T>(mut conn: PooledConnection<F>, result: Result<T>) -> Result<T>
where
    F: ConnectionFactory,
    F::Connection: QueryConnection,
{
    if let Err(e) = &result {
        if e.is_connection_lost() {
            tracing::warn!(error = %e, "discarding broken connection");
            if let Ok(c) = conn.connection_mut() {
                c.mark_broken();
            }
        }
    }
    conn.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Stats {
        running: AtomicUsize,
        peak: AtomicUsize,
        executed: AtomicUsize,
    }

    struct FakeConnection {
        live: bool,
        stats: Arc<Stats>,
    }

    impl FakeConnection {
        async fn work(&self) {
            let now = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.stats.running.fetch_sub(1, Ordering::SeqCst);
            self.stats.executed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ManagedConnection for FakeConnection {
        fn is_connected(&self) -> bool {
            self.live
        }

        async fn close(self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl QueryConnection for FakeConnection {
        type Row = i64;

        async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>> {
            self.work().await;
            if sql == "BROKEN" {
                return Err(Error::Connection("socket closed".to_string()));
            }
            Ok(params
                .iter()
                .filter_map(|p| match p {
                    SqlValue::Int(v) => Some(*v),
                    _ => None,
                })
                .collect())
        }

        async fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<u64> {
            self.work().await;
            Ok(1)
        }

        async fn execute_many(&mut self, _sql: &str, batch: &[Vec<SqlValue>]) -> Result<u64> {
            self.work().await;
            Ok(batch.len() as u64)
        }

        fn mark_broken(&mut self) {
            self.live = false;
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        stats: Arc<Stats>,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        async fn connect(&self) -> Result<FakeConnection> {
            Ok(FakeConnection {
                live: true,
                stats: self.stats.clone(),
            })
        }
    }

    fn executor(pool_size: usize, workers: usize) -> QueryExecutor<FakeFactory> {
        QueryExecutor::with_workers(ConnectionPool::new(FakeFactory::default(), pool_size), workers)
    }

    #[tokio::test]
    async fn test_submit_returns_rows() {
        let executor = executor(2, 2);
        let rows = executor
            .submit("SELECT", vec![SqlValue::Int(4), SqlValue::Null, SqlValue::Int(9)])
            .await
            .unwrap();
        assert_eq!(rows, vec![4, 9]);
        assert_eq!(executor.pool().checked_out(), 0);
        assert_eq!(executor.pool().idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_submit_many_counts_rows() {
        let executor = executor(2, 2);
        let batch = vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)], vec![SqlValue::Int(3)]];
        assert_eq!(executor.submit_many("INSERT", batch).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_workers_bound_concurrency() {
        let executor = executor(8, 2);
        let tasks: Vec<_> = (0..6)
            .map(|_| executor.submit_execute("UPDATE", Vec::new()))
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }

        let stats = &executor.pool().factory().stats;
        assert_eq!(stats.executed.load(Ordering::SeqCst), 6);
        assert!(stats.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let executor = executor(2, 1);
        let err = executor.submit("BROKEN", Vec::new()).await.unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(executor.pool().idle_connections(), 0);
        assert_eq!(executor.pool().checked_out(), 0);
    }

    #[tokio::test]
    async fn test_join_all_waits_for_every_task_on_error() {
        let executor = executor(2, 1);
        let mut tasks = vec![executor.submit("BROKEN", Vec::new())];
        tasks.extend((0..3).map(|i| executor.submit("SELECT", vec![SqlValue::Int(i)])));

        let err = join_all(tasks).await.unwrap_err();
        assert!(err.is_connection_lost());
        // Every statement finished before the error was returned.
        assert_eq!(
            executor.pool().factory().stats.executed.load(Ordering::SeqCst),
            4
        );
        assert_eq!(executor.pending(), 0);
        assert_eq!(executor.pool().checked_out(), 0);
    }

    #[tokio::test]
    async fn test_join_all_keeps_submission_order() {
        let executor = executor(4, 4);
        let tasks = (0..4).map(|i| executor.submit("SELECT", vec![SqlValue::Int(i)]));
        let rows = join_all(tasks).await.unwrap();
        assert_eq!(rows, vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let executor = executor(2, 2);
        let pending: Vec<_> = (0..4)
            .map(|_| executor.submit_execute("DELETE", Vec::new()))
            .collect();

        executor.shutdown().await;
        assert!(executor.is_shutdown());
        assert_eq!(
            executor.pool().factory().stats.executed.load(Ordering::SeqCst),
            4
        );
        for task in pending {
            assert_eq!(task.await.unwrap(), 1);
        }

        let err = executor.submit_execute("DELETE", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::ExecutorShutdown));
    }
}
