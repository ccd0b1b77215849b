//! Connection pooling for benchmarked backends.
//!
//! The pool never makes a caller wait for capacity: once `pool_size`
//! connections are checked out, further checkouts get an unpooled overflow
//! connection and a warning is logged.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A live backend session that can be pooled.
#[async_trait]
pub trait ManagedConnection: Send + 'static {
    /// Whether the session can still serve queries.
    fn is_connected(&self) -> bool;

    /// Close the session.
    async fn close(self) -> Result<()>;
}

/// Creates new backend sessions for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced by this factory.
    type Connection: ManagedConnection;

    /// Open a new session.
    async fn connect(&self) -> Result<Self::Connection>;
}

/// A checked-out connection that goes back to the pool when released or dropped.
pub struct PooledConnection<F: ConnectionFactory> {
    connection: Option<F::Connection>,
    counted: bool,
    pool: Arc<ConnectionPoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Borrow the underlying connection.
    pub fn connection(&self) -> Result<&F::Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::Connection("connection already released".to_string()))
    }

    /// Mutably borrow the underlying connection.
    pub fn connection_mut(&mut self) -> Result<&mut F::Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::Connection("connection already released".to_string()))
    }

    /// Whether this connection was created past capacity and is not counted by the pool.
    pub fn is_overflow(&self) -> bool {
        !self.counted
    }

    /// Check if this connection is still valid.
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Return the connection to the pool, closing it if it cannot be kept.
    pub async fn release(mut self) {
        if let Some(conn) = self.connection.take() {
            if let Some(conn) = self.pool.take_back(conn, self.counted) {
                close_quietly(conn).await;
            }
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            // The idle set is updated synchronously; only the close is deferred.
            if let Some(conn) = self.pool.take_back(conn, self.counted) {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(close_quietly(conn));
                }
            }
        }
    }
}

async fn close_quietly<C: ManagedConnection>(conn: C) {
    match conn.close().await {
        Ok(()) => tracing::debug!("closed connection"),
        Err(e) => tracing::warn!(error = %e, "error closing connection"),
    }
}

struct PoolState<C> {
    idle: Vec<C>,
    /// Pooled connections currently handed out.
    checked_out: usize,
}

/// Internal pool state.
struct ConnectionPoolInner<F: ConnectionFactory> {
    factory: F,
    pool_size: usize,
    state: Mutex<PoolState<F::Connection>>,
}

impl<F: ConnectionFactory> ConnectionPoolInner<F> {
    /// Put a connection back into the idle set, or hand it back to be closed.
    fn take_back(&self, conn: F::Connection, counted: bool) -> Option<F::Connection> {
        let mut state = self.state.lock();
        if counted {
            state.checked_out = state.checked_out.saturating_sub(1);
        }
        if conn.is_connected() && state.idle.len() + state.checked_out < self.pool_size {
            state.idle.push(conn);
            None
        } else {
            Some(conn)
        }
    }

    fn cancel_reservation(&self) {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
    }
}

/// Frees a reserved capacity slot if connection creation does not complete.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPoolInner<F>,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<'_, F> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_reservation();
        }
    }
}

/// A bounded pool of backend connections.
///
/// Cloning the pool is cheap; clones share the same idle set.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<ConnectionPoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create an empty pool. Connections are opened lazily.
    pub fn new(factory: F, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        tracing::info!(pool_size, "initialized connection pool");
        Self {
            inner: Arc::new(ConnectionPoolInner {
                factory,
                pool_size,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    checked_out: 0,
                }),
            }),
        }
    }

    /// Check out a connection.
    ///
    /// Reuses an idle live connection, opens a new pooled one while below
    /// capacity, and otherwise opens an overflow connection. Only a failure
    /// to open a session is reported as an error.
    pub async fn checkout(&self) -> Result<PooledConnection<F>> {
        let (reused, dead, counted) = {
            let mut state = self.inner.state.lock();
            let mut dead = Vec::new();
            let mut reused = None;
            while let Some(conn) = state.idle.pop() {
                if conn.is_connected() {
                    reused = Some(conn);
                    break;
                }
                dead.push(conn);
            }
            let counted = if reused.is_some()
                || state.idle.len() + state.checked_out < self.inner.pool_size
            {
                state.checked_out += 1;
                true
            } else {
                false
            };
            (reused, dead, counted)
        };

        for conn in dead {
            close_quietly(conn).await;
        }

        if let Some(conn) = reused {
            return Ok(PooledConnection {
                connection: Some(conn),
                counted: true,
                pool: self.inner.clone(),
            });
        }

        let reservation = Reservation {
            pool: &self.inner,
            armed: counted,
        };
        if !counted {
            tracing::warn!(
                pool_size = self.inner.pool_size,
                "connection limit reached, opening overflow connection"
            );
        }

        let conn = self.inner.factory.connect().await?;
        reservation.commit();
        tracing::debug!(overflow = !counted, "created new connection");

        Ok(PooledConnection {
            connection: Some(conn),
            counted,
            pool: self.inner.clone(),
        })
    }

    /// Return a connection to the pool. `None` is a no-op.
    pub async fn release(&self, conn: Option<PooledConnection<F>>) {
        if let Some(conn) = conn {
            conn.release().await;
        }
    }

    /// Close every idle connection and empty the idle set.
    ///
    /// Individual close failures are logged and do not stop the sweep.
    pub async fn close_all(&self) {
        let idle = std::mem::take(&mut self.inner.state.lock().idle);
        let count = idle.len();
        for conn in idle {
            close_quietly(conn).await;
        }
        tracing::info!(count, "closed all idle connections");
    }

    /// Get the current number of idle connections.
    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Get the number of pooled connections currently checked out.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().checked_out
    }

    /// Maximum number of pooled connections.
    pub fn capacity(&self) -> usize {
        self.inner.pool_size
    }

    /// The factory used to open new sessions.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("pool_size", &self.inner.pool_size)
            .field("idle", &state.idle.len())
            .field("checked_out", &state.checked_out)
            .finish()
    }
}
