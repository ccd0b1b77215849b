//! Benchmark error types.

use thiserror::Error;

/// Benchmark errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// Relational backend error.
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Document backend error.
    #[error("document store error: {0}")]
    Document(#[from] mongodb::error::Error),

    /// Invalid configuration or selector value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Work was submitted after the executor shut down.
    #[error("query executor is shut down")]
    ExecutorShutdown,

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Worker(String),

    /// A tester phase was requested out of order.
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A fetched row or document did not match the record shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Filesystem error while writing results.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Result serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error means the underlying session is no longer usable.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Sql(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Worker(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
