//! Backend-agnostic repository and backend contracts.

use async_trait::async_trait;

use crate::error::Result;
use crate::index::IndexKind;
use crate::record::{Record, RecordShape};
use crate::timing::Timed;

/// Index kinds a backend knows how to build.
#[async_trait]
pub trait IndexCreator: Send + Sync {
    /// Create the secondary index on the client id field if it does not exist.
    async fn create_foreign_key_index(&self) -> bool;
}

/// CRUD access to one table or collection.
///
/// Benchmarked calls never fail: after retries are exhausted they log the
/// error and return a zero value with [`TimingMethod::Unmeasured`](crate::TimingMethod).
#[async_trait]
pub trait Repository: IndexCreator {
    /// Table or collection this repository is bound to.
    fn target_name(&self) -> &str;

    fn record_shape(&self) -> RecordShape;

    /// Create the backing table or collection if missing.
    async fn ensure_schema(&self) -> Result<()>;

    /// Ordered bulk insert. Returns the number of inserted records.
    async fn create_bulk(&self, records: &[Record]) -> Timed<u64>;

    /// Every record owned by one client.
    async fn fetch_all(&self, client_id: i64) -> Timed<Vec<Record>>;

    /// Apply the shape's fixed mutation to every record of one client.
    async fn update_all(&self, client_id: i64, shape: RecordShape) -> Timed<u64>;

    /// Remove every record of one client.
    async fn delete_all(&self, client_id: i64) -> Timed<u64>;

    /// Drop the backing target. Succeeds when it is already absent.
    async fn clear(&self) -> bool;

    /// Create an index of the given kind on the backing target.
    async fn create_index(&self, kind: IndexKind) -> bool {
        match kind {
            IndexKind::ForeignKey => self.create_foreign_key_index().await,
            IndexKind::NoIndexes => {
                tracing::warn!(
                    name = self.target_name(),
                    kind = %kind,
                    "index kind creates no index"
                );
                false
            }
        }
    }

    /// Drop every table or collection whose name starts with `prefix`.
    async fn drop_targets_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Release resources held by this repository.
    async fn close(&self);
}

/// A benchmarked data store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Display name used in results.
    fn name(&self) -> &str;

    /// Base table or collection name.
    fn base_target_name(&self) -> &str;

    /// Target scoped to one index type and iteration.
    fn target_name(&self, index: IndexKind, iteration: u32) -> String {
        format!("{}_test_{}_iter_{}", self.base_target_name(), index, iteration)
    }

    async fn open_repository(&self, target: &str) -> Result<Box<dyn Repository>>;

    /// Release connections held by the backend.
    async fn close(&self);
}
