//! Destinations for finished benchmark results.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::index::IndexKind;
use crate::result::{ClientTiming, OperationResult};

/// Receives results once every iteration of an index type has finished.
pub trait ResultSink: Send {
    /// Publish every result of one index type.
    fn publish_results(&mut self, index: IndexKind, results: &[OperationResult]) -> Result<()>;

    /// Publish per-client timings of one backend for one index type.
    fn publish_client_comparison(
        &mut self,
        backend: &str,
        index: IndexKind,
        timings: &[ClientTiming],
    ) -> Result<()>;
}

/// Logs a summary table through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn publish_results(&mut self, index: IndexKind, results: &[OperationResult]) -> Result<()> {
        tracing::info!(index = %index, results = results.len(), "benchmark results");
        for r in results {
            tracing::info!(
                database = %r.database,
                operation = %r.operation,
                iteration = r.iteration,
                records = r.records,
                time_ms = format_args!("{:.3}", r.time),
                timing = %r.timing_method,
                "result"
            );
        }

        // Mean per backend and operation across iterations.
        let mut means: BTreeMap<(&str, &str), (f64, usize)> = BTreeMap::new();
        for r in results {
            let entry = means
                .entry((r.database.as_str(), r.operation.as_str()))
                .or_insert((0.0, 0));
            entry.0 += r.time;
            entry.1 += 1;
        }
        for ((database, operation), (total, count)) in means {
            tracing::info!(
                database,
                operation,
                iterations = count,
                mean_ms = format_args!("{:.3}", total / count as f64),
                "average"
            );
        }
        Ok(())
    }

    fn publish_client_comparison(
        &mut self,
        backend: &str,
        index: IndexKind,
        timings: &[ClientTiming],
    ) -> Result<()> {
        for t in timings {
            tracing::info!(
                backend,
                index = %index,
                client = t.client_id,
                operation = %t.operation,
                iteration = t.iteration,
                records = t.records,
                time_ms = format_args!("{:.3}", t.time),
                "client timing"
            );
        }
        Ok(())
    }
}

/// Writes results as JSON files under a timestamped run directory.
///
/// Layout: `<dir>/results_<timestamp>/<index>/results.json` and
/// `<dir>/results_<timestamp>/<index>/clients_<backend>.json`.
#[derive(Debug, Clone)]
pub struct JsonResultSink {
    root: PathBuf,
}

impl JsonResultSink {
    /// Create a sink writing under a new `results_<timestamp>` directory in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        Self::at(dir.as_ref().join(format!("results_{}", stamp)))
    }

    /// Create a sink writing directly into `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_dir(&self, index: IndexKind) -> Result<PathBuf> {
        let dir = self.root.join(index.as_str());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl ResultSink for JsonResultSink {
    fn publish_results(&mut self, index: IndexKind, results: &[OperationResult]) -> Result<()> {
        let path = self.index_dir(index)?.join("results.json");
        fs::write(&path, serde_json::to_vec_pretty(results)?)?;
        tracing::info!(path = %path.display(), "wrote results");
        Ok(())
    }

    fn publish_client_comparison(
        &mut self,
        backend: &str,
        index: IndexKind,
        timings: &[ClientTiming],
    ) -> Result<()> {
        let name = format!("clients_{}.json", backend.to_lowercase());
        let path = self.index_dir(index)?.join(name);
        fs::write(&path, serde_json::to_vec_pretty(timings)?)?;
        tracing::debug!(path = %path.display(), "wrote client comparison");
        Ok(())
    }
}

/// Published client timings of one backend and index type.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientComparison {
    pub backend: String,
    pub index: IndexKind,
    pub timings: Vec<ClientTiming>,
}

#[derive(Debug, Default)]
struct Collected {
    results: Vec<(IndexKind, Vec<OperationResult>)>,
    clients: Vec<ClientComparison>,
}

/// Keeps everything in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Collected>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every published result, in publication order.
    pub fn results(&self) -> Vec<OperationResult> {
        self.inner
            .lock()
            .results
            .iter()
            .flat_map(|(_, r)| r.iter().cloned())
            .collect()
    }

    /// Index types in publication order.
    pub fn published_indexes(&self) -> Vec<IndexKind> {
        self.inner.lock().results.iter().map(|(i, _)| *i).collect()
    }

    pub fn client_comparisons(&self) -> Vec<ClientComparison> {
        self.inner.lock().clients.clone()
    }
}

impl ResultSink for MemorySink {
    fn publish_results(&mut self, index: IndexKind, results: &[OperationResult]) -> Result<()> {
        self.inner.lock().results.push((index, results.to_vec()));
        Ok(())
    }

    fn publish_client_comparison(
        &mut self,
        backend: &str,
        index: IndexKind,
        timings: &[ClientTiming],
    ) -> Result<()> {
        self.inner.lock().clients.push(ClientComparison {
            backend: backend.to_string(),
            index,
            timings: timings.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::OperationName;
    use crate::timing::TimingMethod;
    use chrono::Utc;

    fn result(database: &str, iteration: u32) -> OperationResult {
        OperationResult {
            database: database.to_string(),
            operation: OperationName::Insert,
            records: 10,
            time: 1.5,
            timestamp: Utc::now(),
            timing_method: TimingMethod::Database,
            indexes_type: IndexKind::NoIndexes,
            threads: 1,
            iteration,
        }
    }

    fn timing(client_id: i64) -> ClientTiming {
        ClientTiming {
            client_id,
            operation: OperationName::FetchAll,
            records: 5,
            time: 0.25,
            iteration: 1,
        }
    }

    #[test]
    fn test_json_sink_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonResultSink::at(dir.path().join("run"));

        sink.publish_results(IndexKind::ForeignKey, &[result("MySQL", 1)])
            .unwrap();
        sink.publish_client_comparison("MySQL", IndexKind::ForeignKey, &[timing(0), timing(1)])
            .unwrap();

        let index_dir = dir.path().join("run").join("foreign_key");
        let results: serde_json::Value =
            serde_json::from_slice(&fs::read(index_dir.join("results.json")).unwrap()).unwrap();
        assert_eq!(results.as_array().unwrap().len(), 1);
        assert_eq!(results[0]["database"], "MySQL");

        let clients: serde_json::Value =
            serde_json::from_slice(&fs::read(index_dir.join("clients_mysql.json")).unwrap())
                .unwrap();
        assert_eq!(clients[1]["client_id"], 1);
    }

    #[test]
    fn test_json_sink_timestamped_root() {
        let sink = JsonResultSink::new("results");
        let name = sink.root().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("results_"));
    }

    #[test]
    fn test_memory_sink_shares_storage() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();

        handle
            .publish_results(IndexKind::NoIndexes, &[result("MongoDB", 1), result("MongoDB", 2)])
            .unwrap();
        handle
            .publish_client_comparison("MongoDB", IndexKind::NoIndexes, &[timing(0)])
            .unwrap();

        assert_eq!(sink.results().len(), 2);
        assert_eq!(sink.published_indexes(), vec![IndexKind::NoIndexes]);
        assert_eq!(sink.client_comparisons()[0].backend, "MongoDB");
    }

    #[test]
    fn test_log_sink_accepts_results() {
        let mut sink = LogSink;
        assert!(sink
            .publish_results(IndexKind::NoIndexes, &[result("MySQL", 1)])
            .is_ok());
        assert!(sink
            .publish_client_comparison("MySQL", IndexKind::NoIndexes, &[timing(0)])
            .is_ok());
    }
}
