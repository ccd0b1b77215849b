//! Benchmark result records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::index::IndexKind;
use crate::timing::TimingMethod;

/// Benchmarked phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationName {
    Insert,
    FetchAll,
    Update,
    Delete,
}

impl OperationName {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationName::Insert => "Insert",
            OperationName::FetchAll => "FetchAll",
            OperationName::Update => "Update",
            OperationName::Delete => "Delete",
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed phase of one backend in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub database: String,
    pub operation: OperationName,
    /// Records in the iteration's dataset.
    pub records: u64,
    /// Elapsed time in milliseconds.
    pub time: f64,
    pub timestamp: DateTime<Utc>,
    pub timing_method: TimingMethod,
    pub indexes_type: IndexKind,
    /// Simulated client count.
    pub threads: usize,
    pub iteration: u32,
}

/// Per-client timing used for cross-client comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientTiming {
    pub client_id: i64,
    pub operation: OperationName,
    /// Records the call returned or affected.
    pub records: u64,
    /// Elapsed time in milliseconds.
    pub time: f64,
    pub iteration: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_expected_fields() {
        let result = OperationResult {
            database: "MySQL".to_string(),
            operation: OperationName::FetchAll,
            records: 100,
            time: 12.5,
            timestamp: Utc::now(),
            timing_method: TimingMethod::WallClock,
            indexes_type: IndexKind::ForeignKey,
            threads: 2,
            iteration: 1,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["database"], "MySQL");
        assert_eq!(json["operation"], "FetchAll");
        assert_eq!(json["timing_method"], "wall_clock");
        assert_eq!(json["indexes_type"], "foreign_key");
        assert_eq!(json["threads"], 2);
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
