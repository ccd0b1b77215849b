//! Benchmark record types and datasets.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// Which record layout a run inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    /// Full personal record with names, email, address and age.
    Big,
    /// Minimal numeric record.
    Small,
}

impl RecordShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordShape::Big => "big",
            RecordShape::Small => "small",
        }
    }
}

impl Default for RecordShape {
    fn default() -> Self {
        RecordShape::Big
    }
}

impl fmt::Display for RecordShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "big" => Ok(RecordShape::Big),
            "small" => Ok(RecordShape::Small),
            other => Err(Error::Config(format!("unknown record type: {}", other))),
        }
    }
}

/// A full personal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonRecord {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub address: String,
    pub age: i64,
    pub client_id: i64,
}

/// A minimal numeric record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValueRecord {
    pub value: i64,
    pub client_id: i64,
}

/// One generated or fetched record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Full(PersonRecord),
    Minimal(ValueRecord),
}

impl Record {
    /// The simulated client owning this record.
    pub fn client_id(&self) -> i64 {
        match self {
            Record::Full(r) => r.client_id,
            Record::Minimal(r) => r.client_id,
        }
    }

    /// Copy of this record owned by another client.
    pub fn with_client_id(&self, client_id: i64) -> Record {
        match self {
            Record::Full(r) => Record::Full(PersonRecord {
                client_id,
                ..r.clone()
            }),
            Record::Minimal(r) => Record::Minimal(ValueRecord { client_id, ..*r }),
        }
    }
}

/// The records generated for one iteration, ordered by client.
///
/// Shared between backends as `Arc<Dataset>` so every backend of an
/// iteration benchmarks the same records.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub shape: RecordShape,
    pub clients: usize,
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn new(shape: RecordShape, clients: usize, records: Vec<Record>) -> Self {
        Self {
            shape,
            clients,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert chunks of `min(max_batch_size, len)` records, in dataset order.
    pub fn chunks(&self, max_batch_size: usize) -> std::slice::Chunks<'_, Record> {
        let size = max_batch_size.min(self.records.len()).max(1);
        self.records.chunks(size)
    }

    /// Number of records owned by one client.
    pub fn count_for(&self, client_id: i64) -> usize {
        self.records
            .iter()
            .filter(|r| r.client_id() == client_id)
            .count()
    }
}
