//! Index kinds benchmarked by the runner.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// A concrete index configuration applied to a benchmark target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// No secondary index.
    NoIndexes,
    /// Secondary index on the client id field.
    ForeignKey,
}

impl IndexKind {
    /// Every recognized kind, in run order.
    pub const ALL: [IndexKind; 2] = [IndexKind::NoIndexes, IndexKind::ForeignKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::NoIndexes => "no_indexes",
            IndexKind::ForeignKey => "foreign_key",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no_indexes" => Ok(IndexKind::NoIndexes),
            "foreign_key" => Ok(IndexKind::ForeignKey),
            other => Err(Error::Config(format!("unknown index type: {}", other))),
        }
    }
}

/// Index selector as given on the command line: one kind, or `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSelection {
    All,
    Only(IndexKind),
}

impl IndexSelection {
    /// Expand the selector into the kinds to run. `all` never appears in the output.
    pub fn kinds(&self) -> Vec<IndexKind> {
        match self {
            IndexSelection::All => IndexKind::ALL.to_vec(),
            IndexSelection::Only(kind) => vec![*kind],
        }
    }
}

impl Default for IndexSelection {
    fn default() -> Self {
        IndexSelection::All
    }
}

impl fmt::Display for IndexSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSelection::All => f.write_str("all"),
            IndexSelection::Only(kind) => kind.fmt(f),
        }
    }
}

impl FromStr for IndexSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(IndexSelection::All)
        } else {
            s.parse().map(IndexSelection::Only)
        }
    }
}
