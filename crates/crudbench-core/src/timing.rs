//! Operation timing and backend profiling.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// How an elapsed time was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMethod {
    /// Reported by the backend's own profiler.
    Database,
    /// Measured around the client call.
    WallClock,
    /// Aggregate of profiled and wall-clock calls.
    Mixed,
    /// Nothing was measured because every call failed.
    Unmeasured,
}

impl TimingMethod {
    /// Merge the methods of two aggregated calls.
    pub fn combine(self, other: TimingMethod) -> TimingMethod {
        match (self, other) {
            (TimingMethod::Unmeasured, m) | (m, TimingMethod::Unmeasured) => m,
            (a, b) if a == b => a,
            _ => TimingMethod::Mixed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimingMethod::Database => "database",
            TimingMethod::WallClock => "wall_clock",
            TimingMethod::Mixed => "mixed",
            TimingMethod::Unmeasured => "unmeasured",
        }
    }
}

impl fmt::Display for TimingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation class used to look up profiled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Insert,
    Find,
    Update,
    Delete,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Insert => "insert",
            OperationClass::Find => "find",
            OperationClass::Update => "update",
            OperationClass::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationClass {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(OperationClass::Insert),
            "find" => Ok(OperationClass::Find),
            "update" => Ok(OperationClass::Update),
            "delete" => Ok(OperationClass::Delete),
            other => Err(Error::Config(format!(
                "operation class must be one of insert, find, update, delete, got {}",
                other
            ))),
        }
    }
}

/// A value together with the time it took to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    pub value: T,
    pub elapsed: Duration,
    pub method: TimingMethod,
}

impl<T> Timed<T> {
    pub fn new(value: T, elapsed: Duration, method: TimingMethod) -> Self {
        Self {
            value,
            elapsed,
            method,
        }
    }

    /// Zero-valued result for a call that failed.
    pub fn unmeasured(value: T) -> Self {
        Self::new(value, Duration::ZERO, TimingMethod::Unmeasured)
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / 1_000_000.0
    }

    /// Convert the value after timing, keeping the measured time.
    pub fn try_map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<Timed<U>> {
        Ok(Timed::new(f(self.value)?, self.elapsed, self.method))
    }
}

impl<T: Default> Timed<T> {
    pub fn zero() -> Self {
        Self::unmeasured(T::default())
    }

    /// Turn a failed benchmarked call into a zero result.
    pub fn settle(result: Result<Timed<T>>, name: &str, class: OperationClass) -> Self {
        result.unwrap_or_else(|e| {
            tracing::error!(
                name,
                class = %class,
                error = %e,
                "operation failed, recording zero result"
            );
            Self::zero()
        })
    }
}

/// Backend-side execution time source.
#[async_trait]
pub trait Profiler: Send + Sync {
    /// Discard previously recorded profiling data. Returns false when
    /// profiling is unavailable.
    async fn reset_profiling(&self) -> bool;

    /// Time the backend recorded for the latest operation of `class`.
    async fn profiled_time(&self, class: OperationClass) -> Option<Duration>;
}

/// Run one benchmarked operation under retry and time it.
///
/// Profiling is reset before each attempt. The backend-reported time is used
/// when available and the wall-clock time of the successful attempt otherwise.
pub async fn profile<P, T, F, Fut>(
    profiler: &P,
    retry: &RetryPolicy,
    class: OperationClass,
    operation: F,
) -> Result<Timed<T>>
where
    P: Profiler + ?Sized,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let operation = &operation;
    let (value, wall, profiling) = retry
        .run(class.as_str(), move || async move {
            let profiling = profiler.reset_profiling().await;
            let start = Instant::now();
            let value = operation().await?;
            Ok::<_, Error>((value, start.elapsed(), profiling))
        })
        .await?;

    if profiling {
        if let Some(elapsed) = profiler.profiled_time(class).await {
            return Ok(Timed::new(value, elapsed, TimingMethod::Database));
        }
        tracing::debug!(class = %class, "no profiler entry, using wall-clock time");
    }
    Ok(Timed::new(value, wall, TimingMethod::WallClock))
}
