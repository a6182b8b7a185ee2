//! Metrics of the aggregation
//!
//! Metrics are updated concurrently by the workers, so all of them are atomic. Use
//! `#[derive(MetricsSetBuilder)]` on a struct of metrics to take a snapshot of them

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

/// Measure a potentially non contiguous duration of time, in nanoseconds
#[derive(Debug)]
pub struct Time(AtomicU64);

impl Time {
    /// Create a new [`Time`]
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Add duration to the time metric
    #[inline]
    pub fn add_duration(&self, duration: Duration) {
        self.0.fetch_add(duration.as_nanos() as _, Relaxed);
    }

    /// Get the number of nanoseconds
    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

impl Default for Time {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Counter
#[derive(Debug)]
pub struct Count(AtomicU64);

impl Count {
    /// Create a new [`Count`]
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Add `n` to the counter
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Relaxed);
    }

    /// Get the count
    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

impl Default for Count {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a single metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    /// Nanoseconds
    Time(u64),
    /// Count
    Count(u64),
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Time(nanos) => write!(f, "{:?}", Duration::from_nanos(*nanos)),
            Self::Count(count) => write!(f, "{}", count),
        }
    }
}

/// Snapshot of a set of metrics
#[derive(Debug, Clone)]
pub struct MetricsSet {
    /// Name of the set
    pub name: &'static str,
    /// Metrics keyed by their name
    pub metrics: BTreeMap<&'static str, MetricValue>,
}

impl Display for MetricsSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.name)?;
        f.debug_map()
            .entries(
                self.metrics
                    .iter()
                    .map(|(name, value)| (name, value.to_string())),
            )
            .finish()
    }
}
