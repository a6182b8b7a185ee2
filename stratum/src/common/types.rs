//! Common type alias

/// Degree of the parallelism
pub type ParallelismDegree = std::num::NonZeroU16;

/// Result type of the hash function
pub type HashValue = u64;
