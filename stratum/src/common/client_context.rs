//! [`ClientContext`] holds the information relevant to the current client session during
//! the query

use super::types::ParallelismDegree;
use super::uuid::QueryId;

/// Default number of tuples checked in the first bloom filter batch
pub const DEFAULT_BLOOM_FILTER_BATCH_SIZE: usize = 64;

/// Holds the information relevant to the current client session
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Query id
    pub query_id: QueryId,
    /// Execution args
    pub exec_args: ExecArgs,
}

impl ClientContext {
    /// Create a new [`ClientContext`]
    #[inline]
    pub fn new(query_id: QueryId, exec_args: ExecArgs) -> Self {
        Self {
            query_id,
            exec_args,
        }
    }
}

/// Arguments for execution
#[derive(Debug, Clone)]
pub struct ExecArgs {
    /// Execution parallelism, the expected number of workers that aggregate blocks
    /// concurrently
    pub parallelism: ParallelismDegree,
    /// Number of tuples checked in the first bloom filter batch of a block. Each
    /// following batch doubles the size
    pub bloom_filter_batch_size: usize,
}

impl ExecArgs {
    /// Create [`ExecArgs`] with the default bloom filter batch size
    #[inline]
    pub fn new(parallelism: ParallelismDegree) -> Self {
        Self {
            parallelism,
            bloom_filter_batch_size: DEFAULT_BLOOM_FILTER_BATCH_SIZE,
        }
    }
}
