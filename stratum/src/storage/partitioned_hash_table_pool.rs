//! Partitioned group by hash tables of an aggregate
//!
//! Groups are partitioned by the hash of the group by keys, each partition owns a
//! single table shared by all of the workers. Partitions are disjoint, so they are
//! finalized independently without merging

use std::sync::Arc;

use stratum_block::types::Type;
use stratum_block::value::TypedValue;

use crate::common::utils::hash::{combine_hashes, hash_typed_value};
use crate::expressions::aggregation::AggregationHandle;
use crate::storage::hash_table::{AggregationStateHashTable, HashTableImplType};
use crate::storage::storage_manager::StorageManager;

/// Each partition is expected to hold at least this number of groups
const MIN_PARTITION_ESTIMATED_NUM_ENTRIES: usize = 100;

/// Pool of the [`AggregationStateHashTable`]s, one for each partition
#[derive(Debug)]
pub struct PartitionedHashTablePool {
    hash_table_impl_type: HashTableImplType,
    hash_tables: Vec<AggregationStateHashTable>,
}

impl PartitionedHashTablePool {
    /// Create `num_partitions` tables that share `estimated_num_entries` groups
    ///
    /// # Panics
    ///
    /// Panics if `num_partitions` is zero
    pub fn new(
        estimated_num_entries: usize,
        num_partitions: usize,
        hash_table_impl_type: HashTableImplType,
        group_by_types: Vec<Type>,
        handle: &dyn AggregationHandle,
        storage_manager: &Arc<StorageManager>,
    ) -> Self {
        assert_ne!(num_partitions, 0, "Partitioned pool requires at least one partition");
        let partition_estimated_num_entries =
            (estimated_num_entries / num_partitions).max(MIN_PARTITION_ESTIMATED_NUM_ENTRIES);
        tracing::trace!(
            "PartitionedHashTablePool: create `{}` `{:?}` hash tables for `{}` with estimated `{}` entries",
            num_partitions,
            hash_table_impl_type,
            handle.name(),
            partition_estimated_num_entries
        );
        let hash_tables = (0..num_partitions)
            .map(|_| {
                handle.create_group_by_hash_table(
                    hash_table_impl_type,
                    group_by_types.clone(),
                    partition_estimated_num_entries,
                    storage_manager,
                )
            })
            .collect();
        Self {
            hash_table_impl_type,
            hash_tables,
        }
    }

    /// Number of the partitions
    #[inline]
    pub fn num_partitions(&self) -> usize {
        self.hash_tables.len()
    }

    /// Implementation of the tables
    pub fn hash_table_impl_type(&self) -> HashTableImplType {
        self.hash_table_impl_type
    }

    /// Table of the partition. Tables support concurrent insertion, so many workers
    /// can aggregate into the same partition
    ///
    /// # Panics
    ///
    /// Panics if `partition_id` is out of range
    #[inline]
    pub fn get_hash_table(&self, partition_id: usize) -> &AggregationStateHashTable {
        &self.hash_tables[partition_id]
    }

    /// All of the tables, indexed by the partition id
    pub fn get_all_hash_tables(&self) -> &[AggregationStateHashTable] {
        &self.hash_tables
    }
}

/// Partition of the group by key. All of the aggregates of the operator use it, so
/// a group lands in the same partition of each aggregate
#[inline]
pub fn partition_of_key(key: &[TypedValue], num_partitions: usize) -> usize {
    let hash = key
        .iter()
        .map(hash_typed_value)
        .reduce(combine_hashes)
        .unwrap_or_default();
    (hash % num_partitions as u64) as usize
}
