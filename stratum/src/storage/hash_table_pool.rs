//! Pool of the group by hash tables of an aggregate
//!
//! Workers check a table out of the pool, aggregate a block into it and return it.
//! A checked out table is owned by the worker, so a table is never accessed by two
//! workers at the same time. Tables are created lazily, the pool holds at most as
//! many tables as the number of workers that check out concurrently

use std::sync::Arc;

use parking_lot::Mutex;
use stratum_block::types::Type;

use crate::expressions::aggregation::AggregationHandle;
use crate::storage::hash_table::{AggregationStateHashTable, HashTableImplType};
use crate::storage::storage_manager::StorageManager;

/// Pool of the [`AggregationStateHashTable`]s
#[derive(Debug)]
pub struct HashTablePool {
    estimated_num_entries: usize,
    hash_table_impl_type: HashTableImplType,
    group_by_types: Vec<Type>,
    handle: Arc<dyn AggregationHandle>,
    storage_manager: Arc<StorageManager>,
    hash_tables: Mutex<Vec<AggregationStateHashTable>>,
}

impl HashTablePool {
    /// Create an empty pool. Each table is expected to hold `estimated_num_entries`
    /// groups
    pub fn new(
        estimated_num_entries: usize,
        hash_table_impl_type: HashTableImplType,
        group_by_types: Vec<Type>,
        handle: Arc<dyn AggregationHandle>,
        storage_manager: Arc<StorageManager>,
    ) -> Self {
        Self {
            estimated_num_entries,
            hash_table_impl_type,
            group_by_types,
            handle,
            storage_manager,
            hash_tables: Mutex::new(Vec::new()),
        }
    }

    /// Check out a table, create a new one if all of the tables are checked out
    pub fn get_hash_table(&self) -> AggregationStateHashTable {
        if let Some(hash_table) = self.hash_tables.lock().pop() {
            return hash_table;
        }

        tracing::trace!(
            "HashTablePool: create `{:?}` hash table for `{}` with estimated `{}` entries",
            self.hash_table_impl_type,
            self.handle.name(),
            self.estimated_num_entries
        );
        self.handle.create_group_by_hash_table(
            self.hash_table_impl_type,
            self.group_by_types.clone(),
            self.estimated_num_entries,
            &self.storage_manager,
        )
    }

    /// Return the checked out table
    pub fn return_hash_table(&self, hash_table: AggregationStateHashTable) {
        self.hash_tables.lock().push(hash_table);
    }

    /// All of the tables in the pool. Exclusive borrow guarantees no table is checked
    /// out
    pub fn get_all_hash_tables(&mut self) -> &mut Vec<AggregationStateHashTable> {
        self.hash_tables.get_mut()
    }
}
