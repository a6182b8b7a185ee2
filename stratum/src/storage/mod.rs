//! Storage layer: blocks, hash tables and the state of the aggregation operator

pub mod aggregation_operation_state;
pub mod bloom_filter;
pub mod hash_table;
pub mod hash_table_pool;
pub mod insert_destination;
pub mod partitioned_hash_table_pool;
pub mod storage_manager;
