//! Handle of SELECT DISTINCT without aggregate function. It only collects the distinct
//! group keys into the hash table, calling any method that aggregates is a contract
//! violation

use std::sync::Arc;

use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::column_vector::ColumnVector;
use stratum_block::types::Type;
use stratum_block::value::TypedValue;

use super::{AggregationHandle, AggregationState};
use crate::storage::hash_table::{AggregationStateHashTable, DistinctifyHashTable};

/// Handle that deduplicates the group by keys
#[derive(Debug, Default)]
pub struct AggregationHandleDistinct;

impl AggregationHandleDistinct {
    /// Create a new handle
    pub fn new() -> Self {
        Self
    }

    #[cold]
    fn unsupported(&self, method: &str) -> ! {
        panic!("`AggregationHandleDistinct` does not support `{}`", method)
    }
}

impl crate::private::Sealed for AggregationHandleDistinct {}

impl AggregationHandle for AggregationHandleDistinct {
    fn name(&self) -> &'static str {
        "DISTINCT"
    }

    fn result_type(&self) -> Type {
        self.unsupported("result_type")
    }

    fn has_result_column(&self) -> bool {
        false
    }

    fn create_initial_state(&self) -> AggregationState {
        AggregationState::Distinct
    }

    fn accumulate_column_vectors(&self, _column_vectors: &[Arc<ColumnVector>]) -> AggregationState {
        self.unsupported("accumulate_column_vectors")
    }

    fn accumulate_value_accessor(
        &self,
        _accessor: &mut dyn ValueAccessor,
        _argument_ids: &[AttributeId],
    ) -> AggregationState {
        self.unsupported("accumulate_value_accessor")
    }

    fn aggregate_value_accessor_into_hash_table(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
        group_by_key_ids: &[AttributeId],
        hash_table: &AggregationStateHashTable,
    ) {
        debug_assert!(argument_ids.is_empty());
        let upserted = hash_table.upsert_value_accessor_composite_key(
            accessor,
            group_by_key_ids,
            true,
            &AggregationState::Distinct,
            |_, _| {},
        );
        debug_assert!(upserted, "Resizable hash table never runs out of space");
    }

    fn merge_states(&self, _source: &AggregationState, _destination: &AggregationState) {
        self.unsupported("merge_states")
    }

    fn finalize(&self, _state: &AggregationState) -> TypedValue {
        self.unsupported("finalize")
    }

    /// Collect the distinct keys into `group_by_keys`, there is no result column
    fn finalize_hash_table(
        &self,
        hash_table: &AggregationStateHashTable,
        group_by_keys: &mut Vec<Vec<TypedValue>>,
    ) -> Option<ColumnVector> {
        debug_assert!(group_by_keys.is_empty());
        hash_table.for_each_composite_key(|key, _| group_by_keys.push(key.to_vec()));
        None
    }

    fn aggregate_on_distinctify_hash_table_for_single(
        &self,
        _distinctify_hash_table: &DistinctifyHashTable,
    ) -> AggregationState {
        self.unsupported("aggregate_on_distinctify_hash_table_for_single")
    }

    fn aggregate_on_distinctify_hash_table_for_group_by(
        &self,
        _distinctify_hash_table: &DistinctifyHashTable,
        _hash_table: &AggregationStateHashTable,
    ) {
        self.unsupported("aggregate_on_distinctify_hash_table_for_group_by")
    }

    fn merge_group_by_hash_tables(
        &self,
        source: &AggregationStateHashTable,
        destination: &AggregationStateHashTable,
    ) {
        source.for_each_composite_key(|key, _| {
            let upserted = destination.upsert_composite_key(key, &AggregationState::Distinct, |_| {});
            debug_assert!(upserted, "Resizable hash table never runs out of space");
        });
    }
}
