//! SUM aggregation

use std::sync::Arc;

use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::column_vector::ColumnVector;
use stratum_block::types::Type;
use stratum_block::value::TypedValue;

use super::{
    AggregationHandle, AggregationState, UnaryAggregationHandle, WideSum,
    unary_accumulate_column_vectors, unary_accumulate_value_accessor,
    unary_aggregate_on_distinctify_hash_table_for_group_by,
    unary_aggregate_on_distinctify_hash_table_for_single,
    unary_aggregate_value_accessor_into_hash_table,
};
use crate::common::utils::spin::SpinMutex;
use crate::storage::hash_table::{AggregationStateHashTable, DistinctifyHashTable};

#[derive(Debug, Clone, Copy)]
struct SumAccumulator {
    sum: WideSum,
    /// No argument has been added
    null: bool,
}

/// State of SUM
#[derive(Debug)]
pub struct SumState {
    accumulator: SpinMutex<SumAccumulator>,
}

impl Clone for SumState {
    fn clone(&self) -> Self {
        Self {
            accumulator: SpinMutex::new(*self.accumulator.lock()),
        }
    }
}

/// Handle of SUM. Integers are summed as Long and floats are summed as Double, the
/// result is NULL if no argument is seen
#[derive(Debug)]
pub struct AggregationHandleSum {
    argument_type: Type,
}

impl AggregationHandleSum {
    /// Create a new handle, the argument should be numeric
    pub fn new(argument_type: Type) -> Self {
        debug_assert!(argument_type.id().is_numeric());
        Self { argument_type }
    }
}

impl UnaryAggregationHandle for AggregationHandleSum {
    #[inline]
    fn initial_state(&self) -> AggregationState {
        AggregationState::Sum(SumState {
            accumulator: SpinMutex::new(SumAccumulator {
                sum: WideSum::zero(self.argument_type.id()),
                null: true,
            }),
        })
    }

    #[inline]
    fn iterate_unary(&self, state: &AggregationState, argument: &TypedValue) {
        let mut accumulator = state.sum().accumulator.lock();
        accumulator.sum.add(argument);
        accumulator.null = false;
    }
}

impl crate::private::Sealed for AggregationHandleSum {}

impl AggregationHandle for AggregationHandleSum {
    fn name(&self) -> &'static str {
        "SUM"
    }

    fn result_type(&self) -> Type {
        Type::new(WideSum::zero(self.argument_type.id()).type_id(), true)
    }

    fn create_initial_state(&self) -> AggregationState {
        self.initial_state()
    }

    fn accumulate_column_vectors(&self, column_vectors: &[Arc<ColumnVector>]) -> AggregationState {
        unary_accumulate_column_vectors(self, column_vectors)
    }

    fn accumulate_value_accessor(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
    ) -> AggregationState {
        unary_accumulate_value_accessor(self, accessor, argument_ids)
    }

    fn aggregate_value_accessor_into_hash_table(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
        group_by_key_ids: &[AttributeId],
        hash_table: &AggregationStateHashTable,
    ) {
        unary_aggregate_value_accessor_into_hash_table(
            self,
            accessor,
            argument_ids,
            group_by_key_ids,
            hash_table,
        )
    }

    fn merge_states(&self, source: &AggregationState, destination: &AggregationState) {
        let source = *source.sum().accumulator.lock();
        if source.null {
            return;
        }
        let mut destination = destination.sum().accumulator.lock();
        destination.sum.merge(source.sum);
        destination.null = false;
    }

    fn finalize(&self, state: &AggregationState) -> TypedValue {
        let accumulator = *state.sum().accumulator.lock();
        if accumulator.null {
            TypedValue::Null(accumulator.sum.type_id())
        } else {
            accumulator.sum.to_typed_value()
        }
    }

    fn aggregate_on_distinctify_hash_table_for_single(
        &self,
        distinctify_hash_table: &DistinctifyHashTable,
    ) -> AggregationState {
        unary_aggregate_on_distinctify_hash_table_for_single(self, distinctify_hash_table)
    }

    fn aggregate_on_distinctify_hash_table_for_group_by(
        &self,
        distinctify_hash_table: &DistinctifyHashTable,
        hash_table: &AggregationStateHashTable,
    ) {
        unary_aggregate_on_distinctify_hash_table_for_group_by(
            self,
            distinctify_hash_table,
            hash_table,
        )
    }
}
