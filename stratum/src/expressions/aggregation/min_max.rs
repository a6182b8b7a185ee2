//! MIN and MAX aggregations

use std::cmp::Ordering;
use std::sync::Arc;

use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::column_vector::ColumnVector;
use stratum_block::types::Type;
use stratum_block::value::TypedValue;

use super::{
    AggregationHandle, AggregationState, UnaryAggregationHandle, unary_accumulate_column_vectors,
    unary_accumulate_value_accessor, unary_aggregate_on_distinctify_hash_table_for_group_by,
    unary_aggregate_on_distinctify_hash_table_for_single,
    unary_aggregate_value_accessor_into_hash_table,
};
use crate::common::utils::spin::SpinMutex;
use crate::storage::hash_table::{AggregationStateHashTable, DistinctifyHashTable};

/// State of MIN and MAX, the best argument seen so far
#[derive(Debug)]
pub struct MinMaxState {
    best: SpinMutex<Option<TypedValue>>,
}

impl Clone for MinMaxState {
    fn clone(&self) -> Self {
        Self {
            best: SpinMutex::new(self.best.lock().clone()),
        }
    }
}

/// Handle of MIN if `IS_MIN` is true, otherwise handle of MAX. The result has the type
/// of the argument, it is NULL if no argument is seen
#[derive(Debug)]
pub struct AggregationHandleMinMax<const IS_MIN: bool> {
    argument_type: Type,
}

/// Handle of MIN
pub type AggregationHandleMin = AggregationHandleMinMax<true>;

/// Handle of MAX
pub type AggregationHandleMax = AggregationHandleMinMax<false>;

impl<const IS_MIN: bool> AggregationHandleMinMax<IS_MIN> {
    /// Create a new handle
    pub fn new(argument_type: Type) -> Self {
        Self { argument_type }
    }

    /// Returns true if `candidate` should replace `best`. Floats are compared in the
    /// total order
    #[inline]
    fn is_better(candidate: &TypedValue, best: &TypedValue) -> bool {
        let ordering = match (candidate, best) {
            (TypedValue::Float(c), TypedValue::Float(b)) => c.total_cmp(b),
            (TypedValue::Double(c), TypedValue::Double(b)) => c.total_cmp(b),
            _ => candidate.compare(best).unwrap_or(Ordering::Equal),
        };
        if IS_MIN {
            ordering.is_lt()
        } else {
            ordering.is_gt()
        }
    }

    #[inline]
    fn update(state: &MinMaxState, candidate: &TypedValue) {
        let mut best = state.best.lock();
        match best.as_ref() {
            Some(current) if !Self::is_better(candidate, current) => (),
            _ => *best = Some(candidate.clone()),
        }
    }
}

impl<const IS_MIN: bool> UnaryAggregationHandle for AggregationHandleMinMax<IS_MIN> {
    #[inline]
    fn initial_state(&self) -> AggregationState {
        AggregationState::MinMax(MinMaxState {
            best: SpinMutex::new(None),
        })
    }

    #[inline]
    fn iterate_unary(&self, state: &AggregationState, argument: &TypedValue) {
        Self::update(state.min_max(), argument);
    }
}

impl<const IS_MIN: bool> crate::private::Sealed for AggregationHandleMinMax<IS_MIN> {}

impl<const IS_MIN: bool> AggregationHandle for AggregationHandleMinMax<IS_MIN> {
    fn name(&self) -> &'static str {
        if IS_MIN { "MIN" } else { "MAX" }
    }

    fn result_type(&self) -> Type {
        self.argument_type.with_nullable(true)
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
        let source = source.min_max().best.lock().clone();
        if let Some(source) = source {
            Self::update(destination.min_max(), &source);
        }
    }

    fn finalize(&self, state: &AggregationState) -> TypedValue {
        state
            .min_max()
            .best
            .lock()
            .clone()
            .unwrap_or(TypedValue::Null(self.argument_type.id()))
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
