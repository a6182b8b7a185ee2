//! AVG aggregation

use std::sync::Arc;

use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::column_vector::ColumnVector;
use stratum_block::types::{Type, TypeId};
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
struct AvgAccumulator {
    sum: WideSum,
    count: u64,
}

/// State of AVG: the sum in widened precision and the number of arguments
#[derive(Debug)]
pub struct AvgState {
    accumulator: SpinMutex<AvgAccumulator>,
}

impl AvgState {
    fn new(argument_type: TypeId) -> Self {
        Self {
            accumulator: SpinMutex::new(AvgAccumulator {
                sum: WideSum::zero(argument_type),
                count: 0,
            }),
        }
    }
}

impl Clone for AvgState {
    fn clone(&self) -> Self {
        Self {
            accumulator: SpinMutex::new(*self.accumulator.lock()),
        }
    }
}

/// Handle of AVG. The result is Double, it is NULL if no argument is seen
#[derive(Debug)]
pub struct AggregationHandleAvg {
    argument_type: Type,
}

impl AggregationHandleAvg {
    /// Create a new handle, the argument should be numeric
    pub fn new(argument_type: Type) -> Self {
        debug_assert!(argument_type.id().is_numeric());
        Self { argument_type }
    }
}

impl UnaryAggregationHandle for AggregationHandleAvg {
    #[inline]
    fn initial_state(&self) -> AggregationState {
        AggregationState::Avg(AvgState::new(self.argument_type.id()))
    }

    #[inline]
    fn iterate_unary(&self, state: &AggregationState, argument: &TypedValue) {
        let mut accumulator = state.avg().accumulator.lock();
        accumulator.sum.add(argument);
        accumulator.count += 1;
    }
}

impl crate::private::Sealed for AggregationHandleAvg {}

impl AggregationHandle for AggregationHandleAvg {
    fn name(&self) -> &'static str {
        "AVG"
    }

    fn result_type(&self) -> Type {
        Type::double(true)
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
        let source = *source.avg().accumulator.lock();
        let mut destination = destination.avg().accumulator.lock();
        destination.sum.merge(source.sum);
        destination.count += source.count;
    }

    fn finalize(&self, state: &AggregationState) -> TypedValue {
        let accumulator = *state.avg().accumulator.lock();
        if accumulator.count == 0 {
            TypedValue::Null(TypeId::Double)
        } else {
            TypedValue::Double(accumulator.sum.as_f64() / accumulator.count as f64)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hash_table::HashTableImplType;
    use crate::storage::storage_manager::StorageManager;
    use stratum_block::accessor::ColumnVectorsValueAccessor;

    fn ints(values: &[Option<i32>]) -> Arc<ColumnVector> {
        Arc::new(ColumnVector::from_values(
            Type::int(true),
            values.iter().map(|value| match value {
                Some(v) => TypedValue::Int(*v),
                None => TypedValue::Null(TypeId::Int),
            }),
        ))
    }

    #[test]
    fn test_avg_of_ints() {
        let handle = AggregationHandleAvg::new(Type::int(true));
        let state = handle.accumulate_column_vectors(&[ints(&[Some(1), Some(2), Some(3)])]);
        assert_eq!(handle.finalize(&state), TypedValue::Double(2.0));
    }

    #[test]
    fn test_avg_of_nothing_is_null() {
        let handle = AggregationHandleAvg::new(Type::int(true));
        let empty = handle.accumulate_column_vectors(&[ints(&[])]);
        assert_eq!(handle.finalize(&empty), TypedValue::Null(TypeId::Double));

        let all_null = handle.accumulate_column_vectors(&[ints(&[None, None])]);
        assert_eq!(handle.finalize(&all_null), TypedValue::Null(TypeId::Double));
    }

    #[test]
    fn test_merge_partial_states() {
        let handle = AggregationHandleAvg::new(Type::double(false));
        let destination = handle.create_initial_state();
        std::thread::scope(|s| {
            (0..4).for_each(|i| {
                let handle = &handle;
                let destination = &destination;
                s.spawn(move || {
                    let column = Arc::new(ColumnVector::from_values(
                        Type::double(false),
                        (0..100).map(|v| TypedValue::Double((i * 100 + v) as f64)),
                    ));
                    let partial = handle.accumulate_column_vectors(&[column]);
                    handle.merge_states(&partial, destination);
                });
            });
        });
        assert_eq!(handle.finalize(&destination), TypedValue::Double(199.5));
    }

    #[test]
    fn test_avg_group_by() {
        let handle = AggregationHandleAvg::new(Type::int(true));
        let storage_manager = Arc::new(StorageManager::new());
        let hash_table = handle.create_group_by_hash_table(
            HashTableImplType::SeparateChaining,
            vec![Type::int(false)],
            4,
            &storage_manager,
        );
        let mut accessor = ColumnVectorsValueAccessor::try_new([
            Arc::new(ColumnVector::from_values(
                Type::int(false),
                [1, 2, 1, 2].map(TypedValue::Int),
            )),
            ints(&[Some(1), None, Some(4), None]),
        ])
        .unwrap();
        handle.aggregate_value_accessor_into_hash_table(&mut accessor, &[1], &[0], &hash_table);

        let mut group_by_keys = Vec::new();
        let results = handle
            .finalize_hash_table(&hash_table, &mut group_by_keys)
            .unwrap();
        assert_eq!(group_by_keys, vec![vec![TypedValue::Int(1)], vec![TypedValue::Int(2)]]);
        assert_eq!(
            results.iter().collect::<Vec<_>>(),
            vec![TypedValue::Double(2.5), TypedValue::Null(TypeId::Double)]
        );
    }
}
