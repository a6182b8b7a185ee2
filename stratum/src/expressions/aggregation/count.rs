//! COUNT aggregation

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

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
use crate::storage::hash_table::{AggregationStateHashTable, DistinctifyHashTable};

/// State of COUNT
#[derive(Debug, Default)]
pub struct CountState(AtomicU64);

impl CountState {
    #[inline]
    fn new(count: u64) -> Self {
        Self(AtomicU64::new(count))
    }

    #[inline]
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Relaxed);
    }

    #[inline]
    fn value(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

impl Clone for CountState {
    fn clone(&self) -> Self {
        Self::new(self.value())
    }
}

/// Handle of COUNT
///
/// If `STAR` is true, it counts the tuples and takes no argument. Otherwise it counts
/// the non NULL arguments and `NULLABLE` is the nullability of the argument.
/// `COUNT(*)` is never nullable
#[derive(Debug)]
pub struct AggregationHandleCount<const STAR: bool, const NULLABLE: bool>;

impl<const STAR: bool, const NULLABLE: bool> AggregationHandleCount<STAR, NULLABLE> {
    #[inline]
    fn assert_unary(&self) {
        assert!(!STAR, "COUNT(*) does not take argument");
    }
}

impl<const STAR: bool, const NULLABLE: bool> UnaryAggregationHandle
    for AggregationHandleCount<STAR, NULLABLE>
{
    #[inline]
    fn initial_state(&self) -> AggregationState {
        AggregationState::Count(CountState::default())
    }

    #[inline]
    fn iterate_unary(&self, state: &AggregationState, _argument: &TypedValue) {
        state.count().add(1);
    }
}

impl<const STAR: bool, const NULLABLE: bool> crate::private::Sealed
    for AggregationHandleCount<STAR, NULLABLE>
{
}

impl<const STAR: bool, const NULLABLE: bool> AggregationHandle
    for AggregationHandleCount<STAR, NULLABLE>
{
    fn name(&self) -> &'static str {
        if STAR { "COUNT(*)" } else { "COUNT" }
    }

    fn result_type(&self) -> Type {
        Type::long(false)
    }

    fn create_initial_state(&self) -> AggregationState {
        self.initial_state()
    }

    fn accumulate_nullary(&self, num_tuples: usize) -> AggregationState {
        assert!(STAR, "COUNT takes argument, can not accumulate without argument");
        AggregationState::Count(CountState::new(num_tuples as u64))
    }

    fn accumulate_column_vectors(&self, column_vectors: &[Arc<ColumnVector>]) -> AggregationState {
        self.assert_unary();
        match column_vectors {
            [column_vector] if !NULLABLE => {
                AggregationState::Count(CountState::new(column_vector.len() as u64))
            }
            _ => unary_accumulate_column_vectors(self, column_vectors),
        }
    }

    fn accumulate_value_accessor(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
    ) -> AggregationState {
        self.assert_unary();
        if NULLABLE {
            unary_accumulate_value_accessor(self, accessor, argument_ids)
        } else {
            AggregationState::Count(CountState::new(accessor.num_tuples() as u64))
        }
    }

    fn aggregate_value_accessor_into_hash_table(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
        group_by_key_ids: &[AttributeId],
        hash_table: &AggregationStateHashTable,
    ) {
        if STAR {
            debug_assert!(argument_ids.is_empty());
            let upserted = hash_table.upsert_value_accessor_composite_key(
                accessor,
                group_by_key_ids,
                true,
                &self.initial_state(),
                |_, state| state.count().add(1),
            );
            debug_assert!(upserted, "Resizable hash table never runs out of space");
        } else {
            unary_aggregate_value_accessor_into_hash_table(
                self,
                accessor,
                argument_ids,
                group_by_key_ids,
                hash_table,
            )
        }
    }

    fn merge_states(&self, source: &AggregationState, destination: &AggregationState) {
        destination.count().add(source.count().value());
    }

    fn finalize(&self, state: &AggregationState) -> TypedValue {
        TypedValue::Long(state.count().value() as i64)
    }

    fn aggregate_on_distinctify_hash_table_for_single(
        &self,
        distinctify_hash_table: &DistinctifyHashTable,
    ) -> AggregationState {
        self.assert_unary();
        unary_aggregate_on_distinctify_hash_table_for_single(self, distinctify_hash_table)
    }

    fn aggregate_on_distinctify_hash_table_for_group_by(
        &self,
        distinctify_hash_table: &DistinctifyHashTable,
        hash_table: &AggregationStateHashTable,
    ) {
        self.assert_unary();
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
    use stratum_block::types::TypeId;

    fn nullable_column() -> Arc<ColumnVector> {
        Arc::new(ColumnVector::from_values(
            Type::int(true),
            [TypedValue::Int(1), TypedValue::Null(TypeId::Int), TypedValue::Int(3)],
        ))
    }

    #[test]
    fn test_count_star_of_empty_block() {
        let handle = AggregationHandleCount::<true, false>;
        let state = handle.accumulate_nullary(0);
        assert_eq!(handle.finalize(&state), TypedValue::Long(0));
    }

    #[test]
    fn test_count_skips_null() {
        let handle = AggregationHandleCount::<false, true>;
        let state = handle.accumulate_column_vectors(&[nullable_column()]);
        assert_eq!(handle.finalize(&state), TypedValue::Long(2));

        let mut accessor = ColumnVectorsValueAccessor::try_new([nullable_column()]).unwrap();
        let state = handle.accumulate_value_accessor(&mut accessor, &[0]);
        assert_eq!(handle.finalize(&state), TypedValue::Long(2));

        // Non nullable argument counts the tuples directly
        let handle = AggregationHandleCount::<false, false>;
        let state = handle.accumulate_value_accessor(&mut accessor, &[0]);
        assert_eq!(handle.finalize(&state), TypedValue::Long(3));
    }

    #[test]
    fn test_merge_counts_concurrently() {
        let handle = AggregationHandleCount::<true, false>;
        let destination = handle.create_initial_state();
        std::thread::scope(|s| {
            (0..8).for_each(|_| {
                s.spawn(|| {
                    (0..100).for_each(|_| {
                        handle.merge_states(&handle.accumulate_nullary(3), &destination)
                    });
                });
            });
        });
        assert_eq!(handle.finalize(&destination), TypedValue::Long(2400));
    }

    #[test]
    fn test_count_star_group_by() {
        let handle = AggregationHandleCount::<true, false>;
        let storage_manager = Arc::new(StorageManager::new());
        let hash_table = handle.create_group_by_hash_table(
            HashTableImplType::SimpleScalarSeparateChaining,
            vec![Type::int(true)],
            2,
            &storage_manager,
        );
        let mut accessor = ColumnVectorsValueAccessor::try_new([nullable_column()]).unwrap();
        handle.aggregate_value_accessor_into_hash_table(&mut accessor, &[], &[0], &hash_table);
        handle.aggregate_value_accessor_into_hash_table(&mut accessor, &[], &[0], &hash_table);

        let mut group_by_keys = Vec::new();
        let results = handle
            .finalize_hash_table(&hash_table, &mut group_by_keys)
            .unwrap();
        // Tuple with NULL group by key is skipped
        assert_eq!(group_by_keys, vec![vec![TypedValue::Int(1)], vec![TypedValue::Int(3)]]);
        assert_eq!(
            results.iter().collect::<Vec<_>>(),
            vec![TypedValue::Long(2), TypedValue::Long(2)]
        );
    }

    #[test]
    #[should_panic(expected = "COUNT(*) does not take argument")]
    fn test_count_star_rejects_argument() {
        let handle = AggregationHandleCount::<true, false>;
        handle.accumulate_column_vectors(&[nullable_column()]);
    }
}
