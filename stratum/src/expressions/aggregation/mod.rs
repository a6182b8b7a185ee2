//! Aggregation handles
//!
//! An [`AggregationHandle`] knows how to create, accumulate, merge and finalize the
//! [`AggregationState`] of an aggregate function. Handles are stateless, the states
//! live in the operation state or in the [`AggregationStateHashTable`] for group by.
//! States may be merged by many threads concurrently, so every state guards its
//! accumulator with an atomic or a spin mutex
//!
//! Aggregates over a single argument skip the NULL arguments. A group whose arguments
//! are all NULL still exists in the hash table and is finalized from the initial
//! state

mod avg;
mod count;
mod distinct;
mod min_max;
mod sum;

pub use self::avg::{AggregationHandleAvg, AvgState};
pub use self::count::{AggregationHandleCount, CountState};
pub use self::distinct::AggregationHandleDistinct;
pub use self::min_max::{
    AggregationHandleMax, AggregationHandleMin, AggregationHandleMinMax, MinMaxState,
};
pub use self::sum::{AggregationHandleSum, SumState};

use std::fmt::{Debug, Display};
use std::sync::Arc;

use snafu::{Snafu, ensure};
use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::column_vector::ColumnVector;
use stratum_block::types::{Type, TypeId};
use stratum_block::value::TypedValue;

use crate::storage::hash_table::{AggregationStateHashTable, DistinctifyHashTable, HashTableImplType};
use crate::storage::storage_manager::StorageManager;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum AggregationError {
    #[snafu(display(
        "`{func}` aggregation function can not be applied to the arguments with types `[{args}]`"
    ))]
    UnsupportedArguments { func: &'static str, args: String },
}

/// Aggregation result
pub type Result<T> = std::result::Result<T, AggregationError>;

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// Average of the arguments
    Avg,
    /// Number of the non NULL arguments, or number of the tuples without argument
    Count,
    /// Maximum of the arguments
    Max,
    /// Minimum of the arguments
    Min,
    /// Sum of the arguments
    Sum,
}

impl AggregateFunction {
    /// Name of the function
    pub fn name(&self) -> &'static str {
        match self {
            Self::Avg => "AVG",
            Self::Count => "COUNT",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Sum => "SUM",
        }
    }

    /// Returns true if the function can take the arguments with these types
    pub fn can_apply_to_types(&self, argument_types: &[Type]) -> bool {
        match (self, argument_types) {
            (Self::Count, [] | [_]) => true,
            (Self::Avg | Self::Sum, [argument_type]) => argument_type.id().is_numeric(),
            (Self::Max | Self::Min, [_]) => true,
            _ => false,
        }
    }

    /// Type of the result, `None` if the function can not take these arguments
    pub fn result_type_for_types(&self, argument_types: &[Type]) -> Option<Type> {
        if !self.can_apply_to_types(argument_types) {
            return None;
        }
        match self {
            Self::Avg => Some(Type::double(true)),
            Self::Count => Some(Type::long(false)),
            Self::Sum => Some(Type::new(
                WideSum::zero(argument_types[0].id()).type_id(),
                true,
            )),
            Self::Max | Self::Min => Some(argument_types[0].with_nullable(true)),
        }
    }

    /// Create the handle of the function for the arguments
    pub fn create_handle(&self, argument_types: &[Type]) -> Result<Arc<dyn AggregationHandle>> {
        ensure!(
            self.can_apply_to_types(argument_types),
            UnsupportedArgumentsSnafu {
                func: self.name(),
                args: argument_types
                    .iter()
                    .map(|type_| type_.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        );

        let handle: Arc<dyn AggregationHandle> = match (self, argument_types) {
            (Self::Avg, [argument_type]) => Arc::new(AggregationHandleAvg::new(*argument_type)),
            (Self::Count, []) => Arc::new(AggregationHandleCount::<true, false>),
            (Self::Count, [argument_type]) if argument_type.nullable() => {
                Arc::new(AggregationHandleCount::<false, true>)
            }
            (Self::Count, [_]) => Arc::new(AggregationHandleCount::<false, false>),
            (Self::Max, [argument_type]) => Arc::new(AggregationHandleMax::new(*argument_type)),
            (Self::Min, [argument_type]) => Arc::new(AggregationHandleMin::new(*argument_type)),
            (Self::Sum, [argument_type]) => Arc::new(AggregationHandleSum::new(*argument_type)),
            _ => unreachable!("Arguments of `{}` have been checked", self.name()),
        };
        Ok(handle)
    }
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State of the aggregation, a tagged union of the states of all handles
#[derive(Debug, Clone)]
pub enum AggregationState {
    /// State of AVG
    Avg(AvgState),
    /// State of COUNT
    Count(CountState),
    /// State of SUM
    Sum(SumState),
    /// State of MIN and MAX
    MinMax(MinMaxState),
    /// Placeholder stored with the group keys of SELECT DISTINCT
    Distinct,
}

impl AggregationState {
    #[inline]
    fn avg(&self) -> &AvgState {
        match self {
            Self::Avg(state) => state,
            other => state_mismatch("Avg", other),
        }
    }

    #[inline]
    fn count(&self) -> &CountState {
        match self {
            Self::Count(state) => state,
            other => state_mismatch("Count", other),
        }
    }

    #[inline]
    fn sum(&self) -> &SumState {
        match self {
            Self::Sum(state) => state,
            other => state_mismatch("Sum", other),
        }
    }

    #[inline]
    fn min_max(&self) -> &MinMaxState {
        match self {
            Self::MinMax(state) => state,
            other => state_mismatch("MinMax", other),
        }
    }
}

#[cold]
fn state_mismatch(expect: &str, actual: &AggregationState) -> ! {
    panic!("Expect `{}` aggregation state, found `{:?}`", expect, actual)
}

/// Sum in the widened precision: integers are summed as Long and floats are summed
/// as Double.
///
/// Integer sum wraps on overflow like the two's complement addition, so SUM and AVG
/// of huge Long values may return the wrapped value. Overflow is reported in the
/// warn log
#[derive(Debug, Clone, Copy, PartialEq)]
enum WideSum {
    Long(i64),
    Double(f64),
}

#[inline]
fn add_long(lhs: i64, rhs: i64) -> i64 {
    let (sum, overflow) = lhs.overflowing_add(rhs);
    if overflow {
        tracing::warn!("WideSum: `{} + {}` overflows, the sum wraps to `{}`", lhs, rhs, sum);
    }
    sum
}

impl WideSum {
    #[inline]
    fn zero(argument_type: TypeId) -> Self {
        match argument_type {
            TypeId::Int | TypeId::Long => Self::Long(0),
            TypeId::Float | TypeId::Double => Self::Double(0.0),
            TypeId::VarChar => panic!("Sum of VarChar is not supported"),
        }
    }

    #[inline]
    fn type_id(&self) -> TypeId {
        match self {
            Self::Long(_) => TypeId::Long,
            Self::Double(_) => TypeId::Double,
        }
    }

    /// Add the non NULL numeric value
    #[inline]
    fn add(&mut self, value: &TypedValue) {
        match (self, value) {
            (Self::Long(sum), TypedValue::Int(v)) => *sum = add_long(*sum, *v as i64),
            (Self::Long(sum), TypedValue::Long(v)) => *sum = add_long(*sum, *v),
            (Self::Double(sum), value) => match value.as_f64() {
                Some(v) => *sum += v,
                None => panic!("Add non numeric value `{}` to the sum", value),
            },
            (sum, value) => panic!("Add `{}` to the sum `{:?}`", value, sum),
        }
    }

    #[inline]
    fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Long(sum), Self::Long(other)) => *sum = add_long(*sum, other),
            (Self::Double(sum), Self::Double(other)) => *sum += other,
            (sum, other) => panic!("Merge the sum `{:?}` into `{:?}`", other, sum),
        }
    }

    #[inline]
    fn as_f64(&self) -> f64 {
        match self {
            Self::Long(sum) => *sum as f64,
            Self::Double(sum) => *sum,
        }
    }

    #[inline]
    fn to_typed_value(self) -> TypedValue {
        match self {
            Self::Long(sum) => TypedValue::Long(sum),
            Self::Double(sum) => TypedValue::Double(sum),
        }
    }
}

/// Handle of the aggregate function. It is sealed, the set of the aggregate functions
/// is closed
///
/// Methods that accumulate into the hash table take the table by shared reference,
/// many threads may accumulate into the same table concurrently
pub trait AggregationHandle: Debug + Send + Sync + crate::private::Sealed {
    /// Name of the aggregate, used in logs
    fn name(&self) -> &'static str;

    /// Type of the finalized value
    fn result_type(&self) -> Type;

    /// Whether the finalized group has a column for this aggregate. [`Self::result_type`]
    /// is only meaningful if it returns true
    fn has_result_column(&self) -> bool {
        true
    }

    /// Create the state that has not seen any argument
    fn create_initial_state(&self) -> AggregationState;

    /// Create the `impl_type` hash table that maps the group by keys to the states
    fn create_group_by_hash_table(
        &self,
        impl_type: HashTableImplType,
        group_by_types: Vec<Type>,
        estimated_num_groups: usize,
        storage_manager: &Arc<StorageManager>,
    ) -> AggregationStateHashTable {
        AggregationStateHashTable::with_impl_type(
            impl_type,
            group_by_types,
            estimated_num_groups,
            Arc::clone(storage_manager),
        )
    }

    /// Accumulate `num_tuples` tuples for the aggregate without argument
    ///
    /// # Panics
    ///
    /// Panics if the aggregate takes argument
    fn accumulate_nullary(&self, num_tuples: usize) -> AggregationState {
        panic!(
            "`{}` aggregation takes argument, can not accumulate {} tuples without argument",
            self.name(),
            num_tuples
        )
    }

    /// Accumulate the materialized arguments into a new state
    fn accumulate_column_vectors(&self, column_vectors: &[Arc<ColumnVector>]) -> AggregationState;

    /// Accumulate the arguments read from the attributes of the accessor into a new
    /// state
    fn accumulate_value_accessor(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
    ) -> AggregationState;

    /// Accumulate each tuple of the accessor into the state of its group. Tuples with
    /// NULL group by key are skipped
    fn aggregate_value_accessor_into_hash_table(
        &self,
        accessor: &mut dyn ValueAccessor,
        argument_ids: &[AttributeId],
        group_by_key_ids: &[AttributeId],
        hash_table: &AggregationStateHashTable,
    );

    /// Merge `source` into `destination`, it is safe to merge into the same
    /// destination concurrently
    fn merge_states(&self, source: &AggregationState, destination: &AggregationState);

    /// Project the state to the result
    fn finalize(&self, state: &AggregationState) -> TypedValue;

    /// Finalize the states of all of the groups in the hash table, returns the column
    /// of the results
    ///
    /// If `group_by_keys` is empty, the keys of the hash table are appended to it in
    /// the order of iteration. Otherwise, results are produced for the keys in
    /// `group_by_keys`, groups that do not exist in the table are finalized from the
    /// initial state
    fn finalize_hash_table(
        &self,
        hash_table: &AggregationStateHashTable,
        group_by_keys: &mut Vec<Vec<TypedValue>>,
    ) -> Option<ColumnVector> {
        if group_by_keys.is_empty() {
            let mut results = ColumnVector::new(self.result_type(), hash_table.num_entries());
            hash_table.for_each_composite_key(|key, state| {
                group_by_keys.push(key.to_vec());
                results.append_typed_value(self.finalize(state));
            });
            Some(results)
        } else {
            let initial_state = self.create_initial_state();
            Some(ColumnVector::from_values(
                self.result_type(),
                group_by_keys
                    .iter()
                    .map(|key| match hash_table.get_single_composite_key(key) {
                        Some(state) => self.finalize(&state),
                        None => self.finalize(&initial_state),
                    }),
            ))
        }
    }

    /// Create the `impl_type` hash table that eliminates the duplicated (group by keys,
    /// arguments)
    fn create_distinctify_hash_table(
        &self,
        impl_type: HashTableImplType,
        key_types: Vec<Type>,
        estimated_num_distinct_keys: usize,
        storage_manager: &Arc<StorageManager>,
    ) -> DistinctifyHashTable {
        DistinctifyHashTable::with_impl_type(
            impl_type,
            key_types,
            estimated_num_distinct_keys,
            Arc::clone(storage_manager),
        )
    }

    /// Insert the keys read from the attributes of the accessor into the distinctify
    /// hash table. Keys with NULL component are skipped
    fn insert_value_accessor_into_distinctify_hash_table(
        &self,
        accessor: &mut dyn ValueAccessor,
        key_ids: &[AttributeId],
        distinctify_hash_table: &DistinctifyHashTable,
    ) {
        let upserted =
            distinctify_hash_table.upsert_value_accessor_composite_key(accessor, key_ids, true, &(), |_, _| {});
        debug_assert!(upserted, "Resizable hash table never runs out of space");
    }

    /// Aggregate the distinct arguments, keys of the distinctify hash table are the
    /// arguments
    fn aggregate_on_distinctify_hash_table_for_single(
        &self,
        distinctify_hash_table: &DistinctifyHashTable,
    ) -> AggregationState;

    /// Aggregate the distinct arguments into the states of their groups, keys of the
    /// distinctify hash table are the group by keys followed by the argument
    fn aggregate_on_distinctify_hash_table_for_group_by(
        &self,
        distinctify_hash_table: &DistinctifyHashTable,
        hash_table: &AggregationStateHashTable,
    );

    /// Merge the states of all of the groups in `source` into `destination`
    fn merge_group_by_hash_tables(
        &self,
        source: &AggregationStateHashTable,
        destination: &AggregationStateHashTable,
    ) {
        let initial_state = self.create_initial_state();
        source.for_each_composite_key(|key, state| {
            let upserted = destination.upsert_composite_key(key, &initial_state, |destination| {
                self.merge_states(state, destination)
            });
            debug_assert!(upserted, "Resizable hash table never runs out of space");
        });
    }
}

/// Handles whose aggregate takes exactly one argument. NULL arguments are skipped
/// before the state sees them
trait UnaryAggregationHandle {
    fn initial_state(&self) -> AggregationState;

    /// Accumulate the non NULL argument into the state
    fn iterate_unary(&self, state: &AggregationState, argument: &TypedValue);
}

#[inline]
fn single_argument(argument_ids: &[AttributeId]) -> AttributeId {
    match argument_ids {
        [argument_id] => *argument_id,
        _ => panic!("Expect exactly one argument, found `{:?}`", argument_ids),
    }
}

fn unary_accumulate_column_vectors<H: UnaryAggregationHandle>(
    handle: &H,
    column_vectors: &[Arc<ColumnVector>],
) -> AggregationState {
    let [column_vector] = column_vectors else {
        panic!("Expect exactly one argument, found `{}` arguments", column_vectors.len())
    };
    let state = handle.initial_state();
    column_vector
        .iter()
        .filter(|argument| !argument.is_null())
        .for_each(|argument| handle.iterate_unary(&state, &argument));
    state
}

fn unary_accumulate_value_accessor<H: UnaryAggregationHandle>(
    handle: &H,
    accessor: &mut dyn ValueAccessor,
    argument_ids: &[AttributeId],
) -> AggregationState {
    let argument_id = single_argument(argument_ids);
    let state = handle.initial_state();
    accessor.begin_iteration();
    while accessor.next() {
        let argument = accessor.get_typed_value(argument_id);
        if !argument.is_null() {
            handle.iterate_unary(&state, &argument);
        }
    }
    state
}

fn unary_aggregate_value_accessor_into_hash_table<H: UnaryAggregationHandle>(
    handle: &H,
    accessor: &mut dyn ValueAccessor,
    argument_ids: &[AttributeId],
    group_by_key_ids: &[AttributeId],
    hash_table: &AggregationStateHashTable,
) {
    let argument_id = single_argument(argument_ids);
    let upserted = hash_table.upsert_value_accessor_composite_key(
        accessor,
        group_by_key_ids,
        true,
        &handle.initial_state(),
        |accessor, state| {
            let argument = accessor.get_typed_value(argument_id);
            if !argument.is_null() {
                handle.iterate_unary(state, &argument);
            }
        },
    );
    debug_assert!(upserted, "Resizable hash table never runs out of space");
}

fn unary_aggregate_on_distinctify_hash_table_for_single<H: UnaryAggregationHandle>(
    handle: &H,
    distinctify_hash_table: &DistinctifyHashTable,
) -> AggregationState {
    let state = handle.initial_state();
    distinctify_hash_table.for_each_composite_key(|key, _| match key.last() {
        Some(argument) if !argument.is_null() => handle.iterate_unary(&state, argument),
        _ => (),
    });
    state
}

fn unary_aggregate_on_distinctify_hash_table_for_group_by<H: UnaryAggregationHandle>(
    handle: &H,
    distinctify_hash_table: &DistinctifyHashTable,
    hash_table: &AggregationStateHashTable,
) {
    let initial_state = handle.initial_state();
    distinctify_hash_table.for_each_composite_key(|key, _| {
        let Some((argument, group_by_key)) = key.split_last() else {
            return;
        };
        let upserted = hash_table.upsert_composite_key(group_by_key, &initial_state, |state| {
            if !argument.is_null() {
                handle.iterate_unary(state, argument);
            }
        });
        debug_assert!(upserted, "Resizable hash table never runs out of space");
    });
}
