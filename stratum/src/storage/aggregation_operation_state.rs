//! State of the aggregation operator
//!
//! Workers call [`AggregationOperationState::aggregate_block`] concurrently, each
//! with a different block of the input relation. After all of the blocks are
//! aggregated, [`AggregationOperationState::finalize_aggregate`] is called exactly once
//! to produce the result.
//!
//! Without GROUP BY, each aggregate accumulates a block into a local state and merges
//! it into the single state of the aggregate. With GROUP BY, each aggregate owns a
//! [`HashTablePool`], a worker checks a table out of the pool for each block and
//! the tables are merged in the finalization. DISTINCT aggregates insert their
//! arguments, prefixed with the group by keys, into a distinctify hash table that is
//! aggregated in the finalization.
//!
//! Plan with more than one partition and without DISTINCT aggregate partitions the
//! groups by the hash of the group by keys instead. Each aggregate owns a
//! [`PartitionedHashTablePool`], the partitions are disjoint and each of them is
//! finalized independently by [`AggregationOperationState::finalize_aggregate_partition`]

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use stratum_block::AttributeId;
use stratum_block::accessor::{
    ColumnVectorsValueAccessor, InconsistentLengthError, TupleIdSequenceAdapter, ValueAccessor,
};
use stratum_block::column_vector::ColumnVector;
use stratum_block::tuple::Tuple;
use stratum_block::tuple_id_sequence::TupleIdSequence;
use stratum_block::types::Type;
use stratum_block::value::TypedValue;
use stratum_procedural_macro::MetricsSetBuilder;

use crate::catalog::{CatalogDatabase, CatalogRelationSchema, RelationId};
use crate::common::client_context::ClientContext;
use crate::common::profiler::ScopedTimerGuard;
use crate::expressions::aggregation::{
    AggregateFunction, AggregationError, AggregationHandle, AggregationHandleDistinct,
    AggregationState,
};
use crate::expressions::predicate::Predicate;
use crate::expressions::scalar::Scalar;
use crate::metric::{Count, MetricsSet, Time};
use crate::proto::{self as protobuf, from_proto};
use crate::storage::bloom_filter::{BloomFilter, BloomFilterAttachment};
use crate::storage::hash_table::{
    AggregationStateHashTable, DistinctifyHashTable, HashTableImplType,
};
use crate::storage::hash_table_pool::HashTablePool;
use crate::storage::insert_destination::{InsertDestination, InsertDestinationError};
use crate::storage::partitioned_hash_table_pool::{PartitionedHashTablePool, partition_of_key};
use crate::storage::storage_manager::{BlockId, StorageError, StorageManager};

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum AggregationOperationStateError {
    #[snafu(display("Aggregation without GROUP BY should have at least one aggregate"))]
    NoAggregate,
    #[snafu(display("Failed to create the handle of the `{index}`th aggregate"))]
    CreateHandle {
        index: usize,
        source: AggregationError,
    },
    #[snafu(display("DISTINCT `{func}` should have argument"))]
    DistinctWithoutArgument { func: AggregateFunction },
    #[snafu(display("`{impl_type:?}` hash table can not be keyed by `{key_types:?}`"))]
    UnsupportedHashTableImplType {
        impl_type: HashTableImplType,
        key_types: Vec<Type>,
    },
    #[snafu(display(
        "`{num_distinct}` DISTINCT aggregates can not match `{num_impl_types}` distinctify hash table implementations"
    ))]
    InconsistentDistinctifyHashTables {
        num_distinct: usize,
        num_impl_types: usize,
    },
    #[snafu(display(
        "Bloom filter `{bloom_filter_id}` does not exist, only `{num_bloom_filters}` bloom filters are provided"
    ))]
    UnknownBloomFilter {
        bloom_filter_id: usize,
        num_bloom_filters: usize,
    },
    #[snafu(display(
        "Bloom filter can not be attached to attribute `{attribute_id}` of the relation `{relation}`"
    ))]
    UnknownBloomFilterAttribute {
        attribute_id: AttributeId,
        relation: String,
    },
    #[snafu(display("Relation `{relation_id}` does not exist"))]
    UnknownRelation { relation_id: RelationId },
    #[snafu(display("Failed to reconstruct the aggregation from proto"))]
    Proto { source: from_proto::ProtoError },
    #[snafu(display("Failed to read the input block `{block_id}`"))]
    ReadBlock {
        block_id: BlockId,
        source: StorageError,
    },
    #[snafu(display("Columns of the aggregation have different lengths"))]
    InconsistentColumns { source: InconsistentLengthError },
    #[snafu(display("Failed to insert the aggregation result into the destination"))]
    InsertResult { source: InsertDestinationError },
}

type Result<T> = std::result::Result<T, AggregationOperationStateError>;

/// Aggregate expression of the operator
#[derive(Debug, Clone)]
pub struct AggregateExpression {
    /// The function
    pub function: AggregateFunction,
    /// Arguments of the function
    pub arguments: Vec<Scalar>,
    /// Aggregate the distinct arguments only
    pub is_distinct: bool,
}

/// Everything the optimizer decides for the aggregation operator
#[derive(Debug, Clone)]
pub struct AggregationPlan {
    /// Aggregates, may be empty if there is GROUP BY
    pub aggregates: Vec<AggregateExpression>,
    /// GROUP BY expressions
    pub group_by: Vec<Scalar>,
    /// Filter of the input tuples
    pub predicate: Option<Predicate>,
    /// Bloom filters applied before aggregation
    pub bloom_filters: Vec<BloomFilterAttachment>,
    /// Estimated number of groups
    pub estimated_num_entries: usize,
    /// Implementation of the group by hash tables
    pub hash_table_impl_type: HashTableImplType,
    /// Implementation of the distinctify hash tables, one for each DISTINCT aggregate
    pub distinctify_hash_table_impl_types: Vec<HashTableImplType>,
    /// Number of the partitions of the groups. Zero and one mean the groups are not
    /// partitioned. It is ignored without GROUP BY or with DISTINCT aggregates
    pub num_partitions: usize,
}

/// Metrics of the aggregation operator
#[derive(Debug, Default, MetricsSetBuilder)]
pub struct AggregationMetrics {
    /// Number of blocks aggregated
    num_blocks: Count,
    /// Number of tuples in the aggregated blocks
    num_input_tuples: Count,
    /// Number of tuples that pass the predicate and the bloom filters
    num_selected_tuples: Count,
    /// Time spent in evaluating the predicate and probing the bloom filters
    filter_time: Time,
    /// Time spent in accumulating the selected tuples
    accumulate_time: Time,
    /// Time spent in merging the partitions and finalizing the states
    finalize_time: Time,
}

/// Group by hash tables of an aggregate
#[derive(Debug)]
enum GroupByHashTables {
    /// Tables checked out by the workers, merged in the finalization
    Pool(HashTablePool),
    /// Tables of the disjoint partitions
    Partitioned(PartitionedHashTablePool),
}

/// Aggregate of the operator
#[derive(Debug)]
struct Aggregate {
    handle: Arc<dyn AggregationHandle>,
    arguments: Vec<Scalar>,
    /// Attribute ids of the arguments if all of them read the attribute directly
    arguments_as_attributes: Option<Vec<AttributeId>>,
    distinctify_hash_table: Option<DistinctifyHashTable>,
    /// State of the aggregation without GROUP BY
    single_state: Option<AggregationState>,
    /// Tables of the aggregation with GROUP BY
    group_by_hash_tables: Option<GroupByHashTables>,
}

/// State of the aggregation operator, see the module level docs
#[derive(Debug)]
pub struct AggregationOperationState {
    input_relation: Arc<CatalogRelationSchema>,
    aggregates: Vec<Aggregate>,
    group_by: Vec<Scalar>,
    predicate: Option<Predicate>,
    bloom_filters: Vec<(Arc<dyn BloomFilter>, AttributeId)>,
    bloom_filter_batch_size: usize,
    /// Number of the partitions of the groups, one if they are not partitioned
    num_partitions: usize,
    storage_manager: Arc<StorageManager>,
    metrics: AggregationMetrics,
}

impl AggregationOperationState {
    /// Create the state of the aggregation over the `input_relation`. Bloom filters of
    /// the plan refer to `bloom_filters` by index
    pub fn try_new(
        input_relation: Arc<CatalogRelationSchema>,
        plan: AggregationPlan,
        bloom_filters: &[Arc<dyn BloomFilter>],
        storage_manager: Arc<StorageManager>,
        client_ctx: &ClientContext,
    ) -> Result<Self> {
        let AggregationPlan {
            aggregates,
            group_by,
            predicate,
            bloom_filters: attachments,
            estimated_num_entries,
            hash_table_impl_type,
            distinctify_hash_table_impl_types,
            num_partitions,
        } = plan;
        ensure!(!aggregates.is_empty() || !group_by.is_empty(), NoAggregateSnafu);

        let num_distinct = aggregates.iter().filter(|agg| agg.is_distinct).count();
        ensure!(
            num_distinct == distinctify_hash_table_impl_types.len(),
            InconsistentDistinctifyHashTablesSnafu {
                num_distinct,
                num_impl_types: distinctify_hash_table_impl_types.len()
            }
        );

        let group_by_types = group_by.iter().map(Scalar::type_).collect::<Vec<_>>();
        let check_impl_type = |impl_type: HashTableImplType, key_types: Vec<Type>| -> Result<_> {
            ensure!(
                impl_type.supports_key_types(&key_types),
                UnsupportedHashTableImplTypeSnafu {
                    impl_type,
                    key_types
                }
            );
            Ok(())
        };
        if !group_by.is_empty() {
            check_impl_type(hash_table_impl_type, group_by_types.clone())?;
        }

        let num_partitions = if num_partitions > 1 && !group_by.is_empty() && num_distinct == 0 {
            num_partitions
        } else {
            if num_partitions > 1 {
                tracing::debug!(
                    "AggregationOperationState: `{}` partitions are ignored, partitioned aggregation requires GROUP BY without DISTINCT aggregate",
                    num_partitions
                );
            }
            1
        };

        let bloom_filters = attachments
            .into_iter()
            .map(|attachment| -> Result<_> {
                let bloom_filter = bloom_filters.get(attachment.bloom_filter_id).context(
                    UnknownBloomFilterSnafu {
                        bloom_filter_id: attachment.bloom_filter_id,
                        num_bloom_filters: bloom_filters.len(),
                    },
                )?;
                ensure!(
                    input_relation.has_attribute_with_id(attachment.attribute_id),
                    UnknownBloomFilterAttributeSnafu {
                        attribute_id: attachment.attribute_id,
                        relation: input_relation.name(),
                    }
                );
                Ok((Arc::clone(bloom_filter), attachment.attribute_id))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut distinctify_impl_types = distinctify_hash_table_impl_types.into_iter();
        let mut create_aggregate = |handle: Arc<dyn AggregationHandle>,
                                    arguments: Vec<Scalar>,
                                    is_distinct: bool|
         -> Result<_> {
            let arguments_as_attributes = arguments
                .iter()
                .map(Scalar::attribute_id_for_value_accessor)
                .collect::<Option<Vec<_>>>();
            let distinctify_hash_table = match is_distinct
                .then(|| distinctify_impl_types.next())
                .flatten()
            {
                Some(impl_type) => {
                    let key_types = group_by_types
                        .iter()
                        .copied()
                        .chain(arguments.iter().map(Scalar::type_))
                        .collect::<Vec<_>>();
                    check_impl_type(impl_type, key_types.clone())?;
                    Some(handle.create_distinctify_hash_table(
                        impl_type,
                        key_types,
                        estimated_num_entries,
                        &storage_manager,
                    ))
                }
                None => None,
            };
            let (single_state, group_by_hash_tables) = if group_by.is_empty() {
                (Some(handle.create_initial_state()), None)
            } else if num_partitions > 1 {
                let pool = PartitionedHashTablePool::new(
                    estimated_num_entries,
                    num_partitions,
                    hash_table_impl_type,
                    group_by_types.clone(),
                    handle.as_ref(),
                    &storage_manager,
                );
                (None, Some(GroupByHashTables::Partitioned(pool)))
            } else {
                let pool = HashTablePool::new(
                    estimated_num_entries,
                    hash_table_impl_type,
                    group_by_types.clone(),
                    Arc::clone(&handle),
                    Arc::clone(&storage_manager),
                );
                (None, Some(GroupByHashTables::Pool(pool)))
            };
            Ok(Aggregate {
                handle,
                arguments,
                arguments_as_attributes,
                distinctify_hash_table,
                single_state,
                group_by_hash_tables,
            })
        };

        let aggregates = if aggregates.is_empty() {
            // SELECT DISTINCT, the group by keys are the result
            vec![create_aggregate(
                Arc::new(AggregationHandleDistinct::new()),
                Vec::new(),
                false,
            )?]
        } else {
            aggregates
                .into_iter()
                .enumerate()
                .map(|(index, aggregate)| -> Result<_> {
                    let AggregateExpression {
                        function,
                        arguments,
                        is_distinct,
                    } = aggregate;
                    ensure!(
                        !is_distinct || !arguments.is_empty(),
                        DistinctWithoutArgumentSnafu { func: function }
                    );
                    let argument_types = arguments.iter().map(Scalar::type_).collect::<Vec<_>>();
                    let handle = function
                        .create_handle(&argument_types)
                        .context(CreateHandleSnafu { index })?;
                    create_aggregate(handle, arguments, is_distinct)
                })
                .collect::<Result<Vec<_>>>()?
        };

        tracing::debug!(
            "AggregationOperationState: query `{}` aggregates `[{}]` of relation `{}` grouped by `{}` expressions in `{}` partitions",
            client_ctx.query_id,
            aggregates
                .iter()
                .map(|aggregate| aggregate.handle.name())
                .collect::<Vec<_>>()
                .join(", "),
            input_relation.name(),
            group_by.len(),
            num_partitions
        );

        Ok(Self {
            input_relation,
            aggregates,
            group_by,
            predicate,
            bloom_filters,
            bloom_filter_batch_size: client_ctx.exec_args.bloom_filter_batch_size.max(1),
            num_partitions,
            storage_manager,
            metrics: AggregationMetrics::default(),
        })
    }

    /// Reconstruct the state from the proto. The proto should have been checked by
    /// [`Self::proto_is_valid`]
    pub fn reconstruct_from_proto(
        proto: &protobuf::AggregationOperationState,
        database: &CatalogDatabase,
        storage_manager: Arc<StorageManager>,
        bloom_filters: &[Arc<dyn BloomFilter>],
        client_ctx: &ClientContext,
    ) -> Result<Self> {
        debug_assert!(Self::proto_is_valid(proto, database, bloom_filters.len()));

        let input_relation = database
            .get_relation_schema_by_id(proto.relation_id)
            .context(UnknownRelationSnafu {
                relation_id: proto.relation_id,
            })?;

        let aggregates = proto
            .aggregates
            .iter()
            .map(|aggregate| from_proto::aggregate_from_proto(aggregate, database))
            .collect::<from_proto::Result<Vec<_>>>()
            .context(ProtoSnafu)?;

        let group_by = proto
            .group_by_expressions
            .iter()
            .map(|scalar| from_proto::scalar_from_proto(scalar, database))
            .collect::<from_proto::Result<Vec<_>>>()
            .context(ProtoSnafu)?;

        let predicate = proto
            .predicate
            .as_ref()
            .map(|predicate| from_proto::predicate_from_proto(predicate, database))
            .transpose()
            .context(ProtoSnafu)?;

        let hash_table_impl_type = match proto.hash_table_impl_type {
            Some(impl_type) => {
                from_proto::hash_table_impl_type_from_proto(impl_type).context(ProtoSnafu)?
            }
            // Not used without GROUP BY
            None => HashTableImplType::SeparateChaining,
        };

        let distinctify_hash_table_impl_types = proto
            .distinctify_hash_table_impl_types
            .iter()
            .map(|&impl_type| from_proto::hash_table_impl_type_from_proto(impl_type))
            .collect::<from_proto::Result<Vec<_>>>()
            .context(ProtoSnafu)?;

        let plan = AggregationPlan {
            aggregates,
            group_by,
            predicate,
            bloom_filters: proto
                .bloom_filters
                .iter()
                .map(|attachment| BloomFilterAttachment {
                    bloom_filter_id: attachment.bloom_filter_id as usize,
                    attribute_id: attachment.attribute_id as AttributeId,
                })
                .collect(),
            estimated_num_entries: proto.estimated_num_entries as usize,
            hash_table_impl_type,
            distinctify_hash_table_impl_types,
            num_partitions: proto.num_partitions as usize,
        };

        Self::try_new(
            Arc::clone(input_relation),
            plan,
            bloom_filters,
            storage_manager,
            client_ctx,
        )
    }

    /// Returns true if the proto describes a valid aggregation over the `database`
    /// with `num_bloom_filters` bloom filters available
    pub fn proto_is_valid(
        proto: &protobuf::AggregationOperationState,
        database: &CatalogDatabase,
        num_bloom_filters: usize,
    ) -> bool {
        let Some(relation) = database.get_relation_schema_by_id(proto.relation_id) else {
            return false;
        };
        let scalar_is_valid = |scalar: &protobuf::Scalar| {
            from_proto::scalar_proto_is_valid(scalar, database)
                && from_proto::scalar_references_only(scalar, proto.relation_id)
        };

        let impl_type_is_valid =
            |impl_type: i32| protobuf::HashTableImplType::try_from(impl_type).is_ok();

        let num_distinctify_hash_tables = proto.distinctify_hash_table_impl_types.len();
        let mut distinctify_hash_table_impl_type_index = 0;
        for aggregate in &proto.aggregates {
            match &aggregate.function {
                Some(function) if from_proto::aggregate_function_proto_is_valid(function) => (),
                _ => return false,
            }

            if !aggregate.argument.iter().all(scalar_is_valid) {
                return false;
            }

            if aggregate.is_distinct {
                if distinctify_hash_table_impl_type_index >= num_distinctify_hash_tables
                    || !impl_type_is_valid(
                        proto.distinctify_hash_table_impl_types
                            [distinctify_hash_table_impl_type_index],
                    )
                {
                    return false;
                }
                distinctify_hash_table_impl_type_index += 1;
            }
        }
        if distinctify_hash_table_impl_type_index != num_distinctify_hash_tables {
            return false;
        }

        if !proto.group_by_expressions.iter().all(scalar_is_valid) {
            return false;
        }

        if proto.aggregates.is_empty() && proto.group_by_expressions.is_empty() {
            return false;
        }

        if !proto.group_by_expressions.is_empty() {
            match proto.hash_table_impl_type {
                Some(impl_type) if impl_type_is_valid(impl_type) => (),
                _ => return false,
            }
        }

        // Implementations of the hash tables should support their keys
        let scalar_types = |scalars: &[protobuf::Scalar]| {
            scalars
                .iter()
                .map(|scalar| from_proto::scalar_from_proto(scalar, database).map(|s| s.type_()))
                .collect::<from_proto::Result<Vec<_>>>()
                .ok()
        };
        let supports_key_types = |impl_type: i32, key_types: &[Type]| {
            from_proto::hash_table_impl_type_from_proto(impl_type)
                .is_ok_and(|impl_type| impl_type.supports_key_types(key_types))
        };
        let Some(group_by_types) = scalar_types(&proto.group_by_expressions) else {
            return false;
        };
        if let Some(impl_type) = proto.hash_table_impl_type {
            if !group_by_types.is_empty() && !supports_key_types(impl_type, &group_by_types) {
                return false;
            }
        }
        let distinct_aggregates = proto.aggregates.iter().filter(|aggregate| aggregate.is_distinct);
        for (aggregate, &impl_type) in distinct_aggregates.zip(&proto.distinctify_hash_table_impl_types)
        {
            let Some(argument_types) = scalar_types(&aggregate.argument) else {
                return false;
            };
            let key_types = group_by_types
                .iter()
                .copied()
                .chain(argument_types)
                .collect::<Vec<_>>();
            if !supports_key_types(impl_type, &key_types) {
                return false;
            }
        }

        if let Some(predicate) = &proto.predicate {
            if !from_proto::predicate_proto_is_valid(predicate, database)
                || !from_proto::predicate_references_only(predicate, proto.relation_id)
            {
                return false;
            }
        }

        proto.bloom_filters.iter().all(|attachment| {
            (attachment.bloom_filter_id as usize) < num_bloom_filters
                && relation.has_attribute_with_id(attachment.attribute_id as AttributeId)
        })
    }

    /// Snapshot of the metrics
    pub fn metrics(&self) -> MetricsSet {
        self.metrics.metrics_set()
    }

    /// Aggregate the block of the input relation. It can be called concurrently
    pub fn aggregate_block(&self, block_id: BlockId) -> Result<()> {
        let block = self
            .storage_manager
            .get_block(block_id, self.input_relation.id())
            .context(ReadBlockSnafu { block_id })?;
        let num_tuples = block.num_tuples();
        let mut accessor = block.create_value_accessor();

        let mut filter_time = Duration::default();
        let matches = {
            let _guard = ScopedTimerGuard::new(&mut filter_time);
            self.filter(&mut accessor, num_tuples)
        };

        let mut filtered;
        let accessor: &mut dyn ValueAccessor = match &matches {
            Some(matches) => {
                filtered = TupleIdSequenceAdapter::new(accessor, matches);
                &mut filtered
            }
            None => &mut accessor,
        };
        let num_selected_tuples = accessor.num_tuples();

        let mut accumulate_time = Duration::default();
        {
            let _guard = ScopedTimerGuard::new(&mut accumulate_time);
            if self.group_by.is_empty() {
                self.aggregate_block_single_state(accessor)?;
            } else {
                self.aggregate_block_hash_table(accessor)?;
            }
        }

        tracing::debug!(
            "AggregationOperationState: aggregate `{}` of `{}` tuples in block `{}`. Filter time: `{:?}`, accumulate time: `{:?}`",
            num_selected_tuples,
            num_tuples,
            block_id,
            filter_time,
            accumulate_time
        );
        self.metrics.num_blocks.add(1);
        self.metrics.num_input_tuples.add(num_tuples as u64);
        self.metrics
            .num_selected_tuples
            .add(num_selected_tuples as u64);
        self.metrics.filter_time.add_duration(filter_time);
        self.metrics.accumulate_time.add_duration(accumulate_time);
        Ok(())
    }

    /// Evaluate the predicate and apply the bloom filters. `None` means all of the
    /// tuples are selected
    fn filter(
        &self,
        accessor: &mut ColumnVectorsValueAccessor,
        num_tuples: usize,
    ) -> Option<TupleIdSequence> {
        let matches = self
            .predicate
            .as_ref()
            .map(|predicate| predicate.get_all_matches(accessor, num_tuples));
        if self.bloom_filters.is_empty() {
            return matches;
        }

        let mut matches = matches.unwrap_or_else(|| TupleIdSequence::all(num_tuples));
        let candidates = matches.clone();
        let mut candidates = candidates.iter();
        let mut batch_size = self.bloom_filter_batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        loop {
            batch.clear();
            batch.extend(candidates.by_ref().take(batch_size));
            if batch.is_empty() {
                break;
            }
            for (bloom_filter, attribute_id) in &self.bloom_filters {
                bloom_filter.filter_batch(&*accessor, *attribute_id, &batch, &mut matches);
                batch.retain(|&tuple_id| matches.get(tuple_id));
            }
            batch_size = batch_size.saturating_mul(2);
        }
        Some(matches)
    }

    /// Materialize the scalars into columns
    fn evaluate_columns(scalars: &[Scalar], accessor: &mut dyn ValueAccessor) -> Vec<Arc<ColumnVector>> {
        scalars
            .iter()
            .map(|scalar| Arc::new(scalar.get_all_values(accessor)))
            .collect()
    }

    fn aggregate_block_single_state(&self, accessor: &mut dyn ValueAccessor) -> Result<()> {
        for aggregate in &self.aggregates {
            let handle = &aggregate.handle;
            let Some(single_state) = &aggregate.single_state else {
                unreachable!("Aggregation without GROUP BY always has the single state")
            };

            if let Some(distinctify_hash_table) = &aggregate.distinctify_hash_table {
                match &aggregate.arguments_as_attributes {
                    Some(argument_ids) => handle.insert_value_accessor_into_distinctify_hash_table(
                        accessor,
                        argument_ids,
                        distinctify_hash_table,
                    ),
                    None => {
                        let mut arguments = ColumnVectorsValueAccessor::try_new(
                            Self::evaluate_columns(&aggregate.arguments, accessor),
                        )
                        .context(InconsistentColumnsSnafu)?;
                        let argument_ids = (0..aggregate.arguments.len()).collect::<Vec<_>>();
                        handle.insert_value_accessor_into_distinctify_hash_table(
                            &mut arguments,
                            &argument_ids,
                            distinctify_hash_table,
                        );
                    }
                }
                continue;
            }

            let local_state = if aggregate.arguments.is_empty() {
                handle.accumulate_nullary(accessor.num_tuples())
            } else if let Some(argument_ids) = &aggregate.arguments_as_attributes {
                // Copy elision, read the arguments from the block directly
                handle.accumulate_value_accessor(accessor, argument_ids)
            } else {
                handle.accumulate_column_vectors(&Self::evaluate_columns(
                    &aggregate.arguments,
                    accessor,
                ))
            };
            handle.merge_states(&local_state, single_state);
        }
        Ok(())
    }

    fn aggregate_block_hash_table(&self, accessor: &mut dyn ValueAccessor) -> Result<()> {
        // Group by keys are evaluated once and shared by all of the aggregates
        let group_by_columns = Self::evaluate_columns(&self.group_by, accessor);
        let num_group_by_keys = group_by_columns.len();
        let group_by_key_ids = (0..num_group_by_keys).collect::<Vec<_>>();
        let partitions = (self.num_partitions > 1)
            .then(|| Self::partition_tuples(&group_by_columns, self.num_partitions));

        for aggregate in &self.aggregates {
            let handle = &aggregate.handle;
            let Some(group_by_hash_tables) = &aggregate.group_by_hash_tables else {
                unreachable!("Aggregation with GROUP BY always has the group by hash tables")
            };

            let argument_columns = Self::evaluate_columns(&aggregate.arguments, accessor);
            let argument_ids = (num_group_by_keys..num_group_by_keys + argument_columns.len())
                .collect::<Vec<_>>();
            let mut columns = ColumnVectorsValueAccessor::try_new(
                group_by_columns.iter().cloned().chain(argument_columns),
            )
            .context(InconsistentColumnsSnafu)?;

            let hash_table_pool = match group_by_hash_tables {
                GroupByHashTables::Pool(hash_table_pool) => hash_table_pool,
                GroupByHashTables::Partitioned(partitioned_pool) => {
                    let Some(partitions) = &partitions else {
                        unreachable!("Tuples are partitioned for the partitioned aggregation")
                    };
                    partitions
                        .iter()
                        .enumerate()
                        .filter(|(_, partition)| !partition.is_empty())
                        .for_each(|(partition_id, partition)| {
                            let mut partition =
                                TupleIdSequenceAdapter::new(columns.clone(), partition);
                            handle.aggregate_value_accessor_into_hash_table(
                                &mut partition,
                                &argument_ids,
                                &group_by_key_ids,
                                partitioned_pool.get_hash_table(partition_id),
                            );
                        });
                    continue;
                }
            };

            let hash_table = hash_table_pool.get_hash_table();
            match &aggregate.distinctify_hash_table {
                Some(distinctify_hash_table) => {
                    let key_ids = (0..num_group_by_keys + aggregate.arguments.len())
                        .collect::<Vec<_>>();
                    handle.insert_value_accessor_into_distinctify_hash_table(
                        &mut columns,
                        &key_ids,
                        distinctify_hash_table,
                    );
                    // Groups whose arguments are all NULL still produce a result
                    let upserted = hash_table.upsert_value_accessor_composite_key(
                        &mut columns,
                        &group_by_key_ids,
                        true,
                        &handle.create_initial_state(),
                        |_, _| {},
                    );
                    debug_assert!(upserted, "Resizable hash table never runs out of space");
                }
                None => handle.aggregate_value_accessor_into_hash_table(
                    &mut columns,
                    &argument_ids,
                    &group_by_key_ids,
                    &hash_table,
                ),
            }
            hash_table_pool.return_hash_table(hash_table);
        }
        Ok(())
    }

    /// Split the tuples by the partition of their group by keys
    fn partition_tuples(
        group_by_columns: &[Arc<ColumnVector>],
        num_partitions: usize,
    ) -> Vec<TupleIdSequence> {
        let num_tuples = group_by_columns.first().map_or(0, |column| column.len());
        let mut partitions = vec![TupleIdSequence::new(num_tuples); num_partitions];
        let mut key = Vec::with_capacity(group_by_columns.len());
        (0..num_tuples).for_each(|tuple_id| {
            key.clear();
            key.extend(
                group_by_columns
                    .iter()
                    .map(|column| column.get_typed_value(tuple_id)),
            );
            partitions[partition_of_key(&key, num_partitions)].set(tuple_id, true);
        });
        partitions
    }

    /// Number of the partitions that can be finalized independently. It is one if the
    /// groups are not partitioned
    pub fn num_finalization_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Produce the result into the `destination`. It should be called exactly once,
    /// after all of the blocks are aggregated
    pub fn finalize_aggregate(&mut self, destination: &dyn InsertDestination) -> Result<()> {
        let mut finalize_time = Duration::default();
        let result = {
            let _guard = ScopedTimerGuard::new(&mut finalize_time);
            if self.group_by.is_empty() {
                self.finalize_single_state(destination)
            } else if self.num_partitions > 1 {
                (0..self.num_partitions)
                    .into_par_iter()
                    .try_for_each(|partition_id| {
                        self.finalize_partition(partition_id, destination)
                    })
            } else {
                self.finalize_hash_table(destination)
            }
        };
        tracing::debug!(
            "AggregationOperationState: finalize `{}` aggregates in `{:?}`",
            self.aggregates.len(),
            finalize_time
        );
        self.metrics.finalize_time.add_duration(finalize_time);
        result
    }

    /// Produce the groups of the partition into the `destination`. Partitions are
    /// disjoint, so they can be finalized concurrently. Each partition should be
    /// finalized exactly once, after all of the blocks are aggregated
    ///
    /// # Panics
    ///
    /// Panics if `partition_id` is not less than [`Self::num_finalization_partitions`]
    /// or the groups are not partitioned
    pub fn finalize_aggregate_partition(
        &self,
        partition_id: usize,
        destination: &dyn InsertDestination,
    ) -> Result<()> {
        assert!(
            self.num_partitions > 1,
            "Finalize a partition of the aggregation whose groups are not partitioned"
        );
        let mut finalize_time = Duration::default();
        let result = {
            let _guard = ScopedTimerGuard::new(&mut finalize_time);
            self.finalize_partition(partition_id, destination)
        };
        tracing::debug!(
            "AggregationOperationState: finalize partition `{}` of `{}` aggregates in `{:?}`",
            partition_id,
            self.aggregates.len(),
            finalize_time
        );
        self.metrics.finalize_time.add_duration(finalize_time);
        result
    }

    fn finalize_single_state(&self, destination: &dyn InsertDestination) -> Result<()> {
        let values = self
            .aggregates
            .iter()
            .map(|aggregate| {
                let handle = &aggregate.handle;
                let Some(single_state) = &aggregate.single_state else {
                    unreachable!("Aggregation without GROUP BY always has the single state")
                };
                if let Some(distinctify_hash_table) = &aggregate.distinctify_hash_table {
                    let state =
                        handle.aggregate_on_distinctify_hash_table_for_single(distinctify_hash_table);
                    handle.merge_states(&state, single_state);
                }
                handle.finalize(single_state)
            })
            .collect();
        destination
            .insert_tuple(Tuple::new(values))
            .context(InsertResultSnafu)
    }

    fn finalize_hash_table(&mut self, destination: &dyn InsertDestination) -> Result<()> {
        // Aggregates are merged in parallel, tables of an aggregate are merged into the
        // last one sequentially
        self.aggregates.par_iter_mut().for_each(|aggregate| {
            let handle = &aggregate.handle;
            let Some(GroupByHashTables::Pool(hash_table_pool)) = &mut aggregate.group_by_hash_tables
            else {
                unreachable!("Aggregation that is not partitioned always has the hash table pool")
            };
            if hash_table_pool.get_all_hash_tables().is_empty() {
                // No block is aggregated
                let hash_table = hash_table_pool.get_hash_table();
                hash_table_pool.return_hash_table(hash_table);
            }
            let hash_tables = hash_table_pool.get_all_hash_tables();
            let num_hash_tables = hash_tables.len();
            if let Some((last, rest)) = hash_tables.split_last() {
                rest.iter()
                    .for_each(|hash_table| handle.merge_group_by_hash_tables(hash_table, last));
                if let Some(distinctify_hash_table) = &aggregate.distinctify_hash_table {
                    handle.aggregate_on_distinctify_hash_table_for_group_by(
                        distinctify_hash_table,
                        last,
                    );
                }
                tracing::trace!(
                    "AggregationOperationState: merge `{}` hash tables of `{}` into `{}` groups",
                    num_hash_tables,
                    handle.name(),
                    last.num_entries()
                );
            }
        });

        let merged = self
            .aggregates
            .iter_mut()
            .map(|aggregate| {
                let Aggregate {
                    handle,
                    group_by_hash_tables,
                    ..
                } = aggregate;
                let Some(GroupByHashTables::Pool(hash_table_pool)) = group_by_hash_tables else {
                    unreachable!("Aggregation that is not partitioned always has the hash table pool")
                };
                (&*handle, hash_table_pool.get_all_hash_tables().last())
            })
            .collect::<Vec<_>>();
        Self::finalize_groups(&self.group_by, merged, destination)
    }

    fn finalize_partition(
        &self,
        partition_id: usize,
        destination: &dyn InsertDestination,
    ) -> Result<()> {
        let partitions = self.aggregates.iter().map(|aggregate| {
            let Some(GroupByHashTables::Partitioned(partitioned_pool)) =
                &aggregate.group_by_hash_tables
            else {
                unreachable!("Partitioned aggregation always has the partitioned pool")
            };
            (
                &aggregate.handle,
                Some(partitioned_pool.get_hash_table(partition_id)),
            )
        });
        Self::finalize_groups(&self.group_by, partitions, destination)
    }

    /// Finalize the groups of the tables, one table for each aggregate. All of the
    /// tables hold the same groups
    fn finalize_groups<'a>(
        group_by: &[Scalar],
        hash_tables: impl IntoIterator<
            Item = (&'a Arc<dyn AggregationHandle>, Option<&'a AggregationStateHashTable>),
        >,
        destination: &dyn InsertDestination,
    ) -> Result<()> {
        let mut group_by_keys: Vec<Vec<TypedValue>> = Vec::new();
        let mut result_columns = Vec::new();
        for (handle, hash_table) in hash_tables {
            let column = hash_table
                .and_then(|hash_table| handle.finalize_hash_table(hash_table, &mut group_by_keys));
            if let Some(column) = column {
                result_columns.push(Arc::new(column));
            }
        }

        // Row major group by keys to columns
        let group_by_columns = group_by.iter().enumerate().map(|(index, scalar)| {
            Arc::new(ColumnVector::from_values(
                scalar.type_(),
                group_by_keys.iter().map(|key| key[index].clone()),
            ))
        });
        let mut result = ColumnVectorsValueAccessor::try_new(group_by_columns.chain(result_columns))
            .context(InconsistentColumnsSnafu)?;
        destination
            .bulk_insert_tuples(&mut result)
            .context(InsertResultSnafu)
    }

    /// Types of the result tuple: the group by keys followed by the aggregates
    pub fn result_types(&self) -> Vec<Type> {
        let aggregate_types = self
            .aggregates
            .iter()
            .filter(|aggregate| aggregate.handle.has_result_column())
            .map(|aggregate| aggregate.handle.result_type());
        self.group_by
            .iter()
            .map(Scalar::type_)
            .chain(aggregate_types)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogRelationSchema;
    use crate::common::client_context::tests::mock_client_context;
    use crate::expressions::predicate::ComparisonId;
    use crate::expressions::scalar::BinaryOperationId;
    use crate::proto::from_proto::tests::{attribute_proto, int_literal_proto};
    use crate::storage::bloom_filter::BitsetBloomFilter;
    use crate::storage::insert_destination::MemoryInsertDestination;
    use stratum_block::types::TypeId;
    use tracing_subscriber::EnvFilter;

    const RELATION_ID: RelationId = 3;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Relation `t(g Int, x Int NULL, s VarChar(8))`
    fn relation() -> Arc<CatalogRelationSchema> {
        Arc::new(CatalogRelationSchema::new(
            RELATION_ID,
            "t",
            [
                ("g", Type::int(false)),
                ("x", Type::int(true)),
                ("s", Type::var_char(8, false)),
            ],
        ))
    }

    fn attribute(relation: &CatalogRelationSchema, id: AttributeId) -> Scalar {
        Scalar::attribute(&relation.attributes()[id])
    }

    fn create_block(
        storage_manager: &StorageManager,
        rows: &[(i32, Option<i32>, &str)],
    ) -> BlockId {
        storage_manager
            .create_block(
                RELATION_ID,
                vec![
                    ColumnVector::from_values(
                        Type::int(false),
                        rows.iter().map(|row| TypedValue::Int(row.0)),
                    ),
                    ColumnVector::from_values(
                        Type::int(true),
                        rows.iter().map(|row| match row.1 {
                            Some(x) => TypedValue::Int(x),
                            None => TypedValue::Null(TypeId::Int),
                        }),
                    ),
                    ColumnVector::from_values(
                        Type::var_char(8, false),
                        rows.iter().map(|row| TypedValue::from(row.2)),
                    ),
                ],
            )
            .unwrap()
    }

    fn plan(aggregates: Vec<AggregateExpression>, group_by: Vec<Scalar>) -> AggregationPlan {
        let num_distinct = aggregates.iter().filter(|agg| agg.is_distinct).count();
        AggregationPlan {
            aggregates,
            group_by,
            predicate: None,
            bloom_filters: vec![],
            estimated_num_entries: 4,
            hash_table_impl_type: HashTableImplType::SeparateChaining,
            distinctify_hash_table_impl_types: vec![HashTableImplType::SeparateChaining; num_distinct],
            num_partitions: 1,
        }
    }

    fn aggregate(function: AggregateFunction, arguments: Vec<Scalar>) -> AggregateExpression {
        AggregateExpression {
            function,
            arguments,
            is_distinct: false,
        }
    }

    fn sorted_rows(destination: &MemoryInsertDestination) -> Vec<String> {
        let mut rows = destination
            .take_tuples()
            .into_iter()
            .map(|tuple| {
                let values = tuple.values().iter().map(ToString::to_string).collect::<Vec<_>>();
                format!("({})", values.join(", "))
            })
            .collect::<Vec<_>>();
        rows.sort();
        rows
    }

    #[test]
    fn test_sum_distinct_group_by() {
        init_tracing();
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let blocks = [
            create_block(&storage_manager, &[(1, Some(2), "a"), (1, Some(2), "b")]),
            create_block(&storage_manager, &[(1, Some(3), "c"), (2, Some(5), "d")]),
        ];
        let mut sum_distinct = aggregate(AggregateFunction::Sum, vec![attribute(&relation, 1)]);
        sum_distinct.is_distinct = true;
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(vec![sum_distinct], vec![attribute(&relation, 0)]),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();

        std::thread::scope(|s| {
            blocks.iter().for_each(|&block_id| {
                let state = &state;
                s.spawn(move || state.aggregate_block(block_id).unwrap());
            });
        });

        let destination = MemoryInsertDestination::new(2);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), ["(1, 5)", "(2, 5)"]);
        assert_eq!(state.result_types(), [Type::int(false), Type::long(true)]);
    }

    #[test]
    fn test_aggregate_without_group_by() {
        init_tracing();
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let blocks = [
            create_block(&storage_manager, &[(1, Some(1), "a"), (2, None, "b")]),
            create_block(&storage_manager, &[(3, Some(3), "c")]),
            create_block(&storage_manager, &[]),
        ];
        let mut count_distinct = aggregate(AggregateFunction::Count, vec![attribute(&relation, 2)]);
        count_distinct.is_distinct = true;
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(
                vec![
                    aggregate(AggregateFunction::Count, vec![]),
                    aggregate(AggregateFunction::Count, vec![attribute(&relation, 1)]),
                    aggregate(AggregateFunction::Avg, vec![attribute(&relation, 1)]),
                    aggregate(AggregateFunction::Min, vec![attribute(&relation, 2)]),
                    aggregate(AggregateFunction::Max, vec![attribute(&relation, 0)]),
                    count_distinct,
                ],
                vec![],
            ),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        blocks
            .iter()
            .for_each(|&block_id| state.aggregate_block(block_id).unwrap());

        let destination = MemoryInsertDestination::new(6);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), ["(3, 2, 2.0, a, 3, 3)"]);

        let metrics = state.metrics();
        assert_eq!(metrics.metrics["num_blocks"], crate::metric::MetricValue::Count(3));
        assert_eq!(metrics.metrics["num_input_tuples"], crate::metric::MetricValue::Count(3));
    }

    #[test]
    fn test_copy_elision_matches_materialized_arguments() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let block = create_block(
            &storage_manager,
            &[(1, Some(4), "a"), (2, None, "b"), (3, Some(-1), "c")],
        );
        // `x + 0` is evaluated into a temporary column, `x` is read from the block
        let x_plus_zero = Scalar::try_new_binary(
            BinaryOperationId::Add,
            attribute(&relation, 1),
            Scalar::literal(TypedValue::Int(0), Type::int(false)),
        )
        .unwrap();
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(
                vec![
                    aggregate(AggregateFunction::Sum, vec![attribute(&relation, 1)]),
                    aggregate(AggregateFunction::Sum, vec![x_plus_zero.clone()]),
                    aggregate(AggregateFunction::Count, vec![attribute(&relation, 1)]),
                    aggregate(AggregateFunction::Count, vec![x_plus_zero]),
                ],
                vec![],
            ),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        state.aggregate_block(block).unwrap();

        let destination = MemoryInsertDestination::new(4);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), ["(3, 3, 2, 2)"]);
    }

    #[test]
    fn test_predicate_and_bloom_filter() {
        init_tracing();
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let rows = (0..100)
            .map(|i| (i % 4, Some(i), "s"))
            .collect::<Vec<_>>();
        let block = create_block(&storage_manager, &rows);

        // Only the even `x` pass the bloom filter
        let mut bloom_filter = BitsetBloomFilter::with_false_positive_probability(50, 0.0001);
        (0..100)
            .step_by(2)
            .for_each(|x| bloom_filter.insert(&TypedValue::Int(x)));
        let bloom_filters: Vec<Arc<dyn BloomFilter>> = vec![Arc::new(bloom_filter)];

        let mut plan = plan(
            vec![aggregate(AggregateFunction::Count, vec![])],
            vec![attribute(&relation, 0)],
        );
        // x < 50
        plan.predicate = Some(
            Predicate::try_new_comparison(
                ComparisonId::Less,
                attribute(&relation, 1),
                Scalar::literal(TypedValue::Int(50), Type::int(false)),
            )
            .unwrap(),
        );
        plan.bloom_filters = vec![BloomFilterAttachment {
            bloom_filter_id: 0,
            attribute_id: 1,
        }];
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan,
            &bloom_filters,
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        state.aggregate_block(block).unwrap();

        let destination = MemoryInsertDestination::new(2);
        state.finalize_aggregate(&destination).unwrap();
        // Even numbers below 50 are 0, 2 mod 4
        assert_eq!(sorted_rows(&destination), ["(0, 13)", "(2, 12)"]);
        assert_eq!(
            state.metrics().metrics["num_selected_tuples"],
            crate::metric::MetricValue::Count(25)
        );
    }

    #[test]
    fn test_select_distinct_and_empty_input() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let group_by = vec![attribute(&relation, 0), attribute(&relation, 2)];
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(vec![], group_by.clone()),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        assert_eq!(
            state.result_types(),
            [Type::int(false), Type::var_char(8, false)]
        );
        let block = create_block(
            &storage_manager,
            &[(1, None, "a"), (1, Some(1), "a"), (2, None, "a"), (1, None, "b")],
        );
        state.aggregate_block(block).unwrap();
        let destination = MemoryInsertDestination::new(2);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), ["(1, a)", "(1, b)", "(2, a)"]);

        // No block is aggregated
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(vec![aggregate(AggregateFunction::Count, vec![])], group_by),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        let destination = MemoryInsertDestination::new(3);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(destination.num_tuples(), 0);
    }

    #[test]
    fn test_group_by_with_many_aggregates() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let blocks = (0..8)
            .map(|b| {
                let rows = (0..50)
                    .map(|i| (i % 5, if i % 10 == 0 { None } else { Some(b) }, "s"))
                    .collect::<Vec<_>>();
                create_block(&storage_manager, &rows)
            })
            .collect::<Vec<_>>();
        let mut count_distinct = aggregate(AggregateFunction::Count, vec![attribute(&relation, 1)]);
        count_distinct.is_distinct = true;
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(
                vec![
                    aggregate(AggregateFunction::Count, vec![]),
                    aggregate(AggregateFunction::Sum, vec![attribute(&relation, 1)]),
                    count_distinct,
                ],
                vec![attribute(&relation, 0)],
            ),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();

        std::thread::scope(|s| {
            blocks.chunks(2).for_each(|chunk| {
                let state = &state;
                s.spawn(move || {
                    chunk
                        .iter()
                        .for_each(|&block_id| state.aggregate_block(block_id).unwrap())
                });
            });
        });

        let destination = MemoryInsertDestination::new(4);
        state.finalize_aggregate(&destination).unwrap();
        // Half of the tuples in group 0 have NULL `x`
        assert_eq!(
            sorted_rows(&destination),
            [
                "(0, 80, 140, 8)",
                "(1, 80, 280, 8)",
                "(2, 80, 280, 8)",
                "(3, 80, 280, 8)",
                "(4, 80, 280, 8)"
            ]
        );
    }

    #[test]
    fn test_all_null_distinct_group() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let block = create_block(&storage_manager, &[(1, None, "a"), (2, Some(7), "b")]);
        let mut sum_distinct = aggregate(AggregateFunction::Sum, vec![attribute(&relation, 1)]);
        sum_distinct.is_distinct = true;
        let mut count_distinct = aggregate(AggregateFunction::Count, vec![attribute(&relation, 1)]);
        count_distinct.is_distinct = true;
        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(vec![sum_distinct, count_distinct], vec![attribute(&relation, 0)]),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        state.aggregate_block(block).unwrap();
        let destination = MemoryInsertDestination::new(3);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), ["(1, Null, 0)", "(2, 7, 1)"]);
    }

    #[test]
    fn test_try_new_errors() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let try_new = |plan: AggregationPlan| {
            AggregationOperationState::try_new(
                Arc::clone(&relation),
                plan,
                &[],
                Arc::clone(&storage_manager),
                &mock_client_context(),
            )
            .unwrap_err()
        };

        let error = try_new(plan(vec![], vec![]));
        let expect =
            expect_test::expect!["Aggregation without GROUP BY should have at least one aggregate"];
        expect.assert_eq(&error.to_string());

        let mut bad_plan = plan(vec![aggregate(AggregateFunction::Count, vec![])], vec![]);
        bad_plan.distinctify_hash_table_impl_types = vec![HashTableImplType::SeparateChaining];
        let error = try_new(bad_plan);
        let expect = expect_test::expect![
            "`0` DISTINCT aggregates can not match `1` distinctify hash table implementations"
        ];
        expect.assert_eq(&error.to_string());

        let mut bad_plan = plan(vec![aggregate(AggregateFunction::Count, vec![])], vec![]);
        bad_plan.bloom_filters = vec![BloomFilterAttachment {
            bloom_filter_id: 1,
            attribute_id: 0,
        }];
        let error = try_new(bad_plan);
        let expect = expect_test::expect![
            "Bloom filter `1` does not exist, only `0` bloom filters are provided"
        ];
        expect.assert_eq(&error.to_string());

        let error = try_new(plan(
            vec![aggregate(AggregateFunction::Avg, vec![attribute(&relation, 2)])],
            vec![],
        ));
        assert!(matches!(
            error,
            AggregationOperationStateError::CreateHandle { index: 0, .. }
        ));
    }

    #[test]
    fn test_simple_scalar_requires_single_integer_key() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let try_new = |plan: AggregationPlan| {
            AggregationOperationState::try_new(
                Arc::clone(&relation),
                plan,
                &[],
                Arc::clone(&storage_manager),
                &mock_client_context(),
            )
        };

        let mut bad_plan = plan(
            vec![aggregate(AggregateFunction::Count, vec![])],
            vec![attribute(&relation, 2)],
        );
        bad_plan.hash_table_impl_type = HashTableImplType::SimpleScalarSeparateChaining;
        let error = try_new(bad_plan).unwrap_err();
        assert!(matches!(
            error,
            AggregationOperationStateError::UnsupportedHashTableImplType {
                impl_type: HashTableImplType::SimpleScalarSeparateChaining,
                ..
            }
        ));

        // Distinctify keys are the group by keys followed by the argument
        let mut count_distinct = aggregate(AggregateFunction::Count, vec![attribute(&relation, 1)]);
        count_distinct.is_distinct = true;
        let mut bad_plan = plan(vec![count_distinct], vec![attribute(&relation, 0)]);
        bad_plan.hash_table_impl_type = HashTableImplType::SimpleScalarSeparateChaining;
        bad_plan.distinctify_hash_table_impl_types =
            vec![HashTableImplType::SimpleScalarSeparateChaining];
        let error = try_new(bad_plan).unwrap_err();
        assert!(matches!(
            error,
            AggregationOperationStateError::UnsupportedHashTableImplType { ref key_types, .. }
                if key_types.len() == 2
        ));

        let mut simple_scalar_plan = plan(
            vec![aggregate(AggregateFunction::Sum, vec![attribute(&relation, 1)])],
            vec![attribute(&relation, 0)],
        );
        simple_scalar_plan.hash_table_impl_type = HashTableImplType::SimpleScalarSeparateChaining;
        let mut state = try_new(simple_scalar_plan).unwrap();
        let block = create_block(
            &storage_manager,
            &[(-1, Some(2), "a"), (i32::MAX, Some(3), "b"), (-1, None, "c"), (0, Some(4), "d")],
        );
        state.aggregate_block(block).unwrap();
        let destination = MemoryInsertDestination::new(2);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(
            sorted_rows(&destination),
            ["(-1, 2)", "(0, 4)", "(2147483647, 3)"]
        );
    }

    fn aggregate_blocks_in_parallel(state: &AggregationOperationState, blocks: &[BlockId]) {
        std::thread::scope(|s| {
            blocks.chunks(2).for_each(|chunk| {
                s.spawn(move || {
                    chunk
                        .iter()
                        .for_each(|&block_id| state.aggregate_block(block_id).unwrap())
                });
            });
        });
    }

    #[test]
    fn test_partitioned_group_by() {
        init_tracing();
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let blocks = (0..8)
            .map(|b| {
                let rows = (0..50)
                    .map(|i| (i % 5, if i % 10 == 0 { None } else { Some(b) }, "s"))
                    .collect::<Vec<_>>();
                create_block(&storage_manager, &rows)
            })
            .collect::<Vec<_>>();
        let partitioned_plan = |num_partitions: usize| {
            let mut plan = plan(
                vec![
                    aggregate(AggregateFunction::Count, vec![]),
                    aggregate(AggregateFunction::Sum, vec![attribute(&relation, 1)]),
                ],
                vec![attribute(&relation, 0)],
            );
            plan.hash_table_impl_type = HashTableImplType::SimpleScalarSeparateChaining;
            plan.num_partitions = num_partitions;
            plan
        };
        let expected = ["(0, 80, 140)", "(1, 80, 280)", "(2, 80, 280)", "(3, 80, 280)", "(4, 80, 280)"];

        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            partitioned_plan(1),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        assert_eq!(state.num_finalization_partitions(), 1);
        aggregate_blocks_in_parallel(&state, &blocks);
        let destination = MemoryInsertDestination::new(3);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), expected);

        let mut state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            partitioned_plan(3),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        assert_eq!(state.num_finalization_partitions(), 3);
        aggregate_blocks_in_parallel(&state, &blocks);
        let destination = MemoryInsertDestination::new(3);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), expected);

        // Partitions are finalized independently into the same destination
        let state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            partitioned_plan(4),
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        aggregate_blocks_in_parallel(&state, &blocks);
        let destination = MemoryInsertDestination::new(3);
        std::thread::scope(|s| {
            (0..state.num_finalization_partitions()).for_each(|partition_id| {
                let state = &state;
                let destination = &destination;
                s.spawn(move || {
                    state
                        .finalize_aggregate_partition(partition_id, destination)
                        .unwrap()
                });
            });
        });
        assert_eq!(sorted_rows(&destination), expected);
    }

    #[test]
    fn test_partitions_are_ignored_with_distinct() {
        let relation = relation();
        let storage_manager = Arc::new(StorageManager::new());
        let mut count_distinct = aggregate(AggregateFunction::Count, vec![attribute(&relation, 1)]);
        count_distinct.is_distinct = true;
        let mut distinct_plan = plan(vec![count_distinct], vec![attribute(&relation, 0)]);
        distinct_plan.num_partitions = 4;
        let state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            distinct_plan,
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        assert_eq!(state.num_finalization_partitions(), 1);

        let mut scalar_plan = plan(vec![aggregate(AggregateFunction::Count, vec![])], vec![]);
        scalar_plan.num_partitions = 4;
        let state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            scalar_plan,
            &[],
            Arc::clone(&storage_manager),
            &mock_client_context(),
        )
        .unwrap();
        assert_eq!(state.num_finalization_partitions(), 1);
    }

    #[test]
    #[should_panic(expected = "groups are not partitioned")]
    fn test_finalize_partition_of_unpartitioned_aggregation() {
        let relation = relation();
        let state = AggregationOperationState::try_new(
            Arc::clone(&relation),
            plan(
                vec![aggregate(AggregateFunction::Count, vec![])],
                vec![attribute(&relation, 0)],
            ),
            &[],
            Arc::new(StorageManager::new()),
            &mock_client_context(),
        )
        .unwrap();
        let _ = state.finalize_aggregate_partition(0, &MemoryInsertDestination::new(2));
    }

    fn database() -> CatalogDatabase {
        let mut database = CatalogDatabase::new("default");
        database
            .add_relation(CatalogRelationSchema::clone(&relation()))
            .unwrap();
        database
    }

    /// `SELECT g, SUM(DISTINCT x), COUNT(*) FROM t WHERE x > 0 GROUP BY g`
    fn valid_proto() -> protobuf::AggregationOperationState {
        protobuf::AggregationOperationState {
            relation_id: RELATION_ID,
            aggregates: vec![
                protobuf::Aggregate {
                    function: Some(protobuf::AggregateFunction {
                        aggregation_id: protobuf::AggregationId::Sum as i32,
                    }),
                    argument: vec![attribute_proto(RELATION_ID, 1)],
                    is_distinct: true,
                },
                protobuf::Aggregate {
                    function: Some(protobuf::AggregateFunction {
                        aggregation_id: protobuf::AggregationId::Count as i32,
                    }),
                    argument: vec![],
                    is_distinct: false,
                },
            ],
            group_by_expressions: vec![attribute_proto(RELATION_ID, 0)],
            predicate: Some(protobuf::Predicate {
                predicate_type: protobuf::PredicateType::Comparison as i32,
                comparison: protobuf::ComparisonId::Greater as i32,
                left: Some(attribute_proto(RELATION_ID, 1)),
                right: Some(int_literal_proto(0)),
                operands: vec![],
            }),
            estimated_num_entries: 16,
            hash_table_impl_type: Some(protobuf::HashTableImplType::SeparateChaining as i32),
            distinctify_hash_table_impl_types: vec![
                protobuf::HashTableImplType::SeparateChaining as i32,
            ],
            bloom_filters: vec![],
            num_partitions: 0,
        }
    }

    #[test]
    fn test_reconstruct_from_proto() {
        let database = database();
        let proto = valid_proto();
        assert!(AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let storage_manager = Arc::new(StorageManager::new());
        let mut state = AggregationOperationState::reconstruct_from_proto(
            &proto,
            &database,
            Arc::clone(&storage_manager),
            &[],
            &mock_client_context(),
        )
        .unwrap();
        let block = create_block(
            &storage_manager,
            &[(1, Some(2), "a"), (1, Some(2), "b"), (1, Some(-3), "c"), (2, Some(5), "d")],
        );
        state.aggregate_block(block).unwrap();
        let destination = MemoryInsertDestination::new(3);
        state.finalize_aggregate(&destination).unwrap();
        assert_eq!(sorted_rows(&destination), ["(1, 2, 2)", "(2, 5, 1)"]);
    }

    #[test]
    fn test_proto_is_not_valid() {
        let database = database();

        let mut proto = valid_proto();
        proto.relation_id = 100;
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let mut proto = valid_proto();
        proto.distinctify_hash_table_impl_types.clear();
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let mut proto = valid_proto();
        proto.distinctify_hash_table_impl_types.push(7);
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let mut proto = valid_proto();
        proto.hash_table_impl_type = None;
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let mut proto = valid_proto();
        proto.group_by_expressions = vec![attribute_proto(RELATION_ID, 9)];
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let mut proto = valid_proto();
        proto.bloom_filters = vec![protobuf::BloomFilterAttachment {
            bloom_filter_id: 0,
            attribute_id: 1,
        }];
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));
        assert!(AggregationOperationState::proto_is_valid(&proto, &database, 1));

        // Without GROUP BY the hash table implementation is not required
        let mut proto = valid_proto();
        proto.group_by_expressions.clear();
        proto.hash_table_impl_type = None;
        assert!(AggregationOperationState::proto_is_valid(&proto, &database, 0));

        // Simple scalar tables are keyed by a single integer
        let mut proto = valid_proto();
        proto.hash_table_impl_type =
            Some(protobuf::HashTableImplType::SimpleScalarSeparateChaining as i32);
        assert!(AggregationOperationState::proto_is_valid(&proto, &database, 0));
        proto.group_by_expressions = vec![attribute_proto(RELATION_ID, 2)];
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));

        let mut proto = valid_proto();
        proto.distinctify_hash_table_impl_types =
            vec![protobuf::HashTableImplType::SimpleScalarSeparateChaining as i32];
        assert!(!AggregationOperationState::proto_is_valid(&proto, &database, 0));
    }
}
