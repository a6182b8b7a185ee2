//! Reconstruct the expressions from the protocol messages
//!
//! Each `*_from_proto` function has a `*_proto_is_valid` companion. The operator
//! validates the whole message before it constructs anything

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use stratum_block::types::{Type, TypeId};
use stratum_block::value::TypedValue;

use crate::proto as protobuf;
use crate::catalog::{CatalogDatabase, RelationId};
use crate::expressions::ExpressionError;
use crate::expressions::aggregation::AggregateFunction;
use crate::expressions::predicate::{ComparisonId, Predicate};
use crate::expressions::scalar::{BinaryOperationId, Scalar};
use crate::storage::aggregation_operation_state::AggregateExpression;
use crate::storage::hash_table::HashTableImplType;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum ProtoError {
    #[snafu(display("`{value}` is not a valid `{enum_name}`"))]
    InvalidEnumValue { enum_name: &'static str, value: i32 },
    #[snafu(display("Field `{field}` of the message `{message}` is missing"))]
    MissingField {
        message: &'static str,
        field: &'static str,
    },
    #[snafu(display("Relation `{relation_id}` does not exist"))]
    UnknownRelation { relation_id: RelationId },
    #[snafu(display("Relation `{relation_id}` does not have attribute `{attribute_id}`"))]
    UnknownAttribute {
        relation_id: RelationId,
        attribute_id: u32,
    },
    #[snafu(display("Literal `{value}` can not have type `{type_}`"))]
    InvalidLiteral { value: TypedValue, type_: Type },
    #[snafu(display("`{message}` expects `{expected}` operands, found `{actual}` operands"))]
    InvalidNumOperands {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("Invalid expression"))]
    InvalidExpression { source: ExpressionError },
}

/// Result of the reconstruction
pub type Result<T> = std::result::Result<T, ProtoError>;

#[inline]
fn enum_from_proto<E: TryFrom<i32>>(value: i32, enum_name: &'static str) -> Result<E> {
    E::try_from(value)
        .ok()
        .context(InvalidEnumValueSnafu { enum_name, value })
}

impl From<protobuf::TypeId> for TypeId {
    fn from(type_id: protobuf::TypeId) -> Self {
        match type_id {
            protobuf::TypeId::Int => Self::Int,
            protobuf::TypeId::Long => Self::Long,
            protobuf::TypeId::Float => Self::Float,
            protobuf::TypeId::Double => Self::Double,
            protobuf::TypeId::VarChar => Self::VarChar,
        }
    }
}

impl From<protobuf::BinaryOperationId> for BinaryOperationId {
    fn from(operation: protobuf::BinaryOperationId) -> Self {
        match operation {
            protobuf::BinaryOperationId::Add => Self::Add,
            protobuf::BinaryOperationId::Subtract => Self::Subtract,
            protobuf::BinaryOperationId::Multiply => Self::Multiply,
        }
    }
}

impl From<protobuf::ComparisonId> for ComparisonId {
    fn from(comparison: protobuf::ComparisonId) -> Self {
        match comparison {
            protobuf::ComparisonId::Equal => Self::Equal,
            protobuf::ComparisonId::NotEqual => Self::NotEqual,
            protobuf::ComparisonId::Less => Self::Less,
            protobuf::ComparisonId::LessOrEqual => Self::LessOrEqual,
            protobuf::ComparisonId::Greater => Self::Greater,
            protobuf::ComparisonId::GreaterOrEqual => Self::GreaterOrEqual,
        }
    }
}

impl From<protobuf::AggregationId> for AggregateFunction {
    fn from(aggregation_id: protobuf::AggregationId) -> Self {
        match aggregation_id {
            protobuf::AggregationId::Avg => Self::Avg,
            protobuf::AggregationId::Count => Self::Count,
            protobuf::AggregationId::Max => Self::Max,
            protobuf::AggregationId::Min => Self::Min,
            protobuf::AggregationId::Sum => Self::Sum,
        }
    }
}

impl From<protobuf::HashTableImplType> for HashTableImplType {
    fn from(impl_type: protobuf::HashTableImplType) -> Self {
        match impl_type {
            protobuf::HashTableImplType::SeparateChaining => Self::SeparateChaining,
            protobuf::HashTableImplType::SimpleScalarSeparateChaining => {
                Self::SimpleScalarSeparateChaining
            }
        }
    }
}

/// Reconstruct the [`Type`]
pub fn type_from_proto(proto: &protobuf::Type) -> Result<Type> {
    let type_id: TypeId = enum_from_proto::<protobuf::TypeId>(proto.type_id, "TypeId")?.into();
    Ok(match type_id {
        TypeId::VarChar => Type::var_char(proto.max_length as usize, proto.nullable),
        _ => Type::new(type_id, proto.nullable),
    })
}

/// Reconstruct the [`TypedValue`]
pub fn typed_value_from_proto(proto: &protobuf::TypedValue) -> Result<TypedValue> {
    use protobuf::typed_value::Value;

    let type_id: TypeId = enum_from_proto::<protobuf::TypeId>(proto.type_id, "TypeId")?.into();
    let value = match &proto.value {
        None => TypedValue::Null(type_id),
        Some(Value::IntValue(v)) => TypedValue::Int(*v),
        Some(Value::LongValue(v)) => TypedValue::Long(*v),
        Some(Value::FloatValue(v)) => TypedValue::Float(*v),
        Some(Value::DoubleValue(v)) => TypedValue::Double(*v),
        Some(Value::VarCharValue(v)) => TypedValue::from(v.as_str()),
    };
    ensure!(
        value.type_id() == type_id,
        InvalidLiteralSnafu {
            value,
            type_: Type::new(type_id, true)
        }
    );
    Ok(value)
}

/// Reconstruct the [`Scalar`], attributes are resolved in the `database`
pub fn scalar_from_proto(proto: &protobuf::Scalar, database: &CatalogDatabase) -> Result<Scalar> {
    match enum_from_proto::<protobuf::ScalarType>(proto.scalar_type, "ScalarType")? {
        protobuf::ScalarType::Literal => {
            let value = typed_value_from_proto(proto.literal.as_ref().context(
                MissingFieldSnafu {
                    message: "Scalar",
                    field: "literal",
                },
            )?)?;
            let type_ = type_from_proto(proto.literal_type.as_ref().context(
                MissingFieldSnafu {
                    message: "Scalar",
                    field: "literal_type",
                },
            )?)?;
            ensure!(
                value.type_id() == type_.id() && (!value.is_null() || type_.nullable()),
                InvalidLiteralSnafu { value, type_ }
            );
            Ok(Scalar::literal(value, type_))
        }
        protobuf::ScalarType::Attribute => {
            let relation = database
                .get_relation_schema_by_id(proto.relation_id)
                .context(UnknownRelationSnafu {
                    relation_id: proto.relation_id,
                })?;
            let attribute = relation
                .attribute_by_id(proto.attribute_id as usize)
                .context(UnknownAttributeSnafu {
                    relation_id: proto.relation_id,
                    attribute_id: proto.attribute_id,
                })?;
            Ok(Scalar::attribute(attribute))
        }
        protobuf::ScalarType::BinaryExpression => {
            let operation: protobuf::BinaryOperationId =
                enum_from_proto(proto.operation, "BinaryOperationId")?;
            let [left, right] = <&[protobuf::Scalar; 2]>::try_from(proto.operands.as_slice())
                .ok()
                .context(InvalidNumOperandsSnafu {
                    message: "BinaryExpression",
                    expected: 2usize,
                    actual: proto.operands.len(),
                })?;
            Scalar::try_new_binary(
                operation.into(),
                scalar_from_proto(left, database)?,
                scalar_from_proto(right, database)?,
            )
            .context(InvalidExpressionSnafu)
        }
    }
}

/// Returns true if the [`Scalar`] can be reconstructed
pub fn scalar_proto_is_valid(proto: &protobuf::Scalar, database: &CatalogDatabase) -> bool {
    scalar_from_proto(proto, database).is_ok()
}

/// Reconstruct the [`Predicate`], attributes are resolved in the `database`
pub fn predicate_from_proto(
    proto: &protobuf::Predicate,
    database: &CatalogDatabase,
) -> Result<Predicate> {
    let operands = || {
        proto
            .operands
            .iter()
            .map(|operand| predicate_from_proto(operand, database))
            .collect::<Result<Vec<_>>>()
    };
    match enum_from_proto::<protobuf::PredicateType>(proto.predicate_type, "PredicateType")? {
        protobuf::PredicateType::True => Ok(Predicate::True),
        protobuf::PredicateType::False => Ok(Predicate::False),
        protobuf::PredicateType::Comparison => {
            let comparison: protobuf::ComparisonId =
                enum_from_proto(proto.comparison, "ComparisonId")?;
            let left = proto.left.as_ref().context(MissingFieldSnafu {
                message: "Predicate",
                field: "left",
            })?;
            let right = proto.right.as_ref().context(MissingFieldSnafu {
                message: "Predicate",
                field: "right",
            })?;
            Predicate::try_new_comparison(
                comparison.into(),
                scalar_from_proto(left, database)?,
                scalar_from_proto(right, database)?,
            )
            .context(InvalidExpressionSnafu)
        }
        protobuf::PredicateType::Conjunction => Ok(Predicate::Conjunction(operands()?)),
        protobuf::PredicateType::Disjunction => Ok(Predicate::Disjunction(operands()?)),
        protobuf::PredicateType::Negation => {
            ensure!(
                proto.operands.len() == 1,
                InvalidNumOperandsSnafu {
                    message: "Negation",
                    expected: 1usize,
                    actual: proto.operands.len(),
                }
            );
            let operand = predicate_from_proto(&proto.operands[0], database)?;
            Ok(Predicate::Negation(Box::new(operand)))
        }
    }
}

/// Returns true if the [`Predicate`] can be reconstructed
pub fn predicate_proto_is_valid(proto: &protobuf::Predicate, database: &CatalogDatabase) -> bool {
    predicate_from_proto(proto, database).is_ok()
}

/// Reconstruct the [`AggregateFunction`]
pub fn aggregate_function_from_proto(
    proto: &protobuf::AggregateFunction,
) -> Result<AggregateFunction> {
    enum_from_proto::<protobuf::AggregationId>(proto.aggregation_id, "AggregationId")
        .map(Into::into)
}

/// Reconstruct the [`AggregateExpression`], its arguments are reconstructed against the
/// `database`
pub fn aggregate_from_proto(
    proto: &protobuf::Aggregate,
    database: &CatalogDatabase,
) -> Result<AggregateExpression> {
    let function = proto.function.as_ref().context(MissingFieldSnafu {
        message: "Aggregate",
        field: "function",
    })?;
    let arguments = proto
        .argument
        .iter()
        .map(|argument| scalar_from_proto(argument, database))
        .collect::<Result<Vec<_>>>()?;
    Ok(AggregateExpression {
        function: aggregate_function_from_proto(function)?,
        arguments,
        is_distinct: proto.is_distinct,
    })
}

/// Returns true if the [`AggregateFunction`] can be reconstructed
pub fn aggregate_function_proto_is_valid(proto: &protobuf::AggregateFunction) -> bool {
    protobuf::AggregationId::try_from(proto.aggregation_id).is_ok()
}

/// Reconstruct the [`HashTableImplType`]
pub fn hash_table_impl_type_from_proto(impl_type: i32) -> Result<HashTableImplType> {
    enum_from_proto::<protobuf::HashTableImplType>(impl_type, "HashTableImplType").map(Into::into)
}

/// Returns true if all of the attributes referenced by the scalar belong to the
/// relation
pub(crate) fn scalar_references_only(proto: &protobuf::Scalar, relation_id: RelationId) -> bool {
    match protobuf::ScalarType::try_from(proto.scalar_type) {
        Ok(protobuf::ScalarType::Attribute) => proto.relation_id == relation_id,
        _ => proto
            .operands
            .iter()
            .all(|operand| scalar_references_only(operand, relation_id)),
    }
}

/// Returns true if all of the attributes referenced by the predicate belong to the
/// relation
pub(crate) fn predicate_references_only(
    proto: &protobuf::Predicate,
    relation_id: RelationId,
) -> bool {
    proto
        .left
        .iter()
        .chain(proto.right.iter())
        .all(|scalar| scalar_references_only(scalar, relation_id))
        && proto
            .operands
            .iter()
            .all(|operand| predicate_references_only(operand, relation_id))
}
