//! Scalar expressions: literals, attribute references and arithmetic

use std::fmt::Display;

use snafu::ensure;
use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::column_vector::ColumnVector;
use stratum_block::types::{Type, TypeId};
use stratum_block::value::TypedValue;

use super::{Result, UnsupportedArithmeticSnafu};
use crate::catalog::CatalogAttribute;

/// Binary arithmetic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperationId {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
}

impl BinaryOperationId {
    /// Symbol of the operation
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
        }
    }
}

impl Display for BinaryOperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Scalar expression, produces a single value for each tuple
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Constant value
    Literal {
        /// The value
        value: TypedValue,
        /// Type of the value
        type_: Type,
    },
    /// Reference to the attribute of the input relation
    Attribute {
        /// Id of the attribute
        attribute_id: AttributeId,
        /// Type of the attribute
        type_: Type,
    },
    /// Arithmetic between two numeric scalars. Integers wrap on overflow
    Binary {
        /// The operation
        operation: BinaryOperationId,
        /// Left operand
        left: Box<Scalar>,
        /// Right operand
        right: Box<Scalar>,
        /// Result type, the wider one of the operands
        type_: Type,
    },
}

impl Scalar {
    /// Create a literal
    #[inline]
    pub fn literal(value: TypedValue, type_: Type) -> Self {
        debug_assert_eq!(value.type_id(), type_.id());
        Self::Literal { value, type_ }
    }

    /// Create a reference to the attribute
    #[inline]
    pub fn attribute(attribute: &CatalogAttribute) -> Self {
        Self::Attribute {
            attribute_id: attribute.id(),
            type_: attribute.type_(),
        }
    }

    /// Create an arithmetic expression, both of the operands should be numeric
    pub fn try_new_binary(operation: BinaryOperationId, left: Scalar, right: Scalar) -> Result<Self> {
        let (left_type, right_type) = (left.type_(), right.type_());
        ensure!(
            left_type.id().is_numeric() && right_type.id().is_numeric(),
            UnsupportedArithmeticSnafu {
                operation,
                left: left_type,
                right: right_type,
            }
        );
        let type_ = Type::new(
            std::cmp::max(left_type.id(), right_type.id()),
            left_type.nullable() || right_type.nullable(),
        );
        Ok(Self::Binary {
            operation,
            left: Box::new(left),
            right: Box::new(right),
            type_,
        })
    }

    /// Type of the result
    #[inline]
    pub fn type_(&self) -> Type {
        match self {
            Self::Literal { type_, .. }
            | Self::Attribute { type_, .. }
            | Self::Binary { type_, .. } => *type_,
        }
    }

    /// If the scalar passes the attribute through without computation, returns the
    /// id of the attribute
    #[inline]
    pub fn attribute_id_for_value_accessor(&self) -> Option<AttributeId> {
        match self {
            Self::Attribute { attribute_id, .. } => Some(*attribute_id),
            _ => None,
        }
    }

    /// Evaluate the scalar on the current tuple of the accessor
    pub fn get_value_for_single_tuple<A: ValueAccessor + ?Sized>(&self, accessor: &A) -> TypedValue {
        match self {
            Self::Literal { value, .. } => value.clone(),
            Self::Attribute { attribute_id, .. } => accessor.get_typed_value(*attribute_id),
            Self::Binary {
                operation,
                left,
                right,
                type_,
            } => evaluate_binary(
                *operation,
                type_.id(),
                &left.get_value_for_single_tuple(accessor),
                &right.get_value_for_single_tuple(accessor),
            ),
        }
    }

    /// Evaluate the scalar on all of the tuples of the accessor
    pub fn get_all_values<A: ValueAccessor + ?Sized>(&self, accessor: &mut A) -> ColumnVector {
        let mut column = ColumnVector::new(self.type_(), accessor.num_tuples());
        accessor.begin_iteration();
        while accessor.next() {
            column.append_typed_value(self.get_value_for_single_tuple(accessor));
        }
        column
    }
}

fn evaluate_binary(
    operation: BinaryOperationId,
    result_type: TypeId,
    left: &TypedValue,
    right: &TypedValue,
) -> TypedValue {
    if left.is_null() || right.is_null() {
        return TypedValue::Null(result_type);
    }

    match result_type {
        TypeId::Int | TypeId::Long => {
            let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) else {
                panic!("`{}` and `{}` are not integers", left, right)
            };
            let result = match operation {
                BinaryOperationId::Add => l.wrapping_add(r),
                BinaryOperationId::Subtract => l.wrapping_sub(r),
                BinaryOperationId::Multiply => l.wrapping_mul(r),
            };
            if result_type == TypeId::Int {
                TypedValue::Int(result as i32)
            } else {
                TypedValue::Long(result)
            }
        }
        TypeId::Float | TypeId::Double => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                panic!("`{}` and `{}` are not numeric", left, right)
            };
            let result = match operation {
                BinaryOperationId::Add => l + r,
                BinaryOperationId::Subtract => l - r,
                BinaryOperationId::Multiply => l * r,
            };
            if result_type == TypeId::Float {
                TypedValue::Float(result as f32)
            } else {
                TypedValue::Double(result)
            }
        }
        TypeId::VarChar => unreachable!("Arithmetic never produces VarChar"),
    }
}
