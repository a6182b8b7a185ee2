//! Expressions evaluated over the tuples of a [`ValueAccessor`]
//!
//! [`ValueAccessor`]: stratum_block::accessor::ValueAccessor

pub mod aggregation;
pub mod predicate;
pub mod scalar;

use snafu::Snafu;
use stratum_block::types::Type;

use self::predicate::ComparisonId;
use self::scalar::BinaryOperationId;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum ExpressionError {
    #[snafu(display(
        "Perform `{}` arithmetic between `{}` and `{}` is not supported",
        operation,
        left,
        right
    ))]
    UnsupportedArithmetic {
        operation: BinaryOperationId,
        left: Type,
        right: Type,
    },
    #[snafu(display(
        "Perform `{}` comparison between `{}` and `{}` is not supported",
        comparison,
        left,
        right
    ))]
    UnsupportedComparison {
        comparison: ComparisonId,
        left: Type,
        right: Type,
    },
}

type Result<T> = std::result::Result<T, ExpressionError>;
