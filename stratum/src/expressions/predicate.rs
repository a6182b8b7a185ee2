//! Predicates that filter the tuples
//!
//! Predicates follow the three valued logic of SQL: comparison with NULL is unknown,
//! and only the tuples whose predicate is true match

use std::cmp::Ordering;
use std::fmt::Display;

use snafu::ensure;
use stratum_block::accessor::ValueAccessor;
use stratum_block::tuple_id_sequence::TupleIdSequence;

use super::scalar::Scalar;
use super::{Result, UnsupportedComparisonSnafu};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonId {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    Less,
    /// `<=`
    LessOrEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEqual,
}

impl ComparisonId {
    /// Symbol of the comparison
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        }
    }

    #[inline]
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Equal => ordering.is_eq(),
            Self::NotEqual => ordering.is_ne(),
            Self::Less => ordering.is_lt(),
            Self::LessOrEqual => ordering.is_le(),
            Self::Greater => ordering.is_gt(),
            Self::GreaterOrEqual => ordering.is_ge(),
        }
    }
}

impl Display for ComparisonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Boolean expression
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Always true
    True,
    /// Always false
    False,
    /// Compare two scalars
    Comparison {
        /// The operator
        comparison: ComparisonId,
        /// Left operand
        left: Scalar,
        /// Right operand
        right: Scalar,
    },
    /// All of the operands are true. Empty conjunction is true
    Conjunction(Vec<Predicate>),
    /// Any of the operands is true. Empty disjunction is false
    Disjunction(Vec<Predicate>),
    /// Negate the operand
    Negation(Box<Predicate>),
}

impl Predicate {
    /// Create a comparison. Numbers are comparable with each other and strings are
    /// comparable with each other
    pub fn try_new_comparison(comparison: ComparisonId, left: Scalar, right: Scalar) -> Result<Self> {
        let (left_type, right_type) = (left.type_(), right.type_());
        ensure!(
            left_type.id().is_numeric() == right_type.id().is_numeric(),
            UnsupportedComparisonSnafu {
                comparison,
                left: left_type,
                right: right_type,
            }
        );
        Ok(Self::Comparison {
            comparison,
            left,
            right,
        })
    }

    /// Evaluate the predicate on the current tuple, `None` means unknown
    pub fn evaluate_for_single_tuple<A: ValueAccessor + ?Sized>(&self, accessor: &A) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            Self::Comparison {
                comparison,
                left,
                right,
            } => left
                .get_value_for_single_tuple(accessor)
                .compare(&right.get_value_for_single_tuple(accessor))
                .map(|ordering| comparison.holds(ordering)),
            Self::Conjunction(operands) => {
                let mut result = Some(true);
                for operand in operands {
                    match operand.evaluate_for_single_tuple(accessor) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => (),
                    }
                }
                result
            }
            Self::Disjunction(operands) => {
                let mut result = Some(false);
                for operand in operands {
                    match operand.evaluate_for_single_tuple(accessor) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => (),
                    }
                }
                result
            }
            Self::Negation(operand) => operand.evaluate_for_single_tuple(accessor).map(|v| !v),
        }
    }

    /// Returns true if the predicate is true on the current tuple
    #[inline]
    pub fn matches_single_tuple<A: ValueAccessor + ?Sized>(&self, accessor: &A) -> bool {
        self.evaluate_for_single_tuple(accessor) == Some(true)
    }

    /// Find all of the tuples in the accessor that match the predicate. `length` is the
    /// number of tuples in the underling block, the returned sequence is indexed by the
    /// absolute position
    pub fn get_all_matches<A: ValueAccessor + ?Sized>(&self, accessor: &mut A, length: usize) -> TupleIdSequence {
        match self {
            Self::True if accessor.num_tuples() == length => TupleIdSequence::all(length),
            Self::False => TupleIdSequence::new(length),
            _ => {
                let mut matches = TupleIdSequence::new(length);
                accessor.begin_iteration();
                while accessor.next() {
                    if self.matches_single_tuple(accessor) {
                        matches.set(accessor.current_position(), true);
                    }
                }
                matches
            }
        }
    }
}
