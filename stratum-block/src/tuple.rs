//! Row oriented [`Tuple`]

use std::fmt::Display;

use crate::value::TypedValue;

/// An ordered sequence of [`TypedValue`]s
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Tuple {
    values: Vec<TypedValue>,
}

impl Tuple {
    /// Create a new tuple
    #[inline]
    pub fn new(values: Vec<TypedValue>) -> Self {
        Self { values }
    }

    /// Values in the tuple
    #[inline]
    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    /// Get the value of the given attribute
    #[inline]
    pub fn get(&self, index: usize) -> Option<&TypedValue> {
        self.values.get(index)
    }

    /// Number of attributes in the tuple
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the tuple does not have any attribute
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Take the values
    #[inline]
    pub fn into_values(self) -> Vec<TypedValue> {
        self.values
    }
}

impl From<Vec<TypedValue>> for Tuple {
    #[inline]
    fn from(values: Vec<TypedValue>) -> Self {
        Self { values }
    }
}

/// Display the tuple as a row, each value is followed by a comma
impl Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.values.iter().try_for_each(|value| write!(f, "{},", value))
    }
}
