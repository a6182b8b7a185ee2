//! Column oriented vectors of values
//!
//! - [`NativeColumnVector`] stores fixed length values contiguously in little endian,
//! their untyped bytes can be read without decoding
//!
//! - [`IndirectColumnVector`] stores [`TypedValue`]s, it is used for variable length
//! types

use crate::bitmap::Bitmap;
use crate::types::Type;
use crate::value::TypedValue;

/// Column vector, see the module level documentation
#[derive(Debug, Clone)]
pub enum ColumnVector {
    /// Fixed length values
    Native(NativeColumnVector),
    /// Variable length values
    Indirect(IndirectColumnVector),
}

impl ColumnVector {
    /// Create an empty column vector that suits the `type_`
    pub fn new(type_: Type, reserve: usize) -> Self {
        if NativeColumnVector::usable_for_type(&type_) {
            Self::Native(NativeColumnVector::new(type_, reserve))
        } else {
            Self::Indirect(IndirectColumnVector::new(type_, reserve))
        }
    }

    /// Create a column vector from the values
    pub fn from_values(type_: Type, values: impl IntoIterator<Item = TypedValue>) -> Self {
        let values = values.into_iter();
        let mut column = Self::new(type_, values.size_hint().0);
        values.for_each(|value| column.append_typed_value(value));
        column
    }

    /// Type of the values
    #[inline]
    pub fn type_(&self) -> &Type {
        match self {
            Self::Native(c) => &c.type_,
            Self::Indirect(c) => &c.type_,
        }
    }

    /// Number of values
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Native(c) => c.len,
            Self::Indirect(c) => c.values.len(),
        }
    }

    /// Returns true if the vector is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value
    ///
    /// # Panics
    ///
    /// Panics if the type of the value mismatch with the column, or NULL is appended
    /// to the non-nullable column
    #[inline]
    pub fn append_typed_value(&mut self, value: TypedValue) {
        match self {
            Self::Native(c) => c.append_typed_value(&value),
            Self::Indirect(c) => c.append_typed_value(value),
        }
    }

    /// Get the value at `position`
    #[inline]
    pub fn get_typed_value(&self, position: usize) -> TypedValue {
        match self {
            Self::Native(c) => c.get_typed_value(position),
            Self::Indirect(c) => c.values[position].clone(),
        }
    }

    /// Get the data bytes of the value at `position`, returns `None` if the value is NULL
    #[inline]
    pub fn get_untyped_value(&self, position: usize) -> Option<&[u8]> {
        match self {
            Self::Native(c) => c.get_untyped_value(position),
            Self::Indirect(c) => c.get_untyped_value(position),
        }
    }

    /// Iterate the values
    pub fn iter(&self) -> impl Iterator<Item = TypedValue> + '_ {
        (0..self.len()).map(|position| self.get_typed_value(position))
    }
}

/// Column vector of the fixed length values
#[derive(Debug, Clone)]
pub struct NativeColumnVector {
    type_: Type,
    width: usize,
    values: Vec<u8>,
    /// Only used when the type is nullable, set bit means the value is not NULL
    validity: Bitmap,
    len: usize,
}

impl NativeColumnVector {
    /// Returns true if the native vector can hold values of this type
    #[inline]
    pub fn usable_for_type(type_: &Type) -> bool {
        !type_.is_variable_length()
    }

    /// Create a new native vector
    ///
    /// # Panics
    ///
    /// Panics if the type is variable length
    pub fn new(type_: Type, reserve: usize) -> Self {
        let Some(width) = type_.id().fixed_byte_length() else {
            panic!("NativeColumnVector can not store variable length type `{}`", type_);
        };
        Self {
            type_,
            width,
            values: Vec::with_capacity(width * reserve),
            validity: if type_.nullable() {
                Bitmap::with_capacity(reserve)
            } else {
                Bitmap::new()
            },
            len: 0,
        }
    }

    fn append_typed_value(&mut self, value: &TypedValue) {
        if value.is_null() {
            assert!(
                self.type_.nullable(),
                "Append NULL to the non-nullable column vector of type `{}`",
                self.type_
            );
            self.values.resize(self.values.len() + self.width, 0);
            self.validity.push(false);
        } else {
            assert_eq!(
                value.type_id(),
                self.type_.id(),
                "Append value with mismatched type to the column vector"
            );
            value.write_data_bytes(&mut self.values);
            if self.type_.nullable() {
                self.validity.push(true);
            }
        }
        self.len += 1;
    }

    #[inline]
    fn is_null(&self, position: usize) -> bool {
        self.type_.nullable() && !self.validity.get(position)
    }

    fn get_typed_value(&self, position: usize) -> TypedValue {
        match self.get_untyped_value(position) {
            Some(bytes) => TypedValue::from_fixed_data_bytes(self.type_.id(), bytes),
            None => TypedValue::Null(self.type_.id()),
        }
    }

    fn get_untyped_value(&self, position: usize) -> Option<&[u8]> {
        assert!(position < self.len);
        if self.is_null(position) {
            None
        } else {
            let start = position * self.width;
            Some(&self.values[start..start + self.width])
        }
    }
}

/// Column vector of the variable length values
#[derive(Debug, Clone)]
pub struct IndirectColumnVector {
    type_: Type,
    values: Vec<TypedValue>,
}

impl IndirectColumnVector {
    /// Create a new indirect vector
    ///
    /// # Panics
    ///
    /// Panics if the type is fixed length, use [`NativeColumnVector`] instead
    #[inline]
    pub fn new(type_: Type, reserve: usize) -> Self {
        assert!(
            type_.is_variable_length(),
            "IndirectColumnVector only stores variable length values, found `{}`",
            type_
        );
        Self {
            type_,
            values: Vec::with_capacity(reserve),
        }
    }

    fn append_typed_value(&mut self, value: TypedValue) {
        if value.is_null() {
            assert!(
                self.type_.nullable(),
                "Append NULL to the non-nullable column vector of type `{}`",
                self.type_
            );
        } else {
            assert_eq!(
                value.type_id(),
                self.type_.id(),
                "Append value with mismatched type to the column vector"
            );
        }
        self.values.push(value);
    }

    fn get_untyped_value(&self, position: usize) -> Option<&[u8]> {
        match &self.values[position] {
            TypedValue::Null(_) => None,
            TypedValue::VarChar(v) => Some(v.as_bytes()),
            _ => unreachable!("IndirectColumnVector only stores variable length values"),
        }
    }
}
