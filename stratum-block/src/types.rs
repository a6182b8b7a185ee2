//! Types supported by stratum

use std::cmp::Ordering;
use std::fmt::Display;

use crate::value::le_array;

/// Default max length of the [`TypeId::VarChar`]
pub const DEFAULT_VARCHAR_MAX_LENGTH: usize = 64;

/// Identifier of the type. It does not contain the nullability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeId {
    /// i32
    Int,
    /// i64
    Long,
    /// f32
    Float,
    /// f64
    Double,
    /// Variable length utf8 string
    VarChar,
}

impl TypeId {
    /// Name of the type
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Int => "Int",
            Self::Long => "Long",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::VarChar => "VarChar",
        }
    }

    /// Returns true if the values of this type do not have a fixed length
    #[inline]
    pub const fn is_variable_length(&self) -> bool {
        matches!(self, Self::VarChar)
    }

    /// Returns true if the type is a number
    #[inline]
    pub const fn is_numeric(&self) -> bool {
        !self.is_variable_length()
    }

    /// Byte length of the fixed length type. Returns `None` for the variable length type
    #[inline]
    pub const fn fixed_byte_length(&self) -> Option<usize> {
        match self {
            Self::Int | Self::Float => Some(4),
            Self::Long | Self::Double => Some(8),
            Self::VarChar => None,
        }
    }
}

/// Type of a column: [`TypeId`] with nullability. Variable length types also
/// record their max length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    id: TypeId,
    nullable: bool,
    max_length: usize,
}

impl Type {
    /// Create a new type. [`TypeId::VarChar`] uses [`DEFAULT_VARCHAR_MAX_LENGTH`]
    #[inline]
    pub const fn new(id: TypeId, nullable: bool) -> Self {
        let max_length = match id.fixed_byte_length() {
            Some(length) => length,
            None => DEFAULT_VARCHAR_MAX_LENGTH,
        };
        Self {
            id,
            nullable,
            max_length,
        }
    }

    /// Int type
    #[inline]
    pub const fn int(nullable: bool) -> Self {
        Self::new(TypeId::Int, nullable)
    }

    /// Long type
    #[inline]
    pub const fn long(nullable: bool) -> Self {
        Self::new(TypeId::Long, nullable)
    }

    /// Float type
    #[inline]
    pub const fn float(nullable: bool) -> Self {
        Self::new(TypeId::Float, nullable)
    }

    /// Double type
    #[inline]
    pub const fn double(nullable: bool) -> Self {
        Self::new(TypeId::Double, nullable)
    }

    /// VarChar type with given max length
    #[inline]
    pub const fn var_char(max_length: usize, nullable: bool) -> Self {
        Self {
            id: TypeId::VarChar,
            nullable,
            max_length,
        }
    }

    /// Get the type id
    #[inline]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Returns true if the column may contain NULL
    #[inline]
    pub const fn nullable(&self) -> bool {
        self.nullable
    }

    /// Same type with the given nullability
    #[inline]
    pub const fn with_nullable(self, nullable: bool) -> Self {
        Self { nullable, ..self }
    }

    /// Returns true if the values of this type do not have a fixed length
    #[inline]
    pub const fn is_variable_length(&self) -> bool {
        self.id.is_variable_length()
    }

    /// Maximum number of bytes a value of this type may occupy
    #[inline]
    pub const fn maximum_byte_length(&self) -> usize {
        self.max_length
    }

    /// Minimum number of bytes a value of this type may occupy
    #[inline]
    pub const fn minimum_byte_length(&self) -> usize {
        match self.id.fixed_byte_length() {
            Some(length) => length,
            None => 0,
        }
    }

    /// Estimated average number of bytes of the values. Used for sizing the
    /// variable length storage of the hash table
    #[inline]
    pub const fn estimate_average_byte_length(&self) -> usize {
        match self.id.fixed_byte_length() {
            Some(length) => length,
            None => {
                if self.max_length > 160 {
                    80
                } else {
                    (self.max_length / 2) + 1
                }
            }
        }
    }

    /// Compare the untyped data bytes of two values of this type without checking
    /// their length. Numbers are stored in little endian
    ///
    /// Floats are compared with the total order, so `NaN` has a stable position
    pub fn compare_data_bytes(&self, left: &[u8], right: &[u8]) -> Ordering {
        match self.id {
            TypeId::Int => {
                i32::from_le_bytes(le_array(left)).cmp(&i32::from_le_bytes(le_array(right)))
            }
            TypeId::Long => {
                i64::from_le_bytes(le_array(left)).cmp(&i64::from_le_bytes(le_array(right)))
            }
            TypeId::Float => {
                f32::from_le_bytes(le_array(left)).total_cmp(&f32::from_le_bytes(le_array(right)))
            }
            TypeId::Double => {
                f64::from_le_bytes(le_array(left)).total_cmp(&f64::from_le_bytes(le_array(right)))
            }
            TypeId::VarChar => left.cmp(right),
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            TypeId::VarChar => write!(f, "VarChar({})", self.max_length)?,
            id => write!(f, "{}", id.name())?,
        }
        if self.nullable {
            write!(f, " NULL")?;
        }
        Ok(())
    }
}
