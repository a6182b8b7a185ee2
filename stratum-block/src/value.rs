//! [`TypedValue`] holds a single datum

use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use snafu::{ResultExt, Snafu, ensure};

use crate::types::TypeId;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum DecodeValueError {
    #[snafu(display("`{}` expects `{expected}` data bytes, found `{actual}` bytes", type_id.name()))]
    InvalidLength {
        type_id: TypeId,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("Data bytes of the VarChar are not valid utf8"))]
    InvalidUtf8 { source: std::str::Utf8Error },
}

type Result<T> = std::result::Result<T, DecodeValueError>;

/// A single datum tagged with its [`TypeId`]
///
/// Equality and hash are bitwise: two values are equal iff they have the same type id
/// and the same data bytes, except that `-0.0` is normalized to `0.0` first. Therefore,
/// `NaN` equals to itself and `-0.0` equals to `0.0`, so they fall into the same group
/// of the hash table. Use [`TypedValue::compare`] for the SQL comparison
#[derive(Debug, Clone)]
pub enum TypedValue {
    /// NULL of the given type
    Null(TypeId),
    /// i32
    Int(i32),
    /// i64
    Long(i64),
    /// f32
    Float(f32),
    /// f64
    Double(f64),
    /// Utf8 string, shared between the copies of the value
    VarChar(Arc<str>),
}

impl TypedValue {
    /// Type id of the value
    #[inline]
    pub fn type_id(&self) -> TypeId {
        match self {
            Self::Null(type_id) => *type_id,
            Self::Int(_) => TypeId::Int,
            Self::Long(_) => TypeId::Long,
            Self::Float(_) => TypeId::Float,
            Self::Double(_) => TypeId::Double,
            Self::VarChar(_) => TypeId::VarChar,
        }
    }

    /// Returns true if the value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Number of data bytes of the value. NULL has zero bytes
    #[inline]
    pub fn data_size(&self) -> usize {
        match self {
            Self::Null(_) => 0,
            Self::Int(_) | Self::Float(_) => 4,
            Self::Long(_) | Self::Double(_) => 8,
            Self::VarChar(v) => v.len(),
        }
    }

    /// Append the little endian data bytes of the value to `out`
    pub fn write_data_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null(_) => (),
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Long(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::VarChar(v) => out.extend_from_slice(v.as_bytes()),
        }
    }

    /// Decode the value from the data bytes written by [`Self::write_data_bytes`]
    pub fn from_data_bytes(type_id: TypeId, bytes: &[u8]) -> Result<Self> {
        match type_id.fixed_byte_length() {
            Some(expected) => {
                ensure!(
                    bytes.len() == expected,
                    InvalidLengthSnafu {
                        type_id,
                        expected,
                        actual: bytes.len()
                    }
                );
                Ok(Self::from_fixed_data_bytes(type_id, bytes))
            }
            None => {
                let s = std::str::from_utf8(bytes).context(InvalidUtf8Snafu)?;
                Ok(Self::VarChar(s.into()))
            }
        }
    }

    /// Decode the fixed length value from its data bytes without checking the length
    ///
    /// # Panics
    ///
    /// Panics if the `type_id` is variable length or `bytes` is too short
    pub fn from_fixed_data_bytes(type_id: TypeId, bytes: &[u8]) -> Self {
        match type_id {
            TypeId::Int => Self::Int(i32::from_le_bytes(le_array(bytes))),
            TypeId::Long => Self::Long(i64::from_le_bytes(le_array(bytes))),
            TypeId::Float => Self::Float(f32::from_le_bytes(le_array(bytes))),
            TypeId::Double => Self::Double(f64::from_le_bytes(le_array(bytes))),
            TypeId::VarChar => panic!("VarChar is not a fixed length type"),
        }
    }

    /// View the integer value as i64
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v as i64),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// View the numeric value as f64
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Long(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// View the string value
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::VarChar(v) => Some(v),
            _ => None,
        }
    }

    /// SQL comparison. Numbers of different types are compared after widening,
    /// returns `None` if any side is NULL or the values are not comparable
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null(_), _) | (_, Self::Null(_)) => None,
            (Self::VarChar(lhs), Self::VarChar(rhs)) => Some(lhs.as_bytes().cmp(rhs.as_bytes())),
            (Self::VarChar(_), _) | (_, Self::VarChar(_)) => None,
            (lhs, rhs) => match (lhs.as_i64(), rhs.as_i64()) {
                (Some(lhs), Some(rhs)) => Some(lhs.cmp(&rhs)),
                _ => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
            },
        }
    }
}

/// Bits of the float with `-0.0` normalized to `0.0`
#[inline]
fn float_key_bits(v: f32) -> u32 {
    if v == 0.0 { 0 } else { v.to_bits() }
}

#[inline]
fn double_key_bits(v: f64) -> u64 {
    if v == 0.0 { 0 } else { v.to_bits() }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null(lhs), Self::Null(rhs)) => lhs == rhs,
            (Self::Int(lhs), Self::Int(rhs)) => lhs == rhs,
            (Self::Long(lhs), Self::Long(rhs)) => lhs == rhs,
            (Self::Float(lhs), Self::Float(rhs)) => float_key_bits(*lhs) == float_key_bits(*rhs),
            (Self::Double(lhs), Self::Double(rhs)) => {
                double_key_bits(*lhs) == double_key_bits(*rhs)
            }
            (Self::VarChar(lhs), Self::VarChar(rhs)) => lhs == rhs,
            _ => false,
        }
    }
}

impl Eq for TypedValue {}

impl Hash for TypedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null(type_id) => type_id.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Long(v) => v.hash(state),
            Self::Float(v) => float_key_bits(*v).hash(state),
            Self::Double(v) => double_key_bits(*v).hash(state),
            Self::VarChar(v) => v.hash(state),
        }
    }
}

impl Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null(_) => write!(f, "Null"),
            Self::Int(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:?}", v),
            Self::Double(v) => write!(f, "{:?}", v),
            Self::VarChar(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for TypedValue {
    #[inline]
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for TypedValue {
    #[inline]
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f32> for TypedValue {
    #[inline]
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for TypedValue {
    #[inline]
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for TypedValue {
    #[inline]
    fn from(v: &str) -> Self {
        Self::VarChar(v.into())
    }
}

/// Copy the first `N` bytes into an array
///
/// # Panics
///
/// Panics if `bytes.len() < N`
#[inline]
pub(crate) fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0; N];
    array.copy_from_slice(&bytes[..N]);
    array
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitwise_equality() {
        assert_eq!(TypedValue::Double(f64::NAN), TypedValue::Double(f64::NAN));
        assert_ne!(TypedValue::Double(1.0), TypedValue::Double(-1.0));
        assert_ne!(TypedValue::Int(1), TypedValue::Long(1));
        assert_eq!(TypedValue::Null(TypeId::Int), TypedValue::Null(TypeId::Int));
        assert_ne!(TypedValue::Null(TypeId::Int), TypedValue::Null(TypeId::Long));
    }

    #[test]
    fn test_negative_zero_equals_zero() {
        assert_eq!(TypedValue::Double(-0.0), TypedValue::Double(0.0));
        assert_eq!(TypedValue::Float(-0.0), TypedValue::Float(0.0));
        assert_ne!(TypedValue::Float(0.0), TypedValue::Double(0.0));

        let state = std::collections::hash_map::RandomState::new();
        let hash = |value: &TypedValue| {
            use std::hash::BuildHasher;
            state.hash_one(value)
        };
        assert_eq!(hash(&TypedValue::Double(-0.0)), hash(&TypedValue::Double(0.0)));
        assert_eq!(hash(&TypedValue::Float(-0.0)), hash(&TypedValue::Float(0.0)));
    }

    #[test]
    fn test_sql_compare() {
        assert_eq!(
            TypedValue::Int(3).compare(&TypedValue::Long(4)),
            Some(Ordering::Less)
        );
        assert_eq!(
            TypedValue::Double(2.5).compare(&TypedValue::Int(2)),
            Some(Ordering::Greater)
        );
        assert_eq!(TypedValue::Null(TypeId::Int).compare(&TypedValue::Int(2)), None);
        assert_eq!(TypedValue::from("a").compare(&TypedValue::Int(2)), None);
    }

    #[test]
    fn test_data_bytes() {
        let mut bytes = Vec::new();
        TypedValue::Long(-7).write_data_bytes(&mut bytes);
        TypedValue::from("hello").write_data_bytes(&mut bytes);
        assert_eq!(bytes.len(), 13);
        assert_eq!(
            TypedValue::from_data_bytes(TypeId::Long, &bytes[..8]).unwrap(),
            TypedValue::Long(-7)
        );
        assert_eq!(
            TypedValue::from_data_bytes(TypeId::VarChar, &bytes[8..]).unwrap(),
            TypedValue::from("hello")
        );

        let error = TypedValue::from_data_bytes(TypeId::Int, &bytes[..3]).unwrap_err();
        let expect = expect_test::expect!["`Int` expects `4` data bytes, found `3` bytes"];
        expect.assert_eq(&error.to_string());
    }

    #[test]
    fn test_display() {
        assert_eq!(TypedValue::Double(2.0).to_string(), "2.0");
        assert_eq!(TypedValue::Null(TypeId::Double).to_string(), "Null");
        assert_eq!(TypedValue::from("x").to_string(), "x");
    }
}
