//! # StratumBlock
//!
//! Data model shared by the `stratum` engine: the closed set of [`types`], the
//! [`TypedValue`] that carries a single datum of these types, column oriented
//! [`ColumnVector`]s, and the [`ValueAccessor`] abstraction that every operator reads
//! tuples through.
//!
//! - A [`TypedValue`] only records the [`TypeId`] of the datum, the nullability and
//! length limits live in the [`Type`] of the column
//!
//! - [`ColumnVector`]s are either native (fixed length, contiguous bytes) or indirect
//! (a vector of [`TypedValue`]s for variable length types)
//!
//! [`TypedValue`]: crate::value::TypedValue
//! [`TypeId`]: crate::types::TypeId
//! [`Type`]: crate::types::Type
//! [`ColumnVector`]: crate::column_vector::ColumnVector
//! [`ValueAccessor`]: crate::accessor::ValueAccessor

pub mod accessor;
pub mod bitmap;
pub mod column_vector;
pub mod tuple;
pub mod tuple_id_sequence;
pub mod types;
pub mod value;

/// Identifier of the tuple inside a block, it is the absolute position of the tuple
pub type TupleId = usize;

/// Identifier of the attribute, it is the index of the column in the accessor
pub type AttributeId = usize;
