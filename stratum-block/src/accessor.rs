//! [`ValueAccessor`] is the uniform way to iterate tuples and read their values
//!
//! An accessor has a cursor. [`ValueAccessor::begin_iteration`] puts the cursor
//! before the first tuple, [`ValueAccessor::next`] advances it and
//! [`ValueAccessor::previous`] steps it back, so the next call of `next` revisits
//! the current tuple. Reading the current tuple before the first successful `next` is
//! a contract violation

use std::fmt::Display;
use std::sync::Arc;

use snafu::{Snafu, ensure};
use tabled::builder::Builder as TableBuilder;

use crate::column_vector::ColumnVector;
use crate::tuple_id_sequence::TupleIdSequence;
use crate::value::TypedValue;
use crate::{AttributeId, TupleId};

/// Uniform iterator-like access to the tuples
pub trait ValueAccessor {
    /// Number of attributes of each tuple
    fn num_columns(&self) -> usize;

    /// Number of tuples the iteration visits
    fn num_tuples(&self) -> usize;

    /// Reset the cursor to the position before the first tuple
    fn begin_iteration(&mut self);

    /// Advance the cursor, returns false if there is no more tuples
    fn next(&mut self) -> bool;

    /// Step the cursor back by one tuple
    fn previous(&mut self);

    /// Absolute position of the current tuple in the underling storage
    fn current_position(&self) -> TupleId;

    /// Read the value of the attribute at the absolute position
    fn get_typed_value_at_absolute_position(
        &self,
        attribute_id: AttributeId,
        position: TupleId,
    ) -> TypedValue;

    /// Read the data bytes of the attribute at the absolute position. Returns `None` if
    /// the value is NULL
    fn get_untyped_value_at_absolute_position(
        &self,
        attribute_id: AttributeId,
        position: TupleId,
    ) -> Option<&[u8]>;

    /// Read the value of the attribute of the current tuple
    #[inline]
    fn get_typed_value(&self, attribute_id: AttributeId) -> TypedValue {
        self.get_typed_value_at_absolute_position(attribute_id, self.current_position())
    }

    /// Read the data bytes of the attribute of the current tuple
    #[inline]
    fn get_untyped_value(&self, attribute_id: AttributeId) -> Option<&[u8]> {
        self.get_untyped_value_at_absolute_position(attribute_id, self.current_position())
    }
}

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(display(
    "Column vectors have different length. Accessor has `{expected}` tuples, the new column has `{actual}` values"
))]
pub struct InconsistentLengthError {
    expected: usize,
    actual: usize,
}

/// [`ValueAccessor`] over a set of [`ColumnVector`]s with the same length. Columns are
/// shared, adding the column of another accessor does not copy it
#[derive(Debug, Clone, Default)]
pub struct ColumnVectorsValueAccessor {
    columns: Vec<Arc<ColumnVector>>,
    num_tuples: usize,
    /// Position of the tuple that will be visited by the next call of `next`
    next_position: usize,
}

impl ColumnVectorsValueAccessor {
    /// Create an accessor without any column
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an accessor with the columns
    pub fn try_new(
        columns: impl IntoIterator<Item = Arc<ColumnVector>>,
    ) -> Result<Self, InconsistentLengthError> {
        let mut accessor = Self::new();
        columns
            .into_iter()
            .try_for_each(|column| accessor.add_column(column))?;
        Ok(accessor)
    }

    /// Add a column. The first column decides the number of tuples
    pub fn add_column(&mut self, column: Arc<ColumnVector>) -> Result<(), InconsistentLengthError> {
        if self.columns.is_empty() {
            self.num_tuples = column.len();
        } else {
            ensure!(
                column.len() == self.num_tuples,
                InconsistentLengthSnafu {
                    expected: self.num_tuples,
                    actual: column.len()
                }
            );
        }
        self.columns.push(column);
        Ok(())
    }

    /// Get the column of the attribute
    #[inline]
    pub fn column(&self, attribute_id: AttributeId) -> &Arc<ColumnVector> {
        &self.columns[attribute_id]
    }

    /// Get all of the columns
    #[inline]
    pub fn columns(&self) -> &[Arc<ColumnVector>] {
        &self.columns
    }

    /// Format the accessor with given table builder
    pub fn fmt_table(&self, table_builder: &mut TableBuilder, with_type: bool) {
        if with_type {
            table_builder.push_record(self.columns.iter().map(|column| column.type_().to_string()));
        }

        (0..self.num_tuples).for_each(|position| {
            table_builder.push_record(
                self.columns
                    .iter()
                    .map(|column| column.get_typed_value(position).to_string()),
            );
        });
    }
}

impl ValueAccessor for ColumnVectorsValueAccessor {
    #[inline]
    fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    #[inline]
    fn begin_iteration(&mut self) {
        self.next_position = 0;
    }

    #[inline]
    fn next(&mut self) -> bool {
        if self.next_position < self.num_tuples {
            self.next_position += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    fn previous(&mut self) {
        debug_assert!(self.next_position > 0);
        self.next_position -= 1;
    }

    #[inline]
    fn current_position(&self) -> TupleId {
        debug_assert!(self.next_position > 0, "Accessor is not positioned on a tuple");
        self.next_position - 1
    }

    #[inline]
    fn get_typed_value_at_absolute_position(
        &self,
        attribute_id: AttributeId,
        position: TupleId,
    ) -> TypedValue {
        self.columns[attribute_id].get_typed_value(position)
    }

    #[inline]
    fn get_untyped_value_at_absolute_position(
        &self,
        attribute_id: AttributeId,
        position: TupleId,
    ) -> Option<&[u8]> {
        self.columns[attribute_id].get_untyped_value(position)
    }
}

impl Display for ColumnVectorsValueAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table_builder = TableBuilder::default();
        self.fmt_table(&mut table_builder, true);
        write!(
            f,
            "{}",
            table_builder
                .build()
                .with(tabled::settings::style::Style::modern())
        )
    }
}

/// Adapter that only visits the tuples in a [`TupleIdSequence`]. Positions reported by
/// the adapter are the absolute positions in the underling accessor
#[derive(Debug)]
pub struct TupleIdSequenceAdapter<A> {
    inner: A,
    tuple_ids: Vec<TupleId>,
    next_index: usize,
}

impl<A: ValueAccessor> TupleIdSequenceAdapter<A> {
    /// Create a new adapter
    pub fn new(inner: A, sequence: &TupleIdSequence) -> Self {
        debug_assert!(sequence.length() <= inner.num_tuples());
        Self {
            inner,
            tuple_ids: sequence.iter().collect(),
            next_index: 0,
        }
    }

    /// Get the underling accessor
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: ValueAccessor> ValueAccessor for TupleIdSequenceAdapter<A> {
    #[inline]
    fn num_columns(&self) -> usize {
        self.inner.num_columns()
    }

    #[inline]
    fn num_tuples(&self) -> usize {
        self.tuple_ids.len()
    }

    #[inline]
    fn begin_iteration(&mut self) {
        self.next_index = 0;
    }

    #[inline]
    fn next(&mut self) -> bool {
        if self.next_index < self.tuple_ids.len() {
            self.next_index += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    fn previous(&mut self) {
        debug_assert!(self.next_index > 0);
        self.next_index -= 1;
    }

    #[inline]
    fn current_position(&self) -> TupleId {
        self.tuple_ids[self.next_index - 1]
    }

    #[inline]
    fn get_typed_value_at_absolute_position(
        &self,
        attribute_id: AttributeId,
        position: TupleId,
    ) -> TypedValue {
        self.inner
            .get_typed_value_at_absolute_position(attribute_id, position)
    }

    #[inline]
    fn get_untyped_value_at_absolute_position(
        &self,
        attribute_id: AttributeId,
        position: TupleId,
    ) -> Option<&[u8]> {
        self.inner
            .get_untyped_value_at_absolute_position(attribute_id, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Type, TypeId};

    fn accessor() -> ColumnVectorsValueAccessor {
        ColumnVectorsValueAccessor::try_new([
            Arc::new(ColumnVector::from_values(
                Type::int(false),
                [1, 2, 3].map(TypedValue::Int),
            )),
            Arc::new(ColumnVector::from_values(
                Type::double(true),
                [
                    TypedValue::Double(-1.0),
                    TypedValue::Null(TypeId::Double),
                    TypedValue::Double(9.5),
                ],
            )),
        ])
        .unwrap()
    }

    #[test]
    fn test_iteration_and_previous() {
        let mut accessor = accessor();
        accessor.begin_iteration();
        let mut visited = Vec::new();
        let mut revisited = false;
        while accessor.next() {
            visited.push(accessor.get_typed_value(0));
            if accessor.current_position() == 1 && !revisited {
                revisited = true;
                accessor.previous();
            }
        }
        assert_eq!(visited, [1, 2, 2, 3].map(TypedValue::Int));
    }

    #[test]
    fn test_tuple_id_sequence_adapter() {
        let sequence = TupleIdSequence::from_tuple_ids(3, [0, 2]);
        let mut adapter = TupleIdSequenceAdapter::new(accessor(), &sequence);
        assert_eq!(adapter.num_tuples(), 2);
        adapter.begin_iteration();
        let mut positions = Vec::new();
        while adapter.next() {
            positions.push((adapter.current_position(), adapter.get_typed_value(1)));
        }
        assert_eq!(
            positions,
            vec![(0, TypedValue::Double(-1.0)), (2, TypedValue::Double(9.5))]
        );
    }

    #[test]
    fn test_inconsistent_length() {
        let error = ColumnVectorsValueAccessor::try_new([
            Arc::new(ColumnVector::from_values(Type::int(false), [TypedValue::Int(1)])),
            Arc::new(ColumnVector::new(Type::int(false), 0)),
        ])
        .unwrap_err();
        let expect = expect_test::expect![
            "Column vectors have different length. Accessor has `1` tuples, the new column has `0` values"
        ];
        expect.assert_eq(&error.to_string());
    }

    #[test]
    fn test_display_accessor() {
        let expect = expect_test::expect![[r#"
            ┌─────┬─────────────┐
            │ Int │ Double NULL │
            ├─────┼─────────────┤
            │ 1   │ -1.0        │
            ├─────┼─────────────┤
            │ 2   │ Null        │
            ├─────┼─────────────┤
            │ 3   │ 9.5         │
            └─────┴─────────────┘"#]];
        expect.assert_eq(&accessor().to_string());
    }
}
