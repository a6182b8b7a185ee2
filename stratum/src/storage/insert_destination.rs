//! Destination of the tuples produced by an operator

use std::fmt::Debug;

use parking_lot::Mutex;
use snafu::{Snafu, ensure};
use stratum_block::accessor::ValueAccessor;
use stratum_block::tuple::Tuple;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum InsertDestinationError {
    #[snafu(display(
        "Insert tuple with `{actual}` attributes into the destination with `{expected}` attributes"
    ))]
    InconsistentArity { expected: usize, actual: usize },
}

type Result<T> = std::result::Result<T, InsertDestinationError>;

/// Destination that accepts the output tuples. Many workers may insert into it
/// concurrently
pub trait InsertDestination: Debug + Send + Sync {
    /// Insert a single tuple
    fn insert_tuple(&self, tuple: Tuple) -> Result<()>;

    /// Insert all of the tuples visited by the accessor
    fn bulk_insert_tuples(&self, accessor: &mut dyn ValueAccessor) -> Result<()>;
}

/// [`InsertDestination`] that collects the tuples in memory
#[derive(Debug)]
pub struct MemoryInsertDestination {
    num_attributes: usize,
    tuples: Mutex<Vec<Tuple>>,
}

impl MemoryInsertDestination {
    /// Create a destination for tuples with `num_attributes` attributes
    pub fn new(num_attributes: usize) -> Self {
        Self {
            num_attributes,
            tuples: Mutex::new(Vec::new()),
        }
    }

    /// Number of tuples inserted
    pub fn num_tuples(&self) -> usize {
        self.tuples.lock().len()
    }

    /// Take the tuples inserted so far
    pub fn take_tuples(&self) -> Vec<Tuple> {
        std::mem::take(&mut *self.tuples.lock())
    }
}

impl InsertDestination for MemoryInsertDestination {
    fn insert_tuple(&self, tuple: Tuple) -> Result<()> {
        ensure!(
            tuple.len() == self.num_attributes,
            InconsistentAritySnafu {
                expected: self.num_attributes,
                actual: tuple.len()
            }
        );
        self.tuples.lock().push(tuple);
        Ok(())
    }

    fn bulk_insert_tuples(&self, accessor: &mut dyn ValueAccessor) -> Result<()> {
        ensure!(
            accessor.num_columns() == self.num_attributes,
            InconsistentAritySnafu {
                expected: self.num_attributes,
                actual: accessor.num_columns()
            }
        );
        let mut tuples = Vec::with_capacity(accessor.num_tuples());
        accessor.begin_iteration();
        while accessor.next() {
            tuples.push(Tuple::new(
                (0..self.num_attributes)
                    .map(|attribute_id| accessor.get_typed_value(attribute_id))
                    .collect(),
            ));
        }
        self.tuples.lock().extend(tuples);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stratum_block::accessor::ColumnVectorsValueAccessor;
    use stratum_block::column_vector::ColumnVector;
    use stratum_block::types::Type;
    use stratum_block::value::TypedValue;

    #[test]
    fn test_memory_insert_destination() {
        let destination = MemoryInsertDestination::new(2);
        destination
            .insert_tuple(Tuple::new(vec![TypedValue::Int(1), TypedValue::from("a")]))
            .unwrap();

        let mut accessor = ColumnVectorsValueAccessor::try_new([
            Arc::new(ColumnVector::from_values(
                Type::int(false),
                [2, 3].map(TypedValue::Int),
            )),
            Arc::new(ColumnVector::from_values(
                Type::var_char(4, false),
                ["b", "c"].map(TypedValue::from),
            )),
        ])
        .unwrap();
        destination.bulk_insert_tuples(&mut accessor).unwrap();
        assert_eq!(destination.num_tuples(), 3);

        let tuples = destination.take_tuples();
        assert_eq!(tuples[2].values(), [TypedValue::Int(3), TypedValue::from("c")]);
        assert_eq!(destination.num_tuples(), 0);
    }

    #[test]
    fn test_inconsistent_arity() {
        let destination = MemoryInsertDestination::new(2);
        let error = destination
            .insert_tuple(Tuple::new(vec![TypedValue::Int(1)]))
            .unwrap_err();
        let expect = expect_test::expect![[
            "Insert tuple with `1` attributes into the destination with `2` attributes"
        ]];
        expect.assert_eq(&error.to_string());
    }
}
