//! [`TupleIdSequence`] records the tuples of a block that pass a filter

use crate::TupleId;
use crate::bitmap::{Bitmap, BitmapOnesIter};

/// Set of tuple ids of a block, stored as a fixed length bitmap. The length is the
/// number of tuples in the block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleIdSequence {
    bitmap: Bitmap,
}

impl TupleIdSequence {
    /// Create an empty sequence for a block with `length` tuples
    #[inline]
    pub fn new(length: usize) -> Self {
        Self {
            bitmap: Bitmap::zeros(length),
        }
    }

    /// Create a sequence that contains all of the tuples in a block with `length` tuples
    pub fn all(length: usize) -> Self {
        Self {
            bitmap: std::iter::repeat_n(true, length).collect(),
        }
    }

    /// Create a sequence from tuple ids
    pub fn from_tuple_ids(length: usize, tuple_ids: impl IntoIterator<Item = TupleId>) -> Self {
        let mut sequence = Self::new(length);
        tuple_ids
            .into_iter()
            .for_each(|tuple_id| sequence.set(tuple_id, true));
        sequence
    }

    /// Include or exclude the tuple
    #[inline]
    pub fn set(&mut self, tuple_id: TupleId, on: bool) {
        self.bitmap.set(tuple_id, on);
    }

    /// Returns true if the tuple is in the sequence
    #[inline]
    pub fn get(&self, tuple_id: TupleId) -> bool {
        self.bitmap.get(tuple_id)
    }

    /// Number of tuples in the block
    #[inline]
    pub fn length(&self) -> usize {
        self.bitmap.len()
    }

    /// Number of tuples in the sequence
    #[inline]
    pub fn num_tuples(&self) -> usize {
        self.bitmap.count_ones()
    }

    /// Returns true if no tuple is in the sequence
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_tuples() == 0
    }

    /// Iterate the tuple ids in the sequence in ascending order
    #[inline]
    pub fn iter(&self) -> BitmapOnesIter<'_> {
        self.bitmap.iter_ones()
    }

    /// Only keep the tuples that are also in `other`
    #[inline]
    pub fn intersect_with(&mut self, other: &Self) {
        self.bitmap.and_inplace(&other.bitmap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_id_sequence() {
        let mut sequence = TupleIdSequence::from_tuple_ids(10, [1, 4, 9]);
        assert_eq!(sequence.num_tuples(), 3);
        assert_eq!(sequence.length(), 10);

        sequence.intersect_with(&TupleIdSequence::from_tuple_ids(10, [0, 4, 9]));
        assert_eq!(sequence.iter().collect::<Vec<_>>(), vec![4, 9]);

        let all = TupleIdSequence::all(3);
        assert_eq!(all.num_tuples(), 3);
        assert!(TupleIdSequence::new(5).is_empty());
    }
}
