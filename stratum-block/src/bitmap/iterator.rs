//! Iterator of the bitmap

use std::iter::FusedIterator;

use super::{BIT_STORE_BITS, BitStore, Bitmap};

#[derive(Debug)]
/// Iterator of the bitmap
pub struct BitmapIter<'a> {
    buffer: &'a [BitStore],
    bit_index: usize,
    end: usize,
}

impl<'a> BitmapIter<'a> {
    /// Create a new iterator of the bitmap
    pub fn new(bitmap: &'a Bitmap) -> Self {
        Self {
            buffer: &bitmap.buffer,
            bit_index: 0,
            end: bitmap.num_bits,
        }
    }
}

impl Iterator for BitmapIter<'_> {
    type Item = bool;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.bit_index == self.end {
            return None;
        }

        let old = self.bit_index;
        self.bit_index += 1;
        Some(self.buffer[old / BIT_STORE_BITS] & (1 << (old % BIT_STORE_BITS)) != 0)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let size = self.end - self.bit_index;
        (size, Some(size))
    }
}

impl ExactSizeIterator for BitmapIter<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.end - self.bit_index
    }
}

impl FusedIterator for BitmapIter<'_> {}

/// Iterator of the index that is set in the bitmap
#[derive(Debug)]
pub struct BitmapOnesIter<'a> {
    buffer: &'a [BitStore],
    current: BitStore,
    bit_store_index: usize,
}

impl<'a> BitmapOnesIter<'a> {
    /// Create a new [`BitmapOnesIter`]
    pub(super) fn new(bitmap: &'a Bitmap) -> Self {
        // Bits beyond `num_bits` are always zero, we do not need to mask the last store
        let current = bitmap.buffer.first().copied().unwrap_or(0);
        Self {
            buffer: &bitmap.buffer,
            current,
            bit_store_index: 0,
        }
    }
}

impl Iterator for BitmapOnesIter<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        while self.current == 0 {
            self.bit_store_index += 1;
            if self.bit_store_index >= self.buffer.len() {
                return None;
            }

            self.current = self.buffer[self.bit_store_index];
        }

        let index =
            (self.bit_store_index * BIT_STORE_BITS) + self.current.trailing_zeros() as usize;

        self.current &= self.current - 1;
        Some(index)
    }
}

impl FusedIterator for BitmapOnesIter<'_> {}
