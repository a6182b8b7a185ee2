//! Bitmap

use std::fmt::Debug;

mod iterator;

/// Underling type that stores the bitmap
pub type BitStore = u64;
/// Number of bits the bit store contains
const BIT_STORE_BITS: usize = std::mem::size_of::<BitStore>() * 8;

pub use self::iterator::{BitmapIter, BitmapOnesIter};

/// Bitmap, each boolean is stored as a single bit
///
/// Note that if all of the elements in a column are not null, its validity [`Bitmap`]
/// could be empty
#[derive(Clone)]
pub struct Bitmap {
    /// Internal buffer stores the bits. Bits beyond `num_bits` are always zero
    buffer: Vec<BitStore>,
    /// Number of live bits in the allocation
    num_bits: usize,
    /// Number of ones in the bitmap
    count_ones: usize,
}

impl Bitmap {
    /// Create a new [`Bitmap`]
    #[inline]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            num_bits: 0,
            count_ones: 0,
        }
    }

    /// Create a new [`Bitmap`] with given capacity
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(elts(capacity)),
            num_bits: 0,
            count_ones: 0,
        }
    }

    /// Create a [`Bitmap`] with `num_bits` zeros
    #[inline]
    pub fn zeros(num_bits: usize) -> Self {
        Self {
            buffer: vec![0; elts(num_bits)],
            num_bits,
            count_ones: 0,
        }
    }

    /// Returns true if the bitmap is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Get number of bits in the bitmap
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Count the number of ones in the bitmap
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.count_ones
    }

    /// Count the number of zeros in the bitmap
    #[inline]
    pub fn count_zeros(&self) -> usize {
        self.num_bits - self.count_ones
    }

    /// Get the iterator that produce bool
    #[inline]
    pub fn iter(&self) -> BitmapIter<'_> {
        BitmapIter::new(self)
    }

    /// Get the iterator that produce the index that is true
    #[inline]
    pub fn iter_ones(&self) -> BitmapOnesIter<'_> {
        BitmapOnesIter::new(self)
    }

    /// Get a single bit
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(
            index < self.num_bits,
            "Index `{}` is out of range, bitmap only has `{}` bits",
            index,
            self.num_bits
        );
        // SAFETY: checked above
        unsafe { self.get_unchecked(index) }
    }

    /// Get a single bit without bound check
    ///
    /// # Safety
    ///
    /// `index < self.len()`, otherwise undefined behavior happens
    #[inline]
    pub unsafe fn get_unchecked(&self, index: usize) -> bool {
        #[cfg(feature = "verify")]
        assert!(index < self.len());

        unsafe { *self.buffer.get_unchecked(index / BIT_STORE_BITS) & (1 << (index % BIT_STORE_BITS)) != 0 }
    }

    /// Set a single bit
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`
    #[inline]
    pub fn set(&mut self, index: usize, val: bool) {
        assert!(
            index < self.num_bits,
            "Index `{}` is out of range, bitmap only has `{}` bits",
            index,
            self.num_bits
        );
        let bit_store = &mut self.buffer[index / BIT_STORE_BITS];
        let mask = 1 << (index % BIT_STORE_BITS);
        let old = *bit_store & mask != 0;
        if old != val {
            if val {
                *bit_store |= mask;
                self.count_ones += 1;
            } else {
                *bit_store &= !mask;
                self.count_ones -= 1;
            }
        }
    }

    /// Appends a single bit into the bitmap
    #[inline]
    pub fn push(&mut self, val: bool) {
        if self.num_bits % BIT_STORE_BITS == 0 {
            self.buffer.push(0);
        }
        let index = self.num_bits;
        self.num_bits += 1;
        if val {
            self.buffer[index / BIT_STORE_BITS] |= 1 << (index % BIT_STORE_BITS);
            self.count_ones += 1;
        }
    }

    /// Bitwise and with `other` in place
    ///
    /// # Panics
    ///
    /// Panics if two bitmaps have different length
    pub fn and_inplace(&mut self, other: &Self) {
        assert_eq!(
            self.num_bits, other.num_bits,
            "Bitwise and requires two bitmaps have same length"
        );
        let mut count_ones = 0;
        self.buffer
            .iter_mut()
            .zip(&other.buffer)
            .for_each(|(lhs, rhs)| {
                *lhs &= *rhs;
                count_ones += lhs.count_ones() as usize;
            });
        self.count_ones = count_ones;
    }

    /// Clear the bitmap, it does not free the underling buffer
    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.num_bits = 0;
        self.count_ones = 0;
    }
}

impl Default for Bitmap {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap {{ len: {}, data: ", self.num_bits)?;
        f.debug_list().entries(self.iter()).finish()?;
        write!(f, "}}")
    }
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        // Bits beyond `num_bits` are always zero
        self.num_bits == other.num_bits && self.buffer == other.buffer
    }
}

impl Eq for Bitmap {}

impl FromIterator<bool> for Bitmap {
    fn from_iter<T: IntoIterator<Item = bool>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let mut bitmap = Self::with_capacity(iter.size_hint().0);
        iter.for_each(|val| bitmap.push(val));
        bitmap
    }
}

/// Compute the number of [`BitStore`] to store the required number of bits
#[inline]
pub fn elts(num_bits: usize) -> usize {
    num_bits.div_ceil(BIT_STORE_BITS)
}
