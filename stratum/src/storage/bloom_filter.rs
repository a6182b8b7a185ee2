//! Bloom filters applied by the aggregation
//!
//! A bloom filter is built by another operator (for example the build side of a hash
//! join) and attached to an attribute of the aggregated relation. Tuples whose
//! attribute value is rejected by the filter are dropped before aggregation. A bloom
//! filter never rejects a value that was inserted, it may accept a value that was not

use std::fmt::Debug;

use stratum_block::accessor::ValueAccessor;
use stratum_block::tuple_id_sequence::TupleIdSequence;
use stratum_block::value::TypedValue;
use stratum_block::{AttributeId, TupleId};

use crate::common::types::HashValue;
use crate::common::utils::hash::hash_typed_value;

/// Index of the bloom filter in the bloom filters handed to the operation state
pub type BloomFilterId = usize;

/// Membership test that may have false positives
pub trait BloomFilter: Debug + Send + Sync {
    /// Returns false if the value is definitely not in the filter. NULL is never in
    /// the filter
    fn contains(&self, value: &TypedValue) -> bool;

    /// Test the attribute of the tuples in `batch`, unset the tuples rejected by the
    /// filter in `matches`. Tuples outside of the batch are not touched
    fn filter_batch(
        &self,
        accessor: &dyn ValueAccessor,
        attribute_id: AttributeId,
        batch: &[TupleId],
        matches: &mut TupleIdSequence,
    ) {
        batch.iter().for_each(|&tuple_id| {
            let value = accessor.get_typed_value_at_absolute_position(attribute_id, tuple_id);
            if !self.contains(&value) {
                matches.set(tuple_id, false);
            }
        });
    }
}

/// Attach the bloom filter to the attribute of the aggregated relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomFilterAttachment {
    /// Index of the bloom filter
    pub bloom_filter_id: BloomFilterId,
    /// Attribute tested against the filter
    pub attribute_id: AttributeId,
}

/// Bloom filter on a bit array, it uses double hashing to derive `num_hashes` bit
/// positions from the hash of the value
#[derive(Debug, Clone)]
pub struct BitsetBloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BitsetBloomFilter {
    /// Create an empty filter with at least `num_bits` bits
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        let num_words = num_bits.max(1).div_ceil(u64::BITS as usize);
        Self {
            words: vec![0; num_words],
            num_bits: (num_words * u64::BITS as usize) as u64,
            num_hashes: num_hashes.max(1),
        }
    }

    /// Create a filter sized for `num_entries` values with the expected false
    /// positive probability
    pub fn with_false_positive_probability(num_entries: usize, fpp: f64) -> Self {
        let num_entries = num_entries.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-num_entries * fpp.ln() / (ln2 * ln2)).ceil() as usize;
        let num_hashes = ((num_bits as f64 / num_entries) * ln2).round() as u32;
        Self::new(num_bits, num_hashes)
    }

    /// Insert the value, NULL is ignored
    pub fn insert(&mut self, value: &TypedValue) {
        if value.is_null() {
            return;
        }
        let (words, num_bits) = (&mut self.words, self.num_bits);
        bit_positions(hash_typed_value(value), self.num_hashes, num_bits).for_each(|bit| {
            words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        });
    }
}

#[inline]
fn bit_positions(hash: HashValue, num_hashes: u32, num_bits: u64) -> impl Iterator<Item = u64> {
    let h1 = hash;
    let h2 = hash.rotate_left(32) | 1;
    (0..num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
}

impl BloomFilter for BitsetBloomFilter {
    #[inline]
    fn contains(&self, value: &TypedValue) -> bool {
        if value.is_null() {
            return false;
        }
        bit_positions(hash_typed_value(value), self.num_hashes, self.num_bits)
            .all(|bit| self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }
}
