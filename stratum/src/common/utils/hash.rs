//! Utils for hash

use std::hash::BuildHasher;

use stratum_block::value::TypedValue;

use crate::common::types::HashValue;

/// Default hash builder
pub type BuildHasherDefault = ahash::RandomState;

/// Constant build hasher default
pub const BUILD_HASHER_DEFAULT: BuildHasherDefault = BuildHasherDefault::with_seeds(9, 7, 9, 8);

/// Hash of a single value
#[inline]
pub fn hash_typed_value(value: &TypedValue) -> HashValue {
    BUILD_HASHER_DEFAULT.hash_one(value)
}

/// Mix `hash` into the `seed`. The combination is order sensitive:
/// `combine_hashes(combine_hashes(a, b), c)` differs from
/// `combine_hashes(combine_hashes(a, c), b)` in general
#[inline]
pub fn combine_hashes(seed: HashValue, hash: HashValue) -> HashValue {
    seed ^ (hash
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2))
}

/// Shift the hash away from the two reserved values `0` and `HashValue::MAX` that
/// the hash tables use as sentinels
#[inline]
pub fn adjust_hash(hash: HashValue) -> HashValue {
    hash + (hash == 0) as HashValue - (hash == HashValue::MAX) as HashValue
}
