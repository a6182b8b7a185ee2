//! Concurrent hash tables
//!
//! [`SeparateChainingHashTable`] maps composite keys to values. Many threads can
//! insert into it concurrently. Reads are safe at any time, however the result is
//! only complete when no insertion happens concurrently.
//!
//! Four properties of a table are fixed at compile time:
//!
//! - `RESIZABLE`: the table grows itself through the [`StorageManager`] when it runs
//! out of space. Fixed tables report [`HashTablePutResult::OutOfSpace`] instead
//!
//! - `SERIALIZABLE`: the table can be written into a self contained image and reloaded
//!
//! - `FORCE_KEY_COPY`: variable length key components are always copied into the
//! table. It is required when a resizable table is serializable
//!
//! - `ALLOW_DUPLICATE_KEYS`: a key may map to many values. `upsert` and
//! `get_single` only exist when duplicates are forbidden
//!
//! [`StorageManager`]: crate::storage::storage_manager::StorageManager

pub mod key_codec;
mod separate_chaining;
mod serialize;

pub use self::key_codec::KeyCodec;
pub use self::separate_chaining::{SeparateChainingHashTable, ValueRef};
pub use self::serialize::SerializableValue;

use snafu::Snafu;
use stratum_block::types::{Type, TypeId};

/// Number of slots for each bucket
pub const HASH_TABLE_LOAD_FACTOR: usize = 2;

/// Result of the insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTablePutResult {
    /// The entry is inserted
    Ok,
    /// The key exists and the table does not allow duplicate keys, nothing changed
    DuplicateKey,
    /// Fixed table does not have enough space for the entry, nothing changed
    OutOfSpace,
}

/// Implementation of the hash table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashTableImplType {
    /// [`SeparateChainingHashTable`] with arbitrary composite keys
    SeparateChaining,
    /// [`SeparateChainingHashTable`] with a single `Int` or `Long` key. Hash of the
    /// key is the key itself, so the keys are not hashed
    SimpleScalarSeparateChaining,
}

impl HashTableImplType {
    /// Returns true if the table of this implementation can be keyed by `key_types`
    pub fn supports_key_types(&self, key_types: &[Type]) -> bool {
        match self {
            Self::SeparateChaining => !key_types.is_empty(),
            Self::SimpleScalarSeparateChaining => {
                matches!(key_types, [key_type] if matches!(key_type.id(), TypeId::Int | TypeId::Long))
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum HashTableError {
    #[snafu(display(
        "Memory of the serialized hash table is too small. It has `{actual}` bytes, at least `{required}` bytes are required"
    ))]
    BlockMemoryTooSmall { required: usize, actual: usize },
    #[snafu(display("Serialized hash table is malformed: {reason}"))]
    MalformedBlock { reason: String },
}

/// Resizable table from keys to the aggregation states. Variable length keys are
/// copied, so the caller can drop the input blocks
pub type AggregationStateHashTable =
    SeparateChainingHashTable<crate::expressions::aggregation::AggregationState, true, false, true, false>;

/// Resizable set of keys used for eliminating duplicated aggregation arguments
pub type DistinctifyHashTable = SeparateChainingHashTable<(), true, false, true, false>;

/// Fixed table that can be serialized into a block
pub type SerializableHashTable<V> = SeparateChainingHashTable<V, false, true, true, false>;

/// Resizable table that allows duplicate keys
pub type DuplicateKeysHashTable<V> = SeparateChainingHashTable<V, true, false, true, true>;
