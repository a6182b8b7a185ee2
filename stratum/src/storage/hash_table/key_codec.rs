//! Key codec of the hash tables
//!
//! A key is a sequence of [`TypedValue`]s, one component per key type. The codec
//! decides how each component is stored in a bucket:
//!
//! - Fixed length components and NULLs are stored by value in the bucket
//!
//! - Variable length components are copied into the variable length key storage of
//! the table when the table forces key copy, and the bucket records their offset and
//! length (never raw pointers, the storage may be moved by resize). Otherwise the
//! bucket shares the value with the caller
//!
//! The hash of a composite key is the left fold of the component hashes with
//! [`combine_hashes`], in the declared order of the key types. Codec of the
//! [`HashTableImplType::SimpleScalarSeparateChaining`] table only accepts a single
//! integer key, whose hash is the key itself

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use stratum_block::types::Type;
use stratum_block::value::TypedValue;

use super::HashTableImplType;
use crate::common::types::HashValue;
use crate::common::utils::hash::{combine_hashes, hash_typed_value};
use crate::storage::storage_manager::StorageBlob;

/// Stored form of a single key component
#[derive(Debug, Clone)]
pub(crate) enum StoredKeyComponent {
    /// Stored by value
    Inline(TypedValue),
    /// Copied into the variable length key storage of the table
    Copied { offset: usize, len: usize },
}

/// Stored form of the key
pub(crate) type StoredKey = Box<[StoredKeyComponent]>;

/// Variable length region of the hash table, backed by a [`StorageBlob`]
///
/// Space is reserved by [`Self::allocate`] and released by [`Self::deallocate`] if
/// the insertion fails. The bytes are written at the offset claimed by
/// [`Self::claim`], so reservation and placement are decoupled
#[derive(Debug)]
pub(crate) struct VariableLengthKeyStorage {
    blob: Arc<StorageBlob>,
    /// Bytes reserved by the writers
    allocated: AtomicUsize,
    /// Offset of the next write
    next_offset: AtomicUsize,
}

impl VariableLengthKeyStorage {
    pub(crate) fn new(blob: Arc<StorageBlob>) -> Self {
        Self {
            blob,
            allocated: AtomicUsize::new(0),
            next_offset: AtomicUsize::new(0),
        }
    }

    /// Create the storage with the bytes that have been written
    pub(crate) fn with_written_bytes(blob: Arc<StorageBlob>, written: usize) -> Self {
        debug_assert!(written <= blob.size());
        Self {
            blob,
            allocated: AtomicUsize::new(written),
            next_offset: AtomicUsize::new(written),
        }
    }

    #[inline]
    pub(crate) fn blob(&self) -> &Arc<StorageBlob> {
        &self.blob
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.blob.size()
    }

    #[inline]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Relaxed)
    }

    /// Number of bytes that have been claimed for writing
    #[inline]
    pub(crate) fn written(&self) -> usize {
        self.next_offset.load(Relaxed)
    }

    /// Reserve `required` bytes, returns false if the storage does not have enough
    /// space
    #[inline]
    pub(crate) fn allocate(&self, required: usize) -> bool {
        if required == 0 {
            return true;
        }
        let previous = self.allocated.fetch_add(required, Relaxed);
        if previous + required > self.size() {
            self.allocated.fetch_sub(required, Relaxed);
            false
        } else {
            true
        }
    }

    /// Release the bytes reserved by [`Self::allocate`]
    #[inline]
    pub(crate) fn deallocate(&self, bytes: usize) {
        if bytes > 0 {
            self.allocated.fetch_sub(bytes, Relaxed);
        }
    }

    /// Claim the offset for writing `len` bytes, the bytes must have been reserved
    #[inline]
    pub(crate) fn claim(&self, len: usize) -> usize {
        self.next_offset.fetch_add(len, Relaxed)
    }

    /// Reset the storage to empty
    #[inline]
    pub(crate) fn reset(&mut self) {
        *self.allocated.get_mut() = 0;
        *self.next_offset.get_mut() = 0;
    }

    /// Write the bytes at the claimed `offset`
    ///
    /// # Safety
    ///
    /// `offset..offset + bytes.len()` is claimed by the caller exclusively
    #[inline]
    pub(crate) unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        unsafe { self.blob.write(offset, bytes) }
    }

    /// Read the written bytes
    ///
    /// # Safety
    ///
    /// The write of the range has been published to the caller
    #[inline]
    pub(crate) unsafe fn read(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { self.blob.read(offset, len) }
    }
}

/// Codec that hashes, stores, compares and reconstructs the keys
#[derive(Debug, Clone)]
pub struct KeyCodec {
    key_types: Vec<Type>,
    force_key_copy: bool,
    estimated_variable_key_size: usize,
    impl_type: HashTableImplType,
}

impl KeyCodec {
    /// Create a new codec of the [`HashTableImplType::SeparateChaining`] table
    ///
    /// # Panics
    ///
    /// Panics if `key_types` is empty
    pub fn new(key_types: Vec<Type>, force_key_copy: bool) -> Self {
        Self::with_impl_type(HashTableImplType::SeparateChaining, key_types, force_key_copy)
    }

    /// Create a new codec of the `impl_type` table
    ///
    /// # Panics
    ///
    /// Panics if `key_types` is empty or `impl_type` does not support them, see
    /// [`HashTableImplType::supports_key_types`]
    pub fn with_impl_type(
        impl_type: HashTableImplType,
        key_types: Vec<Type>,
        force_key_copy: bool,
    ) -> Self {
        assert!(!key_types.is_empty(), "Hash table requires at least one key type");
        assert!(
            impl_type.supports_key_types(&key_types),
            "`{:?}` hash table does not support the key types `{:?}`",
            impl_type,
            key_types
        );
        let estimated_variable_key_size = key_types
            .iter()
            .filter(|type_| type_.is_variable_length())
            .map(|type_| type_.estimate_average_byte_length())
            .sum();
        Self {
            key_types,
            force_key_copy,
            estimated_variable_key_size,
            impl_type,
        }
    }

    /// Implementation of the table that uses the codec
    #[inline]
    pub fn impl_type(&self) -> HashTableImplType {
        self.impl_type
    }

    /// Types of the key components
    #[inline]
    pub fn key_types(&self) -> &[Type] {
        &self.key_types
    }

    /// Estimated bytes each key occupies in the variable length key storage
    #[inline]
    pub fn estimated_variable_key_size(&self) -> usize {
        if self.force_key_copy {
            self.estimated_variable_key_size
        } else {
            0
        }
    }

    /// Hash of the key, folds the hashes of the components in order. It is not
    /// adjusted, see [`adjust_hash`]
    ///
    /// [`adjust_hash`]: crate::common::utils::hash::adjust_hash
    pub fn hash_key(&self, key: &[TypedValue]) -> HashValue {
        debug_assert_eq!(key.len(), self.key_types.len());
        let Some((first, rest)) = key.split_first() else {
            panic!("Hash an empty key")
        };
        if self.impl_type == HashTableImplType::SimpleScalarSeparateChaining {
            return match first {
                TypedValue::Int(v) => *v as i64 as HashValue,
                TypedValue::Long(v) => *v as HashValue,
                _ => hash_typed_value(first),
            };
        }
        rest.iter().fold(hash_typed_value(first), |hash, component| {
            combine_hashes(hash, hash_typed_value(component))
        })
    }

    /// Number of bytes the key occupies in the variable length key storage
    #[inline]
    pub fn variable_length_copy_size(&self, key: &[TypedValue]) -> usize {
        if self.force_key_copy {
            key.iter()
                .filter(|component| {
                    component.type_id().is_variable_length() && !component.is_null()
                })
                .map(TypedValue::data_size)
                .sum()
        } else {
            0
        }
    }

    /// Encode the key. Variable length components are written at `*position`, which
    /// is advanced by the written bytes
    ///
    /// # Safety
    ///
    /// The range starting at `*position` with [`Self::variable_length_copy_size`]
    /// bytes is claimed by the caller
    pub(crate) unsafe fn write_key(
        &self,
        key: &[TypedValue],
        storage: &VariableLengthKeyStorage,
        position: &mut usize,
    ) -> StoredKey {
        key.iter()
            .map(|component| match component {
                TypedValue::VarChar(v) if self.force_key_copy => {
                    let offset = *position;
                    // SAFETY: guaranteed by the caller
                    unsafe { storage.write(offset, v.as_bytes()) };
                    *position += v.len();
                    StoredKeyComponent::Copied {
                        offset,
                        len: v.len(),
                    }
                }
                _ => StoredKeyComponent::Inline(component.clone()),
            })
            .collect()
    }

    /// Compare the stored key with the lookup key
    ///
    /// # Safety
    ///
    /// Write of the stored key has been published to the caller
    pub(crate) unsafe fn key_matches(
        &self,
        stored: &[StoredKeyComponent],
        key: &[TypedValue],
        storage: &VariableLengthKeyStorage,
    ) -> bool {
        stored
            .iter()
            .zip(key)
            .all(|(stored, component)| match (stored, component) {
                (StoredKeyComponent::Inline(value), component) => value == component,
                (StoredKeyComponent::Copied { offset, len }, TypedValue::VarChar(v)) => {
                    // SAFETY: guaranteed by the caller
                    *len == v.len() && unsafe { storage.read(*offset, *len) } == v.as_bytes()
                }
                (StoredKeyComponent::Copied { .. }, _) => false,
            })
    }

    /// Reconstruct the key
    ///
    /// # Safety
    ///
    /// Write of the stored key has been published to the caller
    pub(crate) unsafe fn read_key(
        &self,
        stored: &[StoredKeyComponent],
        storage: &VariableLengthKeyStorage,
    ) -> Vec<TypedValue> {
        stored
            .iter()
            .map(|component| match component {
                StoredKeyComponent::Inline(value) => value.clone(),
                StoredKeyComponent::Copied { offset, len } => {
                    // SAFETY: guaranteed by the caller
                    let bytes = unsafe { storage.read(*offset, *len) };
                    // Copied bytes come from a `str`
                    TypedValue::VarChar(String::from_utf8_lossy(bytes).into())
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_block::types::TypeId;

    fn storage(size: usize) -> VariableLengthKeyStorage {
        VariableLengthKeyStorage::new(Arc::new(StorageBlob::detached(size)))
    }

    #[test]
    fn test_hash_is_left_fold() {
        let codec = KeyCodec::new(vec![Type::int(false), Type::var_char(10, false)], true);
        let key = [TypedValue::Int(7), TypedValue::from("seven")];
        assert_eq!(
            codec.hash_key(&key),
            combine_hashes(
                hash_typed_value(&TypedValue::Int(7)),
                hash_typed_value(&TypedValue::from("seven"))
            )
        );

        let scalar = KeyCodec::new(vec![Type::long(false)], false);
        assert_eq!(
            scalar.hash_key(&[TypedValue::Long(3)]),
            hash_typed_value(&TypedValue::Long(3))
        );
    }

    #[test]
    fn test_simple_scalar_hash_is_the_key() {
        let codec = KeyCodec::with_impl_type(
            HashTableImplType::SimpleScalarSeparateChaining,
            vec![Type::int(true)],
            true,
        );
        assert_eq!(codec.impl_type(), HashTableImplType::SimpleScalarSeparateChaining);
        assert_eq!(codec.hash_key(&[TypedValue::Int(42)]), 42);
        assert_eq!(codec.hash_key(&[TypedValue::Int(-1)]), HashValue::MAX);
        assert_eq!(
            codec.hash_key(&[TypedValue::Null(TypeId::Int)]),
            hash_typed_value(&TypedValue::Null(TypeId::Int))
        );
        assert_eq!(codec.estimated_variable_key_size(), 0);
    }

    #[test]
    #[should_panic(expected = "`SimpleScalarSeparateChaining` hash table does not support the key types")]
    fn test_simple_scalar_rejects_composite_key() {
        KeyCodec::with_impl_type(
            HashTableImplType::SimpleScalarSeparateChaining,
            vec![Type::int(false), Type::long(false)],
            true,
        );
    }

    #[test]
    fn test_copied_key() {
        let codec = KeyCodec::new(vec![Type::var_char(10, true), Type::int(false)], true);
        let storage = storage(32);
        let key = [TypedValue::from("abc"), TypedValue::Int(1)];
        assert_eq!(codec.variable_length_copy_size(&key), 3);
        assert!(storage.allocate(3));

        let mut position = storage.claim(3);
        let stored = unsafe { codec.write_key(&key, &storage, &mut position) };
        assert_eq!(position, 3);
        assert!(matches!(
            stored[0],
            StoredKeyComponent::Copied { offset: 0, len: 3 }
        ));

        unsafe {
            assert!(codec.key_matches(&stored, &key, &storage));
            assert!(!codec.key_matches(
                &stored,
                &[TypedValue::from("abd"), TypedValue::Int(1)],
                &storage
            ));
            assert!(!codec.key_matches(
                &stored,
                &[TypedValue::Null(TypeId::VarChar), TypedValue::Int(1)],
                &storage
            ));
            assert_eq!(codec.read_key(&stored, &storage), key.to_vec());
        }
    }

    #[test]
    fn test_shared_key_does_not_copy() {
        let codec = KeyCodec::new(vec![Type::var_char(10, false)], false);
        let storage = storage(0);
        let key = [TypedValue::from("shared")];
        assert_eq!(codec.variable_length_copy_size(&key), 0);
        assert_eq!(codec.estimated_variable_key_size(), 0);

        let mut position = 0;
        let stored = unsafe { codec.write_key(&key, &storage, &mut position) };
        assert!(matches!(stored[0], StoredKeyComponent::Inline(_)));
        assert!(unsafe { codec.key_matches(&stored, &key, &storage) });
    }

    #[test]
    fn test_allocate_variable_length_storage() {
        let storage = storage(10);
        assert!(storage.allocate(6));
        assert!(!storage.allocate(5));
        assert_eq!(storage.allocated(), 6);
        storage.deallocate(6);
        assert!(storage.allocate(10));
    }
}
