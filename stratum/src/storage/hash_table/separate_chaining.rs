//! Hash table that resolves collisions with separate chaining
//!
//! # Layout
//!
//! - Slots: array of atomic chain heads. `0` means empty, `usize::MAX` means a thread
//! is attaching the first bucket of the chain, otherwise it is the index of the first
//! bucket plus one
//!
//! - Buckets: array of entries, allocated in insertion order. Each bucket has an atomic
//! `next` pointer with the same encoding as the slots, the hash, the stored key and the
//! value
//!
//! - Variable length key storage: a blob that holds the copied variable length key
//! components, see [`KeyCodec`]
//!
//! # Insertion protocol
//!
//! The inserter walks the chain of the slot and compare-and-swaps the tail pointer from
//! `0` to pending. The winner allocates a bucket, writes the hash, key and value, then
//! publishes the bucket by storing its index into the pending pointer with release
//! ordering. Other threads spin while they observe the pending value. Therefore, chains
//! are only appended and a published bucket never changes until resize.
//!
//! All of the operations hold the shared side of a spin reader writer lock. Resize holds
//! the exclusive side, it rebuilds the whole table and swaps it in

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam_utils::Backoff;
use strength_reduce::StrengthReducedU64;
use stratum_block::AttributeId;
use stratum_block::accessor::ValueAccessor;
use stratum_block::types::Type;
use stratum_block::value::TypedValue;

use super::key_codec::{KeyCodec, StoredKey, VariableLengthKeyStorage};
use super::{HASH_TABLE_LOAD_FACTOR, HashTableImplType, HashTablePutResult};
use crate::common::types::HashValue;
use crate::common::utils::hash::adjust_hash;
use crate::common::utils::prime::next_prime_number;
use crate::common::utils::spin::{SpinSharedGuard, SpinSharedMutex};
use crate::storage::storage_manager::{BlockId, StorageBlob, StorageManager};

/// Slot or chain pointer that points to nothing
pub(super) const EMPTY: usize = 0;
/// Slot or chain pointer whose successor is being written
pub(super) const PENDING: usize = usize::MAX;

pub(super) struct Bucket<V> {
    pub(super) next: AtomicUsize,
    /// Set after hash, key and value are written
    ready: AtomicBool,
    hash: UnsafeCell<HashValue>,
    key: UnsafeCell<MaybeUninit<StoredKey>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

// SAFETY: hash, key and value are only written by the thread that allocated the
// bucket, before the bucket is published with release ordering. Readers only read them
// after observing the publication with acquire ordering
unsafe impl<V: Send> Send for Bucket<V> {}
// SAFETY: see above. Values are shared between the readers, so `V: Sync` is required
unsafe impl<V: Send + Sync> Sync for Bucket<V> {}

impl<V> Bucket<V> {
    fn new() -> Self {
        Self {
            next: AtomicUsize::new(EMPTY),
            ready: AtomicBool::new(false),
            hash: UnsafeCell::new(0),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns true if the entry of the bucket has been written
    #[inline]
    pub(super) fn is_ready(&self) -> bool {
        self.ready.load(Acquire)
    }

    /// # Safety
    ///
    /// The bucket is published to the caller
    #[inline]
    pub(super) unsafe fn hash(&self) -> HashValue {
        unsafe { *self.hash.get() }
    }

    /// # Safety
    ///
    /// The bucket is published to the caller
    #[inline]
    pub(super) unsafe fn key(&self) -> &StoredKey {
        unsafe { (*self.key.get()).assume_init_ref() }
    }

    /// # Safety
    ///
    /// The bucket is published to the caller
    #[inline]
    pub(super) unsafe fn value(&self) -> &V {
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Write the entry and mark the bucket as ready
    ///
    /// # Safety
    ///
    /// The bucket is allocated by the caller exclusively and it is not published
    #[inline]
    pub(super) unsafe fn write(&self, hash: HashValue, key: StoredKey, value: V) {
        unsafe {
            *self.hash.get() = hash;
            (*self.key.get()).write(key);
            (*self.value.get()).write(value);
        }
        self.ready.store(true, Release);
    }

    /// Move the entry out of the bucket, the bucket becomes empty
    fn take(&mut self) -> Option<(HashValue, StoredKey, V)> {
        if !std::mem::replace(self.ready.get_mut(), false) {
            return None;
        }
        // SAFETY: ready bucket is initialized, and it is no longer ready, nobody will
        // read or drop the moved entry
        unsafe {
            Some((
                *self.hash.get_mut(),
                self.key.get_mut().assume_init_read(),
                self.value.get_mut().assume_init_read(),
            ))
        }
    }
}

impl<V> Drop for Bucket<V> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// Slots, buckets and variable length key storage of the table. Replaced as a whole by
/// resize
pub(super) struct Storage<V> {
    pub(super) slots: Box<[AtomicUsize]>,
    slot_modulo: StrengthReducedU64,
    pub(super) buckets: Box<[Bucket<V>]>,
    pub(super) buckets_allocated: AtomicUsize,
    pub(super) variable_length: VariableLengthKeyStorage,
}

impl<V> Storage<V> {
    pub(super) fn new(
        num_slots: usize,
        num_buckets: usize,
        variable_length: VariableLengthKeyStorage,
    ) -> Self {
        assert!(num_slots > 0 && num_buckets > 0);
        Self {
            slots: (0..num_slots).map(|_| AtomicUsize::new(EMPTY)).collect(),
            slot_modulo: StrengthReducedU64::new(num_slots as u64),
            buckets: (0..num_buckets).map(|_| Bucket::new()).collect(),
            buckets_allocated: AtomicUsize::new(0),
            variable_length,
        }
    }

    /// Slot of the hash
    #[inline]
    pub(super) fn slot(&self, hash: HashValue) -> &AtomicUsize {
        &self.slots[(hash % self.slot_modulo) as usize]
    }

    #[inline]
    pub(super) fn slot_index(&self, hash: HashValue) -> usize {
        (hash % self.slot_modulo) as usize
    }

    #[inline]
    pub(super) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of buckets that have been allocated. The counter may exceed the number
    /// of buckets temporarily when threads race for the last bucket
    #[inline]
    pub(super) fn num_allocated(&self) -> usize {
        self.buckets_allocated.load(Relaxed).min(self.buckets.len())
    }

    /// Returns true if the storage can hold `extra_buckets` more entries (at least one)
    /// and `extra_variable_storage` more bytes of variable length keys
    fn has_room(&self, extra_buckets: usize, extra_variable_storage: usize) -> bool {
        self.buckets_allocated.load(Relaxed) + extra_buckets.max(1) <= self.buckets.len()
            && self.variable_length.allocated() + extra_variable_storage
                <= self.variable_length.size()
    }

    /// Iterate the written buckets in the order of allocation
    #[inline]
    pub(super) fn entries(&self) -> impl Iterator<Item = &Bucket<V>> {
        self.buckets[..self.num_allocated()]
            .iter()
            .filter(|bucket| bucket.is_ready())
    }

    fn clear(&mut self) {
        self.slots
            .iter_mut()
            .for_each(|slot| *slot.get_mut() = EMPTY);
        let num_allocated = self.num_allocated();
        self.buckets[..num_allocated].iter_mut().for_each(|bucket| {
            drop(bucket.take());
            *bucket.next.get_mut() = EMPTY;
        });
        *self.buckets_allocated.get_mut() = 0;
        self.variable_length.reset();
    }
}

/// Where the insertion should happen
enum Locate<'s> {
    /// Bucket is allocated, publish it through the `pending` pointer
    Allocated {
        bucket: usize,
        pending: &'s AtomicUsize,
    },
    /// Bucket or variable length storage is exhausted
    OutOfSpace,
    /// Bucket with the same hash exists and duplicate keys are forbidden. Caller
    /// should compare the keys, and continue from this bucket if they are different
    HashCollision { bucket: usize },
}

enum PutOutcome<V> {
    Inserted,
    DuplicateKey,
    /// Value is given back for retrying
    OutOfSpace(V),
}

/// Range of buckets and variable length storage reserved for a bulk insertion
#[derive(Debug)]
struct PreallocationState {
    bucket_position: usize,
    variable_length_key_position: usize,
}

/// Concurrent hash table that resolves collisions with separate chaining, see the
/// module level documentation for the layout and the [`hash_table`] module for the
/// compile time properties
///
/// [`hash_table`]: crate::storage::hash_table
pub struct SeparateChainingHashTable<
    V,
    const RESIZABLE: bool,
    const SERIALIZABLE: bool,
    const FORCE_KEY_COPY: bool,
    const ALLOW_DUPLICATE_KEYS: bool,
> {
    codec: KeyCodec,
    storage: SpinSharedMutex<Storage<V>>,
    /// Only resizable tables have it
    storage_manager: Option<Arc<StorageManager>>,
}

/// Number of slots and buckets for the expected number of entries
fn sizing(num_entries: usize) -> (usize, usize) {
    let num_slots = next_prime_number(num_entries.max(1) * HASH_TABLE_LOAD_FACTOR);
    (num_slots, num_slots / HASH_TABLE_LOAD_FACTOR)
}

/// Read the key of the current tuple. Returns false if the key contains NULL and the
/// caller asks for checking it
#[inline]
fn load_key<A: ValueAccessor + ?Sized>(
    accessor: &A,
    key_attr_ids: &[AttributeId],
    check_for_null_keys: bool,
    key: &mut Vec<TypedValue>,
) -> bool {
    key.clear();
    for &attr in key_attr_ids {
        let value = accessor.get_typed_value(attr);
        if check_for_null_keys && value.is_null() {
            return false;
        }
        key.push(value);
    }
    true
}

impl<V, const SERIALIZABLE: bool, const FORCE_KEY_COPY: bool, const ALLOW_DUPLICATE_KEYS: bool>
    SeparateChainingHashTable<V, true, SERIALIZABLE, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    /// Create a resizable table that is expected to hold `num_entries` entries. Storage
    /// for the variable length keys is allocated from the `storage_manager`
    pub fn new(
        key_types: Vec<Type>,
        num_entries: usize,
        storage_manager: Arc<StorageManager>,
    ) -> Self {
        let codec = KeyCodec::new(key_types, FORCE_KEY_COPY);
        let (num_slots, num_buckets) = sizing(num_entries);
        let blob = storage_manager.allocate_blob(num_buckets * codec.estimated_variable_key_size());
        Self::from_parts(
            codec,
            Storage::new(num_slots, num_buckets, VariableLengthKeyStorage::new(blob)),
            Some(storage_manager),
        )
    }

    /// Id of the blob that holds the variable length keys. It changes after resize
    pub fn blob_id(&self) -> BlockId {
        self.storage.read().variable_length.blob().id()
    }
}

impl<V, const FORCE_KEY_COPY: bool, const ALLOW_DUPLICATE_KEYS: bool>
    SeparateChainingHashTable<V, true, false, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    /// Create a resizable table of the `impl_type`. Serialized image always hashes the
    /// keys, so only the tables that are not serializable can choose the implementation
    ///
    /// # Panics
    ///
    /// Panics if `impl_type` does not support the `key_types`
    pub fn with_impl_type(
        impl_type: HashTableImplType,
        key_types: Vec<Type>,
        num_entries: usize,
        storage_manager: Arc<StorageManager>,
    ) -> Self {
        let codec = KeyCodec::with_impl_type(impl_type, key_types, FORCE_KEY_COPY);
        let (num_slots, num_buckets) = sizing(num_entries);
        let blob = storage_manager.allocate_blob(num_buckets * codec.estimated_variable_key_size());
        Self::from_parts(
            codec,
            Storage::new(num_slots, num_buckets, VariableLengthKeyStorage::new(blob)),
            Some(storage_manager),
        )
    }

    /// Implementation of the table
    pub fn impl_type(&self) -> HashTableImplType {
        self.codec.impl_type()
    }
}

impl<V, const SERIALIZABLE: bool, const FORCE_KEY_COPY: bool, const ALLOW_DUPLICATE_KEYS: bool>
    SeparateChainingHashTable<V, false, SERIALIZABLE, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    /// Create a fixed table that can hold at least `num_entries` entries. Variable
    /// length storage is sized with the estimated key length
    pub fn with_capacity(key_types: Vec<Type>, num_entries: usize) -> Self {
        let codec = KeyCodec::new(key_types, FORCE_KEY_COPY);
        let variable_length_bytes = sizing(num_entries).1 * codec.estimated_variable_key_size();
        Self::with_codec_and_variable_storage(codec, num_entries, variable_length_bytes)
    }

    /// Create a fixed table that can hold at least `num_entries` entries and
    /// `variable_length_bytes` bytes of the variable length keys
    pub fn with_capacity_and_variable_storage(
        key_types: Vec<Type>,
        num_entries: usize,
        variable_length_bytes: usize,
    ) -> Self {
        let codec = KeyCodec::new(key_types, FORCE_KEY_COPY);
        Self::with_codec_and_variable_storage(codec, num_entries, variable_length_bytes)
    }

    fn with_codec_and_variable_storage(
        codec: KeyCodec,
        num_entries: usize,
        variable_length_bytes: usize,
    ) -> Self {
        let (num_slots, num_buckets) = sizing(num_entries);
        let blob = Arc::new(StorageBlob::detached(variable_length_bytes));
        Self::from_parts(
            codec,
            Storage::new(num_slots, num_buckets, VariableLengthKeyStorage::new(blob)),
            None,
        )
    }
}

impl<
    V,
    const RESIZABLE: bool,
    const SERIALIZABLE: bool,
    const FORCE_KEY_COPY: bool,
    const ALLOW_DUPLICATE_KEYS: bool,
> SeparateChainingHashTable<V, RESIZABLE, SERIALIZABLE, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    pub(super) fn from_parts(
        codec: KeyCodec,
        storage: Storage<V>,
        storage_manager: Option<Arc<StorageManager>>,
    ) -> Self {
        const {
            assert!(
                !(RESIZABLE && SERIALIZABLE) || FORCE_KEY_COPY,
                "Resizable and serializable hash table must force key copy"
            )
        };
        debug_assert_eq!(RESIZABLE, storage_manager.is_some());
        Self {
            codec,
            storage: SpinSharedMutex::new(storage),
            storage_manager,
        }
    }

    #[inline]
    pub(super) fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    #[inline]
    pub(super) fn storage(&self) -> SpinSharedGuard<'_, Storage<V>> {
        self.storage.read()
    }

    /// Types of the key components
    #[inline]
    pub fn key_types(&self) -> &[Type] {
        self.codec.key_types()
    }

    /// Number of entries in the table
    pub fn num_entries(&self) -> usize {
        self.storage.read().num_allocated()
    }

    /// Number of entries the table can hold before resize
    pub fn num_buckets(&self) -> usize {
        self.storage.read().num_buckets()
    }

    /// Remove all of the entries. Capacity is kept
    pub fn clear(&mut self) {
        self.storage.get_mut().clear();
    }

    /// Insert the scalar key with its value
    #[inline]
    pub fn put(&self, key: &TypedValue, value: V) -> HashTablePutResult {
        self.put_composite_key(std::slice::from_ref(key), value)
    }

    /// Insert the composite key with its value
    #[inline]
    pub fn put_composite_key(&self, key: &[TypedValue], value: V) -> HashTablePutResult {
        self.put_hashed(key, self.codec.hash_key(key), value)
    }

    pub(super) fn put_hashed(
        &self,
        key: &[TypedValue],
        hash: HashValue,
        mut value: V,
    ) -> HashTablePutResult {
        let hash = adjust_hash(hash);
        let variable_key_size = self.codec.variable_length_copy_size(key);
        loop {
            let outcome = {
                let storage = self.storage.read();
                self.put_internal(&storage, key, hash, value, None)
            };
            match outcome {
                PutOutcome::Inserted => return HashTablePutResult::Ok,
                PutOutcome::DuplicateKey => return HashTablePutResult::DuplicateKey,
                PutOutcome::OutOfSpace(v) => {
                    if !RESIZABLE {
                        return HashTablePutResult::OutOfSpace;
                    }
                    value = v;
                    self.resize(0, variable_key_size);
                }
            }
        }
    }

    /// Insert the entries built from the tuples of the accessor. The key is read from
    /// `key_attr_id`, and the value is created by calling `functor` once per inserted
    /// tuple. If `check_for_null_keys` is true, tuples with NULL key are skipped
    ///
    /// Stops at the first failure, entries inserted before it are kept
    #[inline]
    pub fn put_value_accessor<A, F>(
        &self,
        accessor: &mut A,
        key_attr_id: AttributeId,
        check_for_null_keys: bool,
        functor: F,
    ) -> HashTablePutResult
    where
        A: ValueAccessor + ?Sized,
        F: FnMut(&A) -> V,
    {
        self.put_value_accessor_composite_key(
            accessor,
            std::slice::from_ref(&key_attr_id),
            check_for_null_keys,
            functor,
        )
    }

    /// Composite key version of [`Self::put_value_accessor`]
    pub fn put_value_accessor_composite_key<A, F>(
        &self,
        accessor: &mut A,
        key_attr_ids: &[AttributeId],
        check_for_null_keys: bool,
        mut functor: F,
    ) -> HashTablePutResult
    where
        A: ValueAccessor + ?Sized,
        F: FnMut(&A) -> V,
    {
        let mut key = Vec::with_capacity(key_attr_ids.len());
        let mut storage = self.storage.read();

        if ALLOW_DUPLICATE_KEYS {
            // Count the entries and reserve the space for all of them in one shot
            let mut total_entries = 0;
            let mut total_variable_key_size = 0;
            accessor.begin_iteration();
            while accessor.next() {
                if load_key(accessor, key_attr_ids, check_for_null_keys, &mut key) {
                    total_entries += 1;
                    total_variable_key_size += self.codec.variable_length_copy_size(&key);
                }
            }
            accessor.begin_iteration();

            loop {
                if let Some(mut prealloc) =
                    preallocate_for_bulk_insert(&storage, total_entries, total_variable_key_size)
                {
                    while accessor.next() {
                        if !load_key(accessor, key_attr_ids, check_for_null_keys, &mut key) {
                            continue;
                        }
                        let hash = adjust_hash(self.codec.hash_key(&key));
                        let value = functor(accessor);
                        match self.put_internal(&storage, &key, hash, value, Some(&mut prealloc)) {
                            PutOutcome::Inserted => (),
                            PutOutcome::DuplicateKey | PutOutcome::OutOfSpace(_) => {
                                unreachable!("Preallocated insertion can not fail")
                            }
                        }
                    }
                    return HashTablePutResult::Ok;
                }

                if !RESIZABLE {
                    // Fall back to inserting one by one, until the space is exhausted
                    break;
                }
                drop(storage);
                self.resize(total_entries, total_variable_key_size);
                storage = self.storage.read();
            }
        } else {
            accessor.begin_iteration();
        }

        while accessor.next() {
            if !load_key(accessor, key_attr_ids, check_for_null_keys, &mut key) {
                continue;
            }
            let hash = adjust_hash(self.codec.hash_key(&key));
            let mut value = functor(accessor);
            loop {
                match self.put_internal(&storage, &key, hash, value, None) {
                    PutOutcome::Inserted => break,
                    PutOutcome::DuplicateKey => return HashTablePutResult::DuplicateKey,
                    PutOutcome::OutOfSpace(v) => {
                        if !RESIZABLE {
                            return HashTablePutResult::OutOfSpace;
                        }
                        value = v;
                        let variable_key_size = self.codec.variable_length_copy_size(&key);
                        drop(storage);
                        self.resize(0, variable_key_size);
                        storage = self.storage.read();
                    }
                }
            }
        }

        HashTablePutResult::Ok
    }

    /// Append the clones of all of the values matching the scalar key, in insertion
    /// order
    #[inline]
    pub fn get_all(&self, key: &TypedValue, values: &mut Vec<V>)
    where
        V: Clone,
    {
        self.get_all_composite_key(std::slice::from_ref(key), values)
    }

    /// Append the clones of all of the values matching the composite key, in insertion
    /// order
    pub fn get_all_composite_key(&self, key: &[TypedValue], values: &mut Vec<V>)
    where
        V: Clone,
    {
        let hash = adjust_hash(self.codec.hash_key(key));
        let storage = self.storage.read();
        self.for_each_match(&storage, key, hash, |value| {
            values.push(value.clone());
            true
        });
    }

    /// Returns true if the scalar key exists
    #[inline]
    pub fn has_key(&self, key: &TypedValue) -> bool {
        self.has_composite_key(std::slice::from_ref(key))
    }

    /// Returns true if the composite key exists
    pub fn has_composite_key(&self, key: &[TypedValue]) -> bool {
        let hash = adjust_hash(self.codec.hash_key(key));
        let storage = self.storage.read();
        let mut found = false;
        self.for_each_match(&storage, key, hash, |_| {
            found = true;
            false
        });
        found
    }

    /// Look up the key of each tuple in the accessor, call
    /// `functor(accessor, value)` for every match
    #[inline]
    pub fn get_all_from_value_accessor<A, F>(
        &self,
        accessor: &mut A,
        key_attr_id: AttributeId,
        check_for_null_keys: bool,
        functor: F,
    ) where
        A: ValueAccessor + ?Sized,
        F: FnMut(&A, &V),
    {
        self.lookup_value_accessor(
            accessor,
            std::slice::from_ref(&key_attr_id),
            check_for_null_keys,
            |_| {},
            functor,
        )
    }

    /// Composite key version of [`Self::get_all_from_value_accessor`]
    #[inline]
    pub fn get_all_from_value_accessor_composite_key<A, F>(
        &self,
        accessor: &mut A,
        key_attr_ids: &[AttributeId],
        check_for_null_keys: bool,
        functor: F,
    ) where
        A: ValueAccessor + ?Sized,
        F: FnMut(&A, &V),
    {
        self.lookup_value_accessor(accessor, key_attr_ids, check_for_null_keys, |_| {}, functor)
    }

    /// Same with [`Self::get_all_from_value_accessor`], and call `has_match(accessor)`
    /// once before the first match of each tuple
    #[inline]
    pub fn get_all_from_value_accessor_with_extra_work_for_first_match<A, M, F>(
        &self,
        accessor: &mut A,
        key_attr_id: AttributeId,
        check_for_null_keys: bool,
        has_match: M,
        functor: F,
    ) where
        A: ValueAccessor + ?Sized,
        M: FnMut(&A),
        F: FnMut(&A, &V),
    {
        self.lookup_value_accessor(
            accessor,
            std::slice::from_ref(&key_attr_id),
            check_for_null_keys,
            has_match,
            functor,
        )
    }

    /// Composite key version of
    /// [`Self::get_all_from_value_accessor_with_extra_work_for_first_match`]
    #[inline]
    pub fn get_all_from_value_accessor_composite_key_with_extra_work_for_first_match<A, M, F>(
        &self,
        accessor: &mut A,
        key_attr_ids: &[AttributeId],
        check_for_null_keys: bool,
        has_match: M,
        functor: F,
    ) where
        A: ValueAccessor + ?Sized,
        M: FnMut(&A),
        F: FnMut(&A, &V),
    {
        self.lookup_value_accessor(accessor, key_attr_ids, check_for_null_keys, has_match, functor)
    }

    fn lookup_value_accessor<A, M, F>(
        &self,
        accessor: &mut A,
        key_attr_ids: &[AttributeId],
        check_for_null_keys: bool,
        mut has_match: M,
        mut functor: F,
    ) where
        A: ValueAccessor + ?Sized,
        M: FnMut(&A),
        F: FnMut(&A, &V),
    {
        let storage = self.storage.read();
        let mut key = Vec::with_capacity(key_attr_ids.len());
        accessor.begin_iteration();
        while accessor.next() {
            if !load_key(accessor, key_attr_ids, check_for_null_keys, &mut key) {
                continue;
            }
            let hash = adjust_hash(self.codec.hash_key(&key));
            let accessor = &*accessor;
            let mut first_match = true;
            self.for_each_match(&storage, &key, hash, |value| {
                if first_match {
                    has_match(accessor);
                    first_match = false;
                }
                functor(accessor, value);
                true
            });
        }
    }

    /// Call `functor` with every scalar key and its value, in insertion order. Returns
    /// the number of visited entries
    #[inline]
    pub fn for_each<F>(&self, mut functor: F) -> usize
    where
        F: FnMut(&TypedValue, &V),
    {
        self.for_each_composite_key(|key, value| functor(&key[0], value))
    }

    /// Call `functor` with every composite key and its value, in insertion order.
    /// Returns the number of visited entries
    pub fn for_each_composite_key<F>(&self, mut functor: F) -> usize
    where
        F: FnMut(&[TypedValue], &V),
    {
        let storage = self.storage.read();
        let mut count = 0;
        storage.entries().for_each(|bucket| {
            // SAFETY: `entries` only yields the ready buckets
            unsafe {
                let key = self.codec.read_key(bucket.key(), &storage.variable_length);
                functor(&key, bucket.value());
            }
            count += 1;
        });
        count
    }

    /// Walk the chain of the hash, call `f` with the values whose key matches. Stops
    /// when `f` returns false, or at the first match if duplicate keys are forbidden
    fn for_each_match<'s>(
        &self,
        storage: &'s Storage<V>,
        key: &[TypedValue],
        hash: HashValue,
        mut f: impl FnMut(&'s V) -> bool,
    ) {
        let mut next = storage.slot(hash).load(Acquire);
        // Pending pointer is the end of the chain for now
        while next != EMPTY && next != PENDING {
            let bucket = &storage.buckets[next - 1];
            // SAFETY: bucket is published through the chain
            unsafe {
                if bucket.hash() == hash
                    && self
                        .codec
                        .key_matches(bucket.key(), key, &storage.variable_length)
                {
                    if !f(bucket.value()) || !ALLOW_DUPLICATE_KEYS {
                        return;
                    }
                }
            }
            next = bucket.next.load(Acquire);
        }
    }

    /// Find the place for inserting an entry with the hash. `allocate_variable_key`
    /// bytes of variable length storage are reserved after winning the tail
    fn locate_bucket_for_insertion<'s>(
        &self,
        storage: &'s Storage<V>,
        hash: HashValue,
        allocate_variable_key: usize,
        prealloc: Option<&mut PreallocationState>,
        start_bucket: Option<usize>,
    ) -> Locate<'s> {
        let mut pending = match start_bucket {
            Some(bucket) => &storage.buckets[bucket].next,
            None => storage.slot(hash),
        };
        let backoff = Backoff::new();
        loop {
            match pending.compare_exchange(EMPTY, PENDING, AcqRel, Acquire) {
                Ok(_) => {
                    // We own the tail of the chain
                    if !storage.variable_length.allocate(allocate_variable_key) {
                        pending.store(EMPTY, Release);
                        return Locate::OutOfSpace;
                    }
                    let bucket = match prealloc {
                        Some(prealloc) => {
                            let bucket = prealloc.bucket_position;
                            prealloc.bucket_position += 1;
                            bucket
                        }
                        None => {
                            let bucket = storage.buckets_allocated.fetch_add(1, Relaxed);
                            if bucket >= storage.num_buckets() {
                                storage.buckets_allocated.fetch_sub(1, Relaxed);
                                storage.variable_length.deallocate(allocate_variable_key);
                                pending.store(EMPTY, Release);
                                return Locate::OutOfSpace;
                            }
                            bucket
                        }
                    };
                    return Locate::Allocated { bucket, pending };
                }
                Err(mut current) => {
                    while current == PENDING {
                        backoff.snooze();
                        current = pending.load(Acquire);
                    }
                    if current == EMPTY {
                        // Writer gave up the tail, race for it again
                        continue;
                    }
                    let bucket = current - 1;
                    // SAFETY: bucket is published through the chain
                    if !ALLOW_DUPLICATE_KEYS && unsafe { storage.buckets[bucket].hash() } == hash {
                        return Locate::HashCollision { bucket };
                    }
                    pending = &storage.buckets[bucket].next;
                }
            }
        }
    }

    /// Write the entry into the allocated bucket and publish it
    #[allow(clippy::too_many_arguments)]
    fn write_bucket(
        &self,
        storage: &Storage<V>,
        bucket: usize,
        pending: &AtomicUsize,
        key: &[TypedValue],
        hash: HashValue,
        value: V,
        mut variable_key_position: usize,
    ) {
        // SAFETY: the bucket and the variable length range are claimed by this thread
        unsafe {
            let stored_key =
                self.codec
                    .write_key(key, &storage.variable_length, &mut variable_key_position);
            storage.buckets[bucket].write(hash, stored_key, value);
        }
        pending.store(bucket + 1, Release);
    }

    fn put_internal(
        &self,
        storage: &Storage<V>,
        key: &[TypedValue],
        hash: HashValue,
        value: V,
        mut prealloc: Option<&mut PreallocationState>,
    ) -> PutOutcome<V> {
        let variable_key_size = self.codec.variable_length_copy_size(key);
        if prealloc.is_none() {
            if storage.buckets_allocated.load(Relaxed) >= storage.num_buckets() {
                return PutOutcome::OutOfSpace(value);
            }
            if !storage.variable_length.allocate(variable_key_size) {
                return PutOutcome::OutOfSpace(value);
            }
        }

        let mut start_bucket = None;
        loop {
            match self.locate_bucket_for_insertion(
                storage,
                hash,
                0,
                prealloc.as_deref_mut(),
                start_bucket,
            ) {
                Locate::Allocated { bucket, pending } => {
                    let position = match prealloc {
                        Some(prealloc) => {
                            let position = prealloc.variable_length_key_position;
                            prealloc.variable_length_key_position += variable_key_size;
                            position
                        }
                        None => storage.variable_length.claim(variable_key_size),
                    };
                    self.write_bucket(storage, bucket, pending, key, hash, value, position);
                    return PutOutcome::Inserted;
                }
                Locate::OutOfSpace => {
                    storage.variable_length.deallocate(variable_key_size);
                    return PutOutcome::OutOfSpace(value);
                }
                Locate::HashCollision { bucket } => {
                    // SAFETY: bucket is published through the chain
                    let matched = unsafe {
                        self.codec.key_matches(
                            storage.buckets[bucket].key(),
                            key,
                            &storage.variable_length,
                        )
                    };
                    if matched {
                        storage.variable_length.deallocate(variable_key_size);
                        return PutOutcome::DuplicateKey;
                    }
                    start_bucket = Some(bucket);
                }
            }
        }
    }

    /// Grow the table so it has room for `extra_buckets` more entries and
    /// `extra_variable_storage` more bytes of variable length keys. Nothing happens if
    /// another thread has grown it already
    fn resize(&self, extra_buckets: usize, extra_variable_storage: usize) {
        let Some(storage_manager) = &self.storage_manager else {
            unreachable!("Only resizable hash table can resize")
        };

        let mut storage = self.storage.write();
        if storage.has_room(extra_buckets, extra_variable_storage) {
            return;
        }

        let num_allocated = storage.num_allocated();
        let resized_num_slots = next_prime_number(
            (storage.num_buckets() + extra_buckets / 2) * HASH_TABLE_LOAD_FACTOR * 2,
        );
        let resized_num_buckets =
            (resized_num_slots / HASH_TABLE_LOAD_FACTOR).max(num_allocated + extra_buckets.max(1));

        let variable_storage_used = storage.variable_length.allocated();
        let mut variable_storage_required =
            resized_num_buckets * self.codec.estimated_variable_key_size();
        // Resize is triggered by a key that is larger than the remaining space
        if extra_variable_storage > 0
            && variable_storage_used + extra_variable_storage > storage.variable_length.size()
        {
            variable_storage_required += extra_variable_storage;
        }
        let variable_storage_required =
            variable_storage_required.max(variable_storage_used + extra_variable_storage);

        let blob = storage_manager.allocate_blob(variable_storage_required);
        let written = storage.variable_length.written();
        // SAFETY: the exclusive lock is held, all of the writes have been published and
        // the new blob is not shared yet
        unsafe { blob.write(0, storage.variable_length.read(0, written)) };

        let mut resized = Storage::new(
            resized_num_slots,
            resized_num_buckets,
            VariableLengthKeyStorage::with_written_bytes(blob, written),
        );
        // Bucket indexes are kept, offsets of the copied keys stay valid as well
        storage.buckets[..num_allocated]
            .iter_mut()
            .enumerate()
            .for_each(|(index, bucket)| {
                if let Some((hash, key, value)) = bucket.take() {
                    // SAFETY: the resized storage is owned by this thread
                    unsafe { resized.buckets[index].write(hash, key, value) };
                }
            });
        *resized.buckets_allocated.get_mut() = num_allocated;

        // Push the buckets to the head of the chains in reverse order, so the chains
        // keep the insertion order
        (0..num_allocated).rev().for_each(|index| {
            let bucket = &resized.buckets[index];
            if bucket.is_ready() {
                // SAFETY: written above
                let slot = resized.slot(unsafe { bucket.hash() });
                bucket.next.store(slot.load(Relaxed), Relaxed);
                slot.store(index + 1, Relaxed);
            }
        });

        let original_blob_id = storage.variable_length.blob().id();
        tracing::trace!(
            "SeparateChainingHashTable: resized from `{}` buckets to `{}` buckets, variable length storage has `{}` bytes",
            storage.num_buckets(),
            resized_num_buckets,
            variable_storage_required
        );
        *storage = resized;
        drop(storage);

        if let Err(e) = storage_manager.delete_block_or_blob_file(original_blob_id) {
            tracing::warn!(
                "SeparateChainingHashTable: failed to delete the original blob: {}",
                e
            );
        }
    }
}

/// Reserve the buckets and variable length storage for inserting `total_entries`
/// entries without contention
fn preallocate_for_bulk_insert<V>(
    storage: &Storage<V>,
    total_entries: usize,
    total_variable_key_size: usize,
) -> Option<PreallocationState> {
    if !storage.variable_length.allocate(total_variable_key_size) {
        return None;
    }

    let mut original = storage.buckets_allocated.load(Relaxed);
    loop {
        if original + total_entries > storage.num_buckets() {
            storage.variable_length.deallocate(total_variable_key_size);
            return None;
        }
        match storage.buckets_allocated.compare_exchange_weak(
            original,
            original + total_entries,
            Relaxed,
            Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => original = actual,
        }
    }

    Some(PreallocationState {
        bucket_position: original,
        variable_length_key_position: storage.variable_length.claim(total_variable_key_size),
    })
}

impl<V, const RESIZABLE: bool, const SERIALIZABLE: bool, const FORCE_KEY_COPY: bool>
    SeparateChainingHashTable<V, RESIZABLE, SERIALIZABLE, FORCE_KEY_COPY, false>
{
    /// Find the value of the scalar key, create it with the clone of the
    /// `initial_value` if it does not exist. Then call `functor` with the value.
    ///
    /// Returns false if the fixed table runs out of space, the functor is not called
    /// in this case
    ///
    /// The functor is called with the shared lock of the table held, it must not call
    /// any method of this table
    #[inline]
    pub fn upsert<F>(&self, key: &TypedValue, initial_value: &V, functor: F) -> bool
    where
        V: Clone,
        F: FnOnce(&V),
    {
        self.upsert_composite_key(std::slice::from_ref(key), initial_value, functor)
    }

    /// Composite key version of [`Self::upsert`]
    #[inline]
    pub fn upsert_composite_key<F>(&self, key: &[TypedValue], initial_value: &V, functor: F) -> bool
    where
        V: Clone,
        F: FnOnce(&V),
    {
        self.upsert_hashed(key, self.codec.hash_key(key), initial_value, functor)
    }

    pub(super) fn upsert_hashed<F>(
        &self,
        key: &[TypedValue],
        hash: HashValue,
        initial_value: &V,
        functor: F,
    ) -> bool
    where
        V: Clone,
        F: FnOnce(&V),
    {
        let hash = adjust_hash(hash);
        let variable_key_size = self.codec.variable_length_copy_size(key);
        loop {
            {
                let storage = self.storage.read();
                if let Some(value) =
                    self.upsert_internal(&storage, key, hash, variable_key_size, initial_value)
                {
                    functor(value);
                    return true;
                }
            }
            if !RESIZABLE {
                return false;
            }
            self.resize(0, variable_key_size);
        }
    }

    /// Upsert the key of each tuple in the accessor and call `functor(accessor, value)`.
    /// If `check_for_null_keys` is true, tuples with NULL key are skipped.
    ///
    /// Returns false if the fixed table runs out of space
    #[inline]
    pub fn upsert_value_accessor<A, F>(
        &self,
        accessor: &mut A,
        key_attr_id: AttributeId,
        check_for_null_keys: bool,
        initial_value: &V,
        functor: F,
    ) -> bool
    where
        A: ValueAccessor + ?Sized,
        V: Clone,
        F: FnMut(&A, &V),
    {
        self.upsert_value_accessor_composite_key(
            accessor,
            std::slice::from_ref(&key_attr_id),
            check_for_null_keys,
            initial_value,
            functor,
        )
    }

    /// Composite key version of [`Self::upsert_value_accessor`]
    pub fn upsert_value_accessor_composite_key<A, F>(
        &self,
        accessor: &mut A,
        key_attr_ids: &[AttributeId],
        check_for_null_keys: bool,
        initial_value: &V,
        mut functor: F,
    ) -> bool
    where
        A: ValueAccessor + ?Sized,
        V: Clone,
        F: FnMut(&A, &V),
    {
        let mut key = Vec::with_capacity(key_attr_ids.len());
        let mut storage = self.storage.read();
        accessor.begin_iteration();
        while accessor.next() {
            if !load_key(accessor, key_attr_ids, check_for_null_keys, &mut key) {
                continue;
            }
            let hash = adjust_hash(self.codec.hash_key(&key));
            let variable_key_size = self.codec.variable_length_copy_size(&key);
            loop {
                if let Some(value) =
                    self.upsert_internal(&storage, &key, hash, variable_key_size, initial_value)
                {
                    functor(accessor, value);
                    break;
                }
                if !RESIZABLE {
                    return false;
                }
                drop(storage);
                self.resize(0, variable_key_size);
                storage = self.storage.read();
            }
        }
        true
    }

    /// Get the value of the scalar key. The table can not be resized while the
    /// returned reference is alive
    #[inline]
    pub fn get_single(&self, key: &TypedValue) -> Option<ValueRef<'_, V>> {
        self.get_single_composite_key(std::slice::from_ref(key))
    }

    /// Get the value of the composite key. The table can not be resized while the
    /// returned reference is alive
    pub fn get_single_composite_key(&self, key: &[TypedValue]) -> Option<ValueRef<'_, V>> {
        let hash = adjust_hash(self.codec.hash_key(key));
        let guard = self.storage.read();
        // SAFETY: the reference is stored with the guard in `ValueRef`, it does not
        // outlive the guard
        let storage = unsafe { guard.data_unbounded() };
        let mut found = None;
        self.for_each_match(storage, key, hash, |value| {
            found = Some(value);
            false
        });
        found.map(|value| ValueRef {
            _guard: guard,
            value,
        })
    }

    fn upsert_internal<'s>(
        &self,
        storage: &'s Storage<V>,
        key: &[TypedValue],
        hash: HashValue,
        variable_key_size: usize,
        initial_value: &V,
    ) -> Option<&'s V>
    where
        V: Clone,
    {
        if variable_key_size > 0
            && storage.variable_length.allocated() + variable_key_size
                > storage.variable_length.size()
        {
            return None;
        }

        let mut start_bucket = None;
        loop {
            match self.locate_bucket_for_insertion(
                storage,
                hash,
                variable_key_size,
                None,
                start_bucket,
            ) {
                Locate::Allocated { bucket, pending } => {
                    let position = storage.variable_length.claim(variable_key_size);
                    self.write_bucket(
                        storage,
                        bucket,
                        pending,
                        key,
                        hash,
                        initial_value.clone(),
                        position,
                    );
                    // SAFETY: published by this thread
                    return Some(unsafe { storage.buckets[bucket].value() });
                }
                Locate::OutOfSpace => return None,
                Locate::HashCollision { bucket } => {
                    let bucket_ref = &storage.buckets[bucket];
                    // SAFETY: bucket is published through the chain
                    unsafe {
                        if self
                            .codec
                            .key_matches(bucket_ref.key(), key, &storage.variable_length)
                        {
                            return Some(bucket_ref.value());
                        }
                    }
                    start_bucket = Some(bucket);
                }
            }
        }
    }
}

impl<
    V,
    const RESIZABLE: bool,
    const SERIALIZABLE: bool,
    const FORCE_KEY_COPY: bool,
    const ALLOW_DUPLICATE_KEYS: bool,
> Debug
    for SeparateChainingHashTable<V, RESIZABLE, SERIALIZABLE, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let storage = self.storage.read();
        f.debug_struct("SeparateChainingHashTable")
            .field("key_types", &self.codec.key_types())
            .field("num_entries", &storage.num_allocated())
            .field("num_buckets", &storage.num_buckets())
            .field("num_slots", &storage.slots.len())
            .field("variable_length_bytes", &storage.variable_length.allocated())
            .finish()
    }
}

impl<
    V,
    const RESIZABLE: bool,
    const SERIALIZABLE: bool,
    const FORCE_KEY_COPY: bool,
    const ALLOW_DUPLICATE_KEYS: bool,
> Drop
    for SeparateChainingHashTable<V, RESIZABLE, SERIALIZABLE, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    fn drop(&mut self) {
        if let Some(storage_manager) = &self.storage_manager {
            let blob_id = self.storage.get_mut().variable_length.blob().id();
            if let Err(e) = storage_manager.delete_block_or_blob_file(blob_id) {
                tracing::warn!("SeparateChainingHashTable: failed to delete the blob: {}", e);
            }
        }
    }
}


/// Reference to a value in the hash table. It holds the shared lock of the table, so
/// do not insert into the same table while it is alive
pub struct ValueRef<'a, V> {
    _guard: SpinSharedGuard<'a, Storage<V>>,
    value: &'a V,
}

impl<V> Deref for ValueRef<'_, V> {
    type Target = V;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<V: Debug> Debug for ValueRef<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ValueRef").field(self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hash_table::DuplicateKeysHashTable;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::AtomicU64;
    use stratum_block::accessor::ColumnVectorsValueAccessor;
    use stratum_block::column_vector::ColumnVector;
    use stratum_block::types::TypeId;

    type UniqueTable<V> = SeparateChainingHashTable<V, true, false, true, false>;
    type FixedTable<V> = SeparateChainingHashTable<V, false, false, true, false>;
    type FixedDuplicateTable<V> = SeparateChainingHashTable<V, false, false, true, true>;

    fn long_key(v: i64) -> TypedValue {
        TypedValue::Long(v)
    }

    #[test]
    fn test_put_and_get() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<u64>::new(vec![Type::long(false)], 4, storage_manager);
        assert_eq!(table.put(&long_key(1), 10), HashTablePutResult::Ok);
        assert_eq!(table.put(&long_key(2), 20), HashTablePutResult::Ok);
        assert_eq!(table.put(&long_key(1), 11), HashTablePutResult::DuplicateKey);

        assert_eq!(table.num_entries(), 2);
        assert_eq!(*table.get_single(&long_key(1)).unwrap(), 10);
        assert!(table.get_single(&long_key(3)).is_none());
        assert!(table.has_key(&long_key(2)));
        assert!(!table.has_key(&long_key(3)));
    }

    #[test]
    fn test_upsert_counts() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<Arc<AtomicU64>>::new(
            vec![Type::var_char(16, false)],
            2,
            storage_manager,
        );
        ["a", "b", "a", "c", "a", "b"].into_iter().for_each(|key| {
            // New key owns a fresh counter
            let fresh = Arc::new(AtomicU64::new(0));
            assert!(table.upsert(&TypedValue::from(key), &fresh, |counter| {
                counter.fetch_add(1, Relaxed);
            }));
        });

        let mut counts = Vec::new();
        let visited = table.for_each(|key, counter| {
            counts.push((key.to_string(), counter.load(Relaxed)));
        });
        assert_eq!(visited, 3);
        assert_eq!(
            counts,
            vec![
                ("a".to_string(), 3),
                ("b".to_string(), 2),
                ("c".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_signed_zero_keys_share_the_entry() {
        let storage_manager = Arc::new(StorageManager::new());
        let table =
            UniqueTable::<Arc<AtomicU64>>::new(vec![Type::double(false)], 4, storage_manager);
        [-0.0, 0.0, -0.0, 1.5].into_iter().for_each(|key| {
            let fresh = Arc::new(AtomicU64::new(0));
            assert!(table.upsert(&TypedValue::Double(key), &fresh, |counter| {
                counter.fetch_add(1, Relaxed);
            }));
        });
        assert_eq!(table.num_entries(), 2);
        assert_eq!(table.get_single(&TypedValue::Double(0.0)).unwrap().load(Relaxed), 3);
        assert_eq!(table.get_single(&TypedValue::Double(-0.0)).unwrap().load(Relaxed), 3);
    }

    #[test]
    fn test_simple_scalar_table() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<Arc<AtomicU64>>::with_impl_type(
            HashTableImplType::SimpleScalarSeparateChaining,
            vec![Type::long(true)],
            2,
            storage_manager,
        );
        assert_eq!(table.impl_type(), HashTableImplType::SimpleScalarSeparateChaining);

        // 0 and 1, -1 and -2 have the same adjusted hash. Table resizes several times
        let keys = (-100..100).chain([i64::MIN, i64::MAX]).collect::<Vec<_>>();
        keys.iter().chain(&keys).for_each(|&key| {
            let fresh = Arc::new(AtomicU64::new(0));
            assert!(table.upsert(&TypedValue::Long(key), &fresh, |counter| {
                counter.fetch_add(1, Relaxed);
            }));
        });
        assert_eq!(table.num_entries(), keys.len());
        keys.iter().for_each(|&key| {
            let counter = table.get_single(&TypedValue::Long(key)).unwrap();
            assert_eq!(counter.load(Relaxed), 2);
        });

        let mut visited = Vec::new();
        table.for_each(|key, _| visited.push(key.clone()));
        visited.sort_by_key(|key| key.as_i64());
        assert_eq!(visited, keys_sorted(&keys));
    }

    fn keys_sorted(keys: &[i64]) -> Vec<TypedValue> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.into_iter().map(TypedValue::Long).collect()
    }

    #[test]
    fn test_reserved_hashes_are_adjusted() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<u32>::new(vec![Type::int(false)], 8, storage_manager);
        // Raw hash 0 and 1 both become 1, MAX and MAX - 1 both become MAX - 1
        assert_eq!(
            table.put_hashed(&[TypedValue::Int(0)], 0, 0),
            HashTablePutResult::Ok
        );
        assert_eq!(
            table.put_hashed(&[TypedValue::Int(1)], 1, 1),
            HashTablePutResult::Ok
        );
        assert_eq!(
            table.put_hashed(&[TypedValue::Int(2)], HashValue::MAX, 2),
            HashTablePutResult::Ok
        );
        assert_eq!(
            table.put_hashed(&[TypedValue::Int(3)], HashValue::MAX - 1, 3),
            HashTablePutResult::Ok
        );
        assert_eq!(
            table.put_hashed(&[TypedValue::Int(1)], 0, 9),
            HashTablePutResult::DuplicateKey
        );
        assert_eq!(table.num_entries(), 4);

        let storage = table.storage();
        storage.entries().for_each(|bucket| {
            let hash = unsafe { bucket.hash() };
            assert_ne!(hash, 0);
            assert_ne!(hash, HashValue::MAX);
        });
    }

    #[test]
    fn test_hash_collisions_with_different_keys() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<u32>::new(vec![Type::int(false)], 2, storage_manager);
        (0..20).for_each(|i| {
            assert_eq!(
                table.put_hashed(&[TypedValue::Int(i)], 42, i as u32),
                HashTablePutResult::Ok
            );
        });
        (0..20).for_each(|i| {
            assert!(table.upsert_hashed(&[TypedValue::Int(i)], 42, &0, |v| {
                assert_eq!(*v, i as u32)
            }));
        });
        assert_eq!(table.num_entries(), 20);
    }

    #[test]
    fn test_fixed_table_out_of_space() {
        let table = FixedTable::<u64>::with_capacity(vec![Type::long(false)], 3);
        let capacity = table.num_buckets();
        (0..capacity as i64).for_each(|i| {
            assert_eq!(table.put(&long_key(i), i as u64), HashTablePutResult::Ok);
        });
        assert_eq!(
            table.put(&long_key(capacity as i64), 0),
            HashTablePutResult::OutOfSpace
        );
        assert!(!table.upsert(&long_key(-1), &0, |_| unreachable!()));
        assert_eq!(table.num_entries(), capacity);
        // Existing keys can still be upserted
        assert!(table.upsert(&long_key(0), &0, |v| assert_eq!(*v, 0)));
    }

    #[test]
    fn test_fixed_table_variable_storage_exhausted() {
        let table = FixedTable::<u64>::with_capacity_and_variable_storage(
            vec![Type::var_char(32, false)],
            10,
            8,
        );
        assert_eq!(table.put(&TypedValue::from("12345"), 1), HashTablePutResult::Ok);
        assert_eq!(
            table.put(&TypedValue::from("6789"), 2),
            HashTablePutResult::OutOfSpace
        );
        assert_eq!(table.put(&TypedValue::from("678"), 3), HashTablePutResult::Ok);
        assert_eq!(table.num_entries(), 2);
    }

    #[test]
    fn test_resize_keeps_entries_and_changes_blob() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<u64>::new(
            vec![Type::var_char(8, false), Type::int(true)],
            1,
            Arc::clone(&storage_manager),
        );
        let original_blob_id = table.blob_id();
        let original_buckets = table.num_buckets();

        let keys = (0..100)
            .map(|i| {
                vec![
                    TypedValue::from(format!("key-{}", i).as_str()),
                    if i % 7 == 0 {
                        TypedValue::Null(TypeId::Int)
                    } else {
                        TypedValue::Int(i)
                    },
                ]
            })
            .collect::<Vec<_>>();
        keys.iter().enumerate().for_each(|(i, key)| {
            assert_eq!(table.put_composite_key(key, i as u64), HashTablePutResult::Ok);
        });

        assert!(table.num_buckets() > original_buckets);
        assert_ne!(table.blob_id(), original_blob_id);
        assert!(!storage_manager.has_blob(original_blob_id));
        assert_eq!(storage_manager.num_blobs(), 1);

        keys.iter().enumerate().for_each(|(i, key)| {
            assert_eq!(*table.get_single_composite_key(key).unwrap(), i as u64);
        });
        let mut visited = Vec::new();
        table.for_each_composite_key(|key, value| visited.push((key.to_vec(), *value)));
        assert_eq!(
            visited,
            keys.iter()
                .cloned()
                .zip(0..100_u64)
                .collect::<Vec<_>>()
        );

        drop(table);
        assert_eq!(storage_manager.num_blobs(), 0);
    }

    #[test]
    fn test_duplicate_keys_keep_insertion_order() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = DuplicateKeysHashTable::<u64>::new(vec![Type::int(false)], 1, storage_manager);
        (0..50).for_each(|i| {
            assert_eq!(table.put(&TypedValue::Int(i % 3), i as u64), HashTablePutResult::Ok);
        });

        let mut values = Vec::new();
        table.get_all(&TypedValue::Int(1), &mut values);
        assert_eq!(values, (0..50).filter(|i| i % 3 == 1).collect::<Vec<u64>>());
    }

    fn accessor(keys: Vec<TypedValue>, values: Vec<TypedValue>) -> ColumnVectorsValueAccessor {
        ColumnVectorsValueAccessor::try_new([
            Arc::new(ColumnVector::from_values(Type::int(true), keys)),
            Arc::new(ColumnVector::from_values(Type::long(false), values)),
        ])
        .unwrap()
    }

    #[test]
    fn test_put_value_accessor_with_preallocation() {
        let table = FixedDuplicateTable::<i64>::with_capacity(vec![Type::int(true)], 8);
        let mut accessor = accessor(
            vec![
                TypedValue::Int(1),
                TypedValue::Null(TypeId::Int),
                TypedValue::Int(2),
                TypedValue::Int(1),
            ],
            [10, 20, 30, 40].map(TypedValue::Long).to_vec(),
        );

        let mut calls = 0;
        let result = table.put_value_accessor(&mut accessor, 0, true, |accessor| {
            calls += 1;
            accessor.get_typed_value(1).as_i64().unwrap()
        });
        assert_eq!(result, HashTablePutResult::Ok);
        assert_eq!(calls, 3);
        assert_eq!(table.num_entries(), 3);

        let mut values = Vec::new();
        table.get_all(&TypedValue::Int(1), &mut values);
        assert_eq!(values, vec![10, 40]);
    }

    #[test]
    fn test_put_value_accessor_duplicate_key() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<i64>::new(vec![Type::int(true)], 1, storage_manager);
        let mut accessor = accessor(
            [1, 2, 1].map(TypedValue::Int).to_vec(),
            [10, 20, 30].map(TypedValue::Long).to_vec(),
        );
        let result = table.put_value_accessor(&mut accessor, 0, false, |accessor| {
            accessor.get_typed_value(1).as_i64().unwrap()
        });
        assert_eq!(result, HashTablePutResult::DuplicateKey);
        assert_eq!(table.num_entries(), 2);
    }

    #[test]
    fn test_get_all_from_value_accessor_with_first_match() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = DuplicateKeysHashTable::<&'static str>::new(
            vec![Type::int(true)],
            4,
            storage_manager,
        );
        table.put(&TypedValue::Int(1), "x");
        table.put(&TypedValue::Int(1), "y");
        table.put(&TypedValue::Int(2), "z");

        let mut lookup = accessor(
            vec![
                TypedValue::Int(1),
                TypedValue::Int(3),
                TypedValue::Null(TypeId::Int),
                TypedValue::Int(2),
            ],
            [0, 1, 2, 3].map(TypedValue::Long).to_vec(),
        );
        let mut first_matches = Vec::new();
        let mut matches = Vec::new();
        table.get_all_from_value_accessor_with_extra_work_for_first_match(
            &mut lookup,
            0,
            true,
            |accessor| first_matches.push(accessor.current_position()),
            |accessor, value| matches.push((accessor.current_position(), *value)),
        );
        assert_eq!(first_matches, vec![0, 3]);
        assert_eq!(matches, vec![(0, "x"), (0, "y"), (3, "z")]);
    }

    #[test]
    fn test_upsert_value_accessor_skips_null_keys() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<Arc<AtomicU64>>::new(vec![Type::int(true)], 1, storage_manager);
        let mut accessor = accessor(
            vec![
                TypedValue::Int(5),
                TypedValue::Null(TypeId::Int),
                TypedValue::Int(5),
            ],
            [1, 2, 3].map(TypedValue::Long).to_vec(),
        );
        // `Arc` is cloned for new keys, so all of the keys share the counter in this test
        let counter = Arc::new(AtomicU64::new(0));
        assert!(table.upsert_value_accessor(&mut accessor, 0, true, &counter, |accessor, v| {
            v.fetch_add(accessor.get_typed_value(1).as_i64().unwrap() as u64, Relaxed);
        }));
        assert_eq!(table.num_entries(), 1);
        assert_eq!(counter.load(Relaxed), 4);
    }

    #[test]
    fn test_clear() {
        let storage_manager = Arc::new(StorageManager::new());
        let mut table = UniqueTable::<String>::new(vec![Type::var_char(8, false)], 4, storage_manager);
        table.put(&TypedValue::from("a"), "a".to_string());
        table.clear();
        assert_eq!(table.num_entries(), 0);
        assert!(!table.has_key(&TypedValue::from("a")));
        assert_eq!(table.put(&TypedValue::from("a"), "b".to_string()), HashTablePutResult::Ok);
        assert_eq!(*table.get_single(&TypedValue::from("a")).unwrap(), "b");
    }

    #[test]
    fn test_debug() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<u64>::new(vec![Type::long(false)], 4, storage_manager);
        table.put(&long_key(1), 10);
        table.put(&long_key(2), 20);
        let debug = format!("{table:?}");
        assert!(debug.starts_with("SeparateChainingHashTable { key_types: "));
        assert!(debug.contains("num_entries: 2, num_buckets: "));
    }

    #[test]
    fn test_concurrent_put_with_resize() {
        const NUM_THREADS: u64 = 4;
        const KEYS_PER_THREAD: u64 = 2000;

        let storage_manager = Arc::new(StorageManager::new());
        let table = DuplicateKeysHashTable::<u64>::new(
            vec![Type::long(false), Type::var_char(16, false)],
            1,
            storage_manager,
        );

        std::thread::scope(|s| {
            (0..NUM_THREADS).for_each(|thread| {
                let table = &table;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(thread);
                    (0..KEYS_PER_THREAD).for_each(|i| {
                        let key = [
                            TypedValue::Long(rng.gen_range(0..64)),
                            TypedValue::from(format!("t{}", thread).as_str()),
                        ];
                        assert_eq!(
                            table.put_composite_key(&key, thread * KEYS_PER_THREAD + i),
                            HashTablePutResult::Ok
                        );
                    });
                });
            });
        });

        assert_eq!(table.num_entries(), (NUM_THREADS * KEYS_PER_THREAD) as usize);
        let mut seen = vec![false; (NUM_THREADS * KEYS_PER_THREAD) as usize];
        table.for_each_composite_key(|key, value| {
            let thread = value / KEYS_PER_THREAD;
            assert_eq!(key[1], TypedValue::from(format!("t{}", thread).as_str()));
            assert!(!std::mem::replace(&mut seen[*value as usize], true));
        });
        assert!(seen.into_iter().all(|seen| seen));
    }

    #[test]
    fn test_concurrent_upsert() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = UniqueTable::<u8>::new(vec![Type::int(false)], 1, storage_manager);
        let hits = (0..16).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();

        std::thread::scope(|s| {
            (0..4).for_each(|_| {
                s.spawn(|| {
                    (0..1024).for_each(|i| {
                        let key = i % 16;
                        assert!(table.upsert(&TypedValue::Int(key), &0, |_| {
                            hits[key as usize].fetch_add(1, Relaxed);
                        }));
                    });
                });
            });
        });

        assert_eq!(table.num_entries(), 16);
        assert!(hits.iter().all(|hit| hit.load(Relaxed) == 256));
    }

    #[test]
    fn test_concurrent_insert_same_keys() {
        const NUM_THREADS: u64 = 8;
        const NUM_KEYS: u64 = 300;

        let storage_manager = Arc::new(StorageManager::new());
        let table = DuplicateKeysHashTable::<u64>::new(vec![Type::long(false)], 4, storage_manager);

        std::thread::scope(|s| {
            (0..NUM_THREADS).for_each(|thread| {
                let table = &table;
                s.spawn(move || {
                    (0..NUM_KEYS).for_each(|key| {
                        assert_eq!(
                            table.put(&TypedValue::Long(key as i64), thread * NUM_KEYS + key),
                            HashTablePutResult::Ok
                        );
                    });
                });
            });
        });

        let mut values = Vec::new();
        (0..NUM_KEYS).for_each(|key| {
            values.clear();
            table.get_all(&TypedValue::Long(key as i64), &mut values);
            values.sort_unstable();
            let expected = (0..NUM_THREADS)
                .map(|thread| thread * NUM_KEYS + key)
                .collect::<Vec<_>>();
            assert_eq!(values, expected);
        });
    }
}
