//! Self contained image of the serializable hash tables
//!
//! All of the integers are little endian. The image is laid out as:
//!
//! - Header: magic `u32`, key arity, number of slots, number of buckets, number of
//! allocated buckets, size of the variable length key storage and its written bytes,
//! each of them is an `u64`
//!
//! - Slots: an `u64` chain pointer for each slot
//!
//! - Buckets: for each allocated bucket, an `u8` ready flag. Ready bucket continues
//! with the `u64` next pointer, the `u64` hash, the key components and the
//! [`SerializableValue`] bytes of the value
//!
//! - Key component: `u8` tag. `0` is NULL followed by its `u8` type tag, `1` is an
//! inline value followed by its `u8` type tag, the `u32` length and the data bytes.
//! `2` is a copied value followed by the `u64` offset and `u64` length in the variable
//! length key storage
//!
//! - The written bytes of the variable length key storage
//!
//! The image is only consistent if no insertion happens during serialization

use std::sync::Arc;
use std::sync::atomic::Ordering::{Acquire, Relaxed};

use snafu::ensure;
use stratum_block::types::{Type, TypeId};
use stratum_block::value::TypedValue;

use super::key_codec::{KeyCodec, StoredKeyComponent, VariableLengthKeyStorage};
use super::separate_chaining::{EMPTY, PENDING, SeparateChainingHashTable, Storage};
use super::{BlockMemoryTooSmallSnafu, HashTableError, MalformedBlockSnafu};
use crate::common::types::HashValue;
use crate::storage::storage_manager::{StorageBlob, StorageManager};

type Result<T> = std::result::Result<T, HashTableError>;

const MAGIC: u32 = 0x5354_4854;
const HEADER_SIZE: usize = 4 + 6 * 8;

const NULL_COMPONENT: u8 = 0;
const INLINE_COMPONENT: u8 = 1;
const COPIED_COMPONENT: u8 = 2;

/// Value that can be stored in the serialized image of the hash table. The encoded
/// value has a fixed number of bytes
pub trait SerializableValue: Sized {
    /// Number of bytes of the encoded value
    const ENCODED_SIZE: usize;

    /// Append the encoded value to `out`
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode the value from exactly [`Self::ENCODED_SIZE`] bytes
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_serializable_value {
    ($($ty:ty),+) => {
        $(
            impl SerializableValue for $ty {
                const ENCODED_SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Self {
                    let mut array = [0; std::mem::size_of::<$ty>()];
                    array.copy_from_slice(&bytes[..Self::ENCODED_SIZE]);
                    <$ty>::from_le_bytes(array)
                }
            }
        )+
    };
}

impl_serializable_value!(u8, u16, u32, u64, i32, i64, f64);

impl SerializableValue for () {
    const ENCODED_SIZE: usize = 0;

    #[inline]
    fn encode(&self, _out: &mut Vec<u8>) {}

    #[inline]
    fn decode(_bytes: &[u8]) -> Self {}
}

fn type_tag(type_id: TypeId) -> u8 {
    match type_id {
        TypeId::Int => 0,
        TypeId::Long => 1,
        TypeId::Float => 2,
        TypeId::Double => 3,
        TypeId::VarChar => 4,
    }
}

fn type_from_tag(tag: u8) -> Result<TypeId> {
    Ok(match tag {
        0 => TypeId::Int,
        1 => TypeId::Long,
        2 => TypeId::Float,
        3 => TypeId::Double,
        4 => TypeId::VarChar,
        _ => {
            return MalformedBlockSnafu {
                reason: format!("unknown type tag `{}`", tag),
            }
            .fail();
        }
    })
}

#[inline]
fn put_u64(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&(v as u64).to_le_bytes());
}

impl<
    V: SerializableValue,
    const RESIZABLE: bool,
    const FORCE_KEY_COPY: bool,
    const ALLOW_DUPLICATE_KEYS: bool,
> SeparateChainingHashTable<V, RESIZABLE, true, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    /// Write the table into a self contained image. Call it after all of the
    /// insertions are finished
    pub fn serialize(&self) -> Vec<u8> {
        let storage = self.storage();
        let num_allocated = storage.num_allocated();
        let written = storage.variable_length.written();
        let mut out = Vec::with_capacity(
            HEADER_SIZE
                + storage.slots.len() * 8
                + num_allocated * (17 + V::ENCODED_SIZE)
                + written,
        );

        out.extend_from_slice(&MAGIC.to_le_bytes());
        put_u64(&mut out, self.key_types().len());
        put_u64(&mut out, storage.slots.len());
        put_u64(&mut out, storage.num_buckets());
        put_u64(&mut out, num_allocated);
        put_u64(&mut out, storage.variable_length.size());
        put_u64(&mut out, written);

        // Pending pointer is the end of the chain
        let pointer = |v: usize| if v == PENDING { EMPTY } else { v };
        storage
            .slots
            .iter()
            .for_each(|slot| put_u64(&mut out, pointer(slot.load(Acquire))));

        storage.buckets[..num_allocated].iter().for_each(|bucket| {
            if !bucket.is_ready() {
                out.push(0);
                return;
            }
            out.push(1);
            put_u64(&mut out, pointer(bucket.next.load(Acquire)));
            // SAFETY: bucket is ready
            let (hash, key, value) = unsafe { (bucket.hash(), bucket.key(), bucket.value()) };
            out.extend_from_slice(&hash.to_le_bytes());
            key.iter().for_each(|component| match component {
                StoredKeyComponent::Inline(value) if value.is_null() => {
                    out.push(NULL_COMPONENT);
                    out.push(type_tag(value.type_id()));
                }
                StoredKeyComponent::Inline(value) => {
                    out.push(INLINE_COMPONENT);
                    out.push(type_tag(value.type_id()));
                    out.extend_from_slice(&(value.data_size() as u32).to_le_bytes());
                    value.write_data_bytes(&mut out);
                }
                StoredKeyComponent::Copied { offset, len } => {
                    out.push(COPIED_COMPONENT);
                    put_u64(&mut out, *offset);
                    put_u64(&mut out, *len);
                }
            });
            value.encode(&mut out);
        });

        // SAFETY: all of the written bytes are published, insertion is finished
        out.extend_from_slice(unsafe { storage.variable_length.read(0, written) });
        out
    }
}

impl<V: SerializableValue, const FORCE_KEY_COPY: bool, const ALLOW_DUPLICATE_KEYS: bool>
    SeparateChainingHashTable<V, false, true, FORCE_KEY_COPY, ALLOW_DUPLICATE_KEYS>
{
    /// Reload the fixed table from the image written by [`Self::serialize`]
    pub fn from_serialized(key_types: Vec<Type>, bytes: &[u8]) -> Result<Self> {
        let codec = KeyCodec::new(key_types, FORCE_KEY_COPY);
        let storage = deserialize_storage(&codec, bytes)?;
        Ok(Self::from_parts(codec, storage, None))
    }
}

impl<V: SerializableValue, const ALLOW_DUPLICATE_KEYS: bool>
    SeparateChainingHashTable<V, true, true, true, ALLOW_DUPLICATE_KEYS>
{
    /// Reload the resizable table from the image written by [`Self::serialize`]. The
    /// variable length key storage is moved into a blob of the `storage_manager`
    pub fn from_serialized_with_storage_manager(
        key_types: Vec<Type>,
        bytes: &[u8],
        storage_manager: Arc<StorageManager>,
    ) -> Result<Self> {
        let codec = KeyCodec::new(key_types, true);
        let mut storage = deserialize_storage::<V>(&codec, bytes)?;

        let written = storage.variable_length.written();
        let blob = storage_manager.allocate_blob(storage.variable_length.size());
        // SAFETY: both of the blobs are owned by this thread
        unsafe { blob.write(0, storage.variable_length.read(0, written)) };
        storage.variable_length = VariableLengthKeyStorage::with_written_bytes(blob, written);

        Ok(Self::from_parts(codec, storage, Some(storage_manager)))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(len).ok_or_else(|| {
            MalformedBlockSnafu {
                reason: format!("length `{}` overflows", len),
            }
            .build()
        })?;
        ensure!(
            end <= self.bytes.len(),
            BlockMemoryTooSmallSnafu {
                required: end,
                actual: self.bytes.len()
            }
        );
        let bytes = &self.bytes[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::decode(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::decode(self.take(8)?))
    }

    fn usize(&mut self) -> Result<usize> {
        let v = self.u64()?;
        usize::try_from(v).map_err(|_| {
            MalformedBlockSnafu {
                reason: format!("`{}` does not fit in usize", v),
            }
            .build()
        })
    }

    /// Read a chain pointer, it points to one of the first `num_allocated` buckets
    fn pointer(&mut self, num_allocated: usize) -> Result<usize> {
        let pointer = self.usize()?;
        ensure!(
            pointer == EMPTY || pointer <= num_allocated,
            MalformedBlockSnafu {
                reason: format!(
                    "chain pointer `{}` is out of the `{}` allocated buckets",
                    pointer, num_allocated
                )
            }
        );
        Ok(pointer)
    }
}

fn malformed<T>(reason: String) -> Result<T> {
    MalformedBlockSnafu { reason }.fail()
}

fn deserialize_storage<V: SerializableValue>(codec: &KeyCodec, bytes: &[u8]) -> Result<Storage<V>> {
    ensure!(
        bytes.len() >= HEADER_SIZE,
        BlockMemoryTooSmallSnafu {
            required: HEADER_SIZE,
            actual: bytes.len()
        }
    );
    let mut reader = Reader { bytes, position: 0 };

    let magic = reader.u32()?;
    if magic != MAGIC {
        return malformed(format!("unexpected magic number `{:#x}`", magic));
    }
    let arity = reader.usize()?;
    let key_types = codec.key_types();
    if arity != key_types.len() {
        return malformed(format!(
            "image has `{}` key components, however `{}` key types are given",
            arity,
            key_types.len()
        ));
    }
    let num_slots = reader.usize()?;
    let num_buckets = reader.usize()?;
    let num_allocated = reader.usize()?;
    let variable_length_size = reader.usize()?;
    let written = reader.usize()?;
    if num_slots == 0 || num_buckets == 0 || num_buckets > num_slots {
        return malformed(format!(
            "invalid number of slots `{}` and buckets `{}`",
            num_slots, num_buckets
        ));
    }
    if num_allocated > num_buckets {
        return malformed(format!(
            "`{}` buckets are allocated, however the table only has `{}` buckets",
            num_allocated, num_buckets
        ));
    }
    if written > variable_length_size {
        return malformed(format!(
            "`{}` bytes are written into the variable length storage with `{}` bytes",
            written, variable_length_size
        ));
    }

    let slots = (0..num_slots)
        .map(|_| reader.pointer(num_allocated))
        .collect::<Result<Vec<_>>>()?;

    // Slots are read, so `num_buckets` is bounded by the image. A table never
    // reserves more than the estimated bytes of its buckets beyond the written bytes
    let max_variable_length_size = num_buckets
        .saturating_mul(codec.estimated_variable_key_size())
        .saturating_add(written)
        .max(bytes.len());
    if variable_length_size > max_variable_length_size {
        return malformed(format!(
            "variable length storage has `{}` bytes, at most `{}` bytes are expected",
            variable_length_size, max_variable_length_size
        ));
    }

    let mut storage = Storage::<V>::new(
        num_slots,
        num_buckets,
        VariableLengthKeyStorage::with_written_bytes(
            Arc::new(StorageBlob::detached(variable_length_size)),
            written,
        ),
    );

    let mut copied_ranges = Vec::new();
    for index in 0..num_allocated {
        match reader.u8()? {
            0 => continue,
            1 => (),
            flag => return malformed(format!("bucket `{}` has invalid flag `{}`", index, flag)),
        }
        let next = reader.pointer(num_allocated)?;
        let hash: HashValue = reader.u64()?;
        if hash == 0 || hash == HashValue::MAX {
            return malformed(format!("bucket `{}` has reserved hash `{}`", index, hash));
        }

        let key = key_types
            .iter()
            .map(|key_type| {
                let component = match reader.u8()? {
                    NULL_COMPONENT => {
                        StoredKeyComponent::Inline(TypedValue::Null(type_from_tag(reader.u8()?)?))
                    }
                    INLINE_COMPONENT => {
                        let type_id = type_from_tag(reader.u8()?)?;
                        let len = reader.u32()? as usize;
                        let value = TypedValue::from_data_bytes(type_id, reader.take(len)?)
                            .map_err(|e| {
                                MalformedBlockSnafu {
                                    reason: format!("bucket `{}` has invalid key: {}", index, e),
                                }
                                .build()
                            })?;
                        StoredKeyComponent::Inline(value)
                    }
                    COPIED_COMPONENT => {
                        let offset = reader.usize()?;
                        let len = reader.usize()?;
                        match offset.checked_add(len) {
                            Some(end) if end <= written => (),
                            _ => {
                                return malformed(format!(
                                    "bucket `{}` refers to `{}` bytes at `{}` of the `{}` written variable length bytes",
                                    index, len, offset, written
                                ));
                            }
                        }
                        copied_ranges.push((index, offset, len));
                        StoredKeyComponent::Copied { offset, len }
                    }
                    tag => return malformed(format!("unknown key component tag `{}`", tag)),
                };
                let type_id = match &component {
                    StoredKeyComponent::Inline(value) => value.type_id(),
                    StoredKeyComponent::Copied { .. } => TypeId::VarChar,
                };
                if type_id != key_type.id() {
                    return malformed(format!(
                        "bucket `{}` has `{}` key component, however `{}` is expected",
                        index,
                        type_id.name(),
                        key_type
                    ));
                }
                Ok(component)
            })
            .collect::<Result<Box<[_]>>>()?;
        let value = V::decode(reader.take(V::ENCODED_SIZE)?);

        let bucket = &storage.buckets[index];
        // SAFETY: the storage is owned by this thread
        unsafe { bucket.write(hash, key, value) };
        bucket.next.store(next, Relaxed);
    }

    let variable_length_bytes = reader.take(written)?;
    if reader.position != bytes.len() {
        return malformed(format!(
            "`{}` trailing bytes after the image",
            bytes.len() - reader.position
        ));
    }
    for (index, offset, len) in copied_ranges {
        if std::str::from_utf8(&variable_length_bytes[offset..offset + len]).is_err() {
            return malformed(format!("bucket `{}` has invalid utf8 key", index));
        }
    }
    // SAFETY: the storage is owned by this thread
    unsafe { storage.variable_length.write(0, variable_length_bytes) };

    storage
        .slots
        .iter_mut()
        .zip(slots)
        .for_each(|(slot, pointer)| *slot.get_mut() = pointer);
    *storage.buckets_allocated.get_mut() = num_allocated;

    verify_chains(&storage)?;
    Ok(storage)
}

/// Every ready bucket is linked exactly once, in the chain of its slot
fn verify_chains<V>(storage: &Storage<V>) -> Result<()> {
    let num_allocated = storage.num_allocated();
    let mut visited = vec![false; num_allocated];
    for (slot_index, slot) in storage.slots.iter().enumerate() {
        let mut next = slot.load(Relaxed);
        while next != EMPTY {
            let index = next - 1;
            let bucket = &storage.buckets[index];
            if !bucket.is_ready() {
                return malformed(format!("chain links the empty bucket `{}`", index));
            }
            if std::mem::replace(&mut visited[index], true) {
                return malformed(format!("bucket `{}` is linked more than once", index));
            }
            // SAFETY: bucket is ready
            if storage.slot_index(unsafe { bucket.hash() }) != slot_index {
                return malformed(format!("bucket `{}` is linked to the wrong slot", index));
            }
            next = bucket.next.load(Relaxed);
        }
    }

    if let Some(index) = (0..num_allocated)
        .find(|&index| storage.buckets[index].is_ready() && !visited[index])
    {
        return malformed(format!("bucket `{}` is not linked", index));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hash_table::{HashTablePutResult, SerializableHashTable};

    fn key_types() -> Vec<Type> {
        vec![Type::var_char(16, true), Type::int(true)]
    }

    fn sample_table() -> SerializableHashTable<u64> {
        let table = SerializableHashTable::<u64>::with_capacity(key_types(), 16);
        [
            (TypedValue::from("apple"), TypedValue::Int(1), 10),
            (TypedValue::Null(TypeId::VarChar), TypedValue::Int(2), 20),
            (TypedValue::from("banana"), TypedValue::Null(TypeId::Int), 30),
            (TypedValue::from(""), TypedValue::Int(4), 40),
        ]
        .into_iter()
        .for_each(|(a, b, value)| {
            assert_eq!(table.put_composite_key(&[a, b], value), HashTablePutResult::Ok);
        });
        table
    }

    fn entries<const R: bool, const F: bool, const D: bool>(
        table: &SeparateChainingHashTable<u64, R, true, F, D>,
    ) -> Vec<(Vec<TypedValue>, u64)> {
        let mut entries = Vec::new();
        table.for_each_composite_key(|key, value| entries.push((key.to_vec(), *value)));
        entries
    }

    fn error_message(bytes: &[u8]) -> String {
        let error = SerializableHashTable::<u64>::from_serialized(key_types(), bytes).unwrap_err();
        error.to_string()
    }

    #[test]
    fn test_reload_serialized_table() {
        let table = sample_table();
        let bytes = table.serialize();
        let reloaded = SerializableHashTable::<u64>::from_serialized(key_types(), &bytes).unwrap();

        assert_eq!(entries(&reloaded), entries(&table));
        assert_eq!(reloaded.num_buckets(), table.num_buckets());
        assert_eq!(
            *reloaded
                .get_single_composite_key(&[TypedValue::from("banana"), TypedValue::Null(TypeId::Int)])
                .unwrap(),
            30
        );
        // Reloaded table accepts new entries
        assert_eq!(
            reloaded.put_composite_key(&[TypedValue::from("cherry"), TypedValue::Int(5)], 50),
            HashTablePutResult::Ok
        );
        assert_eq!(reloaded.num_entries(), 5);
    }

    #[test]
    fn test_reload_into_resizable_table() {
        let storage_manager = Arc::new(StorageManager::new());
        let table = SeparateChainingHashTable::<u64, true, true, true, false>::new(
            key_types(),
            2,
            Arc::clone(&storage_manager),
        );
        (0..10).for_each(|i| {
            table.put_composite_key(
                &[TypedValue::from(format!("k{}", i).as_str()), TypedValue::Int(i)],
                i as u64,
            );
        });
        let bytes = table.serialize();

        let reloaded =
            SeparateChainingHashTable::<u64, true, true, true, false>::from_serialized_with_storage_manager(
                key_types(),
                &bytes,
                Arc::clone(&storage_manager),
            )
            .unwrap();
        assert_eq!(entries(&reloaded), entries(&table));
        assert!(storage_manager.has_blob(reloaded.blob_id()));

        (10..100).for_each(|i| {
            assert_eq!(
                reloaded.put_composite_key(
                    &[TypedValue::from(format!("k{}", i).as_str()), TypedValue::Int(i)],
                    i as u64
                ),
                HashTablePutResult::Ok
            );
        });
        assert_eq!(reloaded.num_entries(), 100);
    }

    #[test]
    fn test_truncated_image() {
        let bytes = sample_table().serialize();
        let expect = expect_test::expect![
            "Memory of the serialized hash table is too small. It has `10` bytes, at least `52` bytes are required"
        ];
        expect.assert_eq(&error_message(&bytes[..10]));

        let message = error_message(&bytes[..bytes.len() - 1]);
        assert!(message.starts_with("Memory of the serialized hash table is too small"));
    }

    #[test]
    fn test_malformed_image() {
        let mut bytes = sample_table().serialize();
        bytes[0] ^= 0xff;
        let expect = expect_test::expect![
            "Serialized hash table is malformed: unexpected magic number `0x535448ab`"
        ];
        expect.assert_eq(&error_message(&bytes));

        let bytes = sample_table().serialize();
        let error = SerializableHashTable::<u64>::from_serialized(vec![Type::int(true)], &bytes)
            .unwrap_err();
        let expect = expect_test::expect![
            "Serialized hash table is malformed: image has `2` key components, however `1` key types are given"
        ];
        expect.assert_eq(&error.to_string());

        let mut bytes = sample_table().serialize();
        bytes.push(0);
        let expect = expect_test::expect![
            "Serialized hash table is malformed: `1` trailing bytes after the image"
        ];
        expect.assert_eq(&error_message(&bytes));
    }

    #[test]
    fn test_oversized_variable_length_storage() {
        let mut bytes = sample_table().serialize();
        bytes[36..44].copy_from_slice(&(1_u64 << 62).to_le_bytes());
        let error = SerializableHashTable::<u64>::from_serialized(key_types(), &bytes).unwrap_err();
        assert!(matches!(error, HashTableError::MalformedBlock { .. }));
        assert!(error.to_string().starts_with(
            "Serialized hash table is malformed: variable length storage has `4611686018427387904` bytes"
        ));

        // Storage within the image length is accepted
        let table = SerializableHashTable::<u64>::with_capacity_and_variable_storage(
            key_types(),
            4,
            128,
        );
        table.put_composite_key(&[TypedValue::from("apple"), TypedValue::Int(1)], 1);
        let reloaded =
            SerializableHashTable::<u64>::from_serialized(key_types(), &table.serialize()).unwrap();
        assert_eq!(entries(&reloaded), entries(&table));
    }

    #[test]
    fn test_corrupted_slot() {
        let table = SerializableHashTable::<u64>::with_capacity(key_types(), 4);
        table.put_composite_key(&[TypedValue::from("a"), TypedValue::Int(1)], 1);
        let mut bytes = table.serialize();

        // Find the linked slot and point it to a bucket that is not allocated
        let num_slots = u64::decode(&bytes[12..20]) as usize;
        let slot = (0..num_slots)
            .map(|slot| HEADER_SIZE + slot * 8)
            .find(|&offset| u64::decode(&bytes[offset..offset + 8]) != 0)
            .unwrap();
        bytes[slot..slot + 8].copy_from_slice(&2_u64.to_le_bytes());
        let expect = expect_test::expect![
            "Serialized hash table is malformed: chain pointer `2` is out of the `1` allocated buckets"
        ];
        expect.assert_eq(&error_message(&bytes));

        // Unlink the bucket
        bytes[slot..slot + 8].copy_from_slice(&0_u64.to_le_bytes());
        let expect = expect_test::expect![
            "Serialized hash table is malformed: bucket `0` is not linked"
        ];
        expect.assert_eq(&error_message(&bytes));
    }
}
