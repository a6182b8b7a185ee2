//! In memory [`StorageManager`]. It owns the [`StorageBlock`]s of the relations and the
//! [`StorageBlob`]s that back the variable length key storage of the hash tables

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

use hashbrown::HashMap;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use stratum_block::accessor::{
    ColumnVectorsValueAccessor, InconsistentLengthError, ValueAccessor,
};
use stratum_block::column_vector::ColumnVector;

use crate::catalog::RelationId;

/// Identifier of the block or blob
pub type BlockId = u64;

/// Id of the blobs that are not registered in any [`StorageManager`]. Registered ids
/// start from 1
pub const DETACHED_BLOB_ID: BlockId = 0;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum StorageError {
    #[snafu(display("Block `{block_id}` does not exist"))]
    BlockNotFound { block_id: BlockId },
    #[snafu(display(
        "Block `{block_id}` belongs to relation `{actual}`, however relation `{expected}` is expected"
    ))]
    RelationMismatch {
        block_id: BlockId,
        expected: RelationId,
        actual: RelationId,
    },
    #[snafu(display("Block or blob `{block_id}` does not exist, can not delete it"))]
    DeleteNonexistent { block_id: BlockId },
    #[snafu(display("Failed to create block for relation `{relation_id}`"))]
    CreateBlock {
        relation_id: RelationId,
        source: InconsistentLengthError,
    },
}

type Result<T> = std::result::Result<T, StorageError>;

/// Immutable block of a relation, stored column by column
#[derive(Debug)]
pub struct StorageBlock {
    id: BlockId,
    relation_id: RelationId,
    accessor: ColumnVectorsValueAccessor,
}

impl StorageBlock {
    /// Id of the block
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Relation that the block belongs to
    #[inline]
    pub fn relation_id(&self) -> RelationId {
        self.relation_id
    }

    /// Number of tuples in the block
    #[inline]
    pub fn num_tuples(&self) -> usize {
        self.accessor.num_tuples()
    }

    /// Create an accessor that iterates all of the tuples in the block. Columns are
    /// shared with the block
    #[inline]
    pub fn create_value_accessor(&self) -> ColumnVectorsValueAccessor {
        self.accessor.clone()
    }
}

/// Raw memory owned by the storage manager
///
/// Blob memory is shared between threads: writers only write the ranges they
/// reserved exclusively, and readers only read the ranges whose writes have been
/// published to them
pub struct StorageBlob {
    id: BlockId,
    memory: Box<[UnsafeCell<u8>]>,
}

// SAFETY: concurrent accesses to the memory go through the unsafe `write` and `read`,
// whose callers guarantee that they do not race on the same range
unsafe impl Sync for StorageBlob {}
// SAFETY: see above
unsafe impl Send for StorageBlob {}

impl StorageBlob {
    /// Create a blob that is not registered in any storage manager
    pub fn detached(num_bytes: usize) -> Self {
        Self::new(DETACHED_BLOB_ID, num_bytes)
    }

    fn new(id: BlockId, num_bytes: usize) -> Self {
        Self {
            id,
            memory: (0..num_bytes).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    /// Id of the blob
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Number of bytes in the blob
    #[inline]
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Write `bytes` into the blob at `offset`
    ///
    /// # Safety
    ///
    /// No other thread reads or writes the range `offset..offset + bytes.len()`
    /// concurrently
    ///
    /// # Panics
    ///
    /// Panics if the range is out of the blob
    #[inline]
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        let range = &self.memory[offset..offset + bytes.len()];
        // SAFETY: `UnsafeCell<u8>` has the same layout with `u8` and the caller
        // guarantees the range is not accessed by others
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), UnsafeCell::raw_get(range.as_ptr()), bytes.len())
        };
    }

    /// Read the range `offset..offset + len`
    ///
    /// # Safety
    ///
    /// No other thread writes the range while the returned slice is alive
    ///
    /// # Panics
    ///
    /// Panics if the range is out of the blob
    #[inline]
    pub unsafe fn read(&self, offset: usize, len: usize) -> &[u8] {
        let range = &self.memory[offset..offset + len];
        // SAFETY: `UnsafeCell<u8>` has the same layout with `u8` and the caller
        // guarantees the range is not written by others
        unsafe { std::slice::from_raw_parts(UnsafeCell::raw_get(range.as_ptr()), len) }
    }
}

impl Debug for StorageBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBlob")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// Storage manager that holds everything in memory
#[derive(Debug)]
pub struct StorageManager {
    blocks: Mutex<HashMap<BlockId, Arc<StorageBlock>>>,
    blobs: Mutex<HashMap<BlockId, Arc<StorageBlob>>>,
    next_id: AtomicU64,
}

impl StorageManager {
    /// Create a new storage manager
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(DETACHED_BLOB_ID + 1),
        }
    }

    /// Create a block of the relation with the given columns
    pub fn create_block(
        &self,
        relation_id: RelationId,
        columns: Vec<ColumnVector>,
    ) -> Result<BlockId> {
        let accessor = ColumnVectorsValueAccessor::try_new(columns.into_iter().map(Arc::new))
            .context(CreateBlockSnafu { relation_id })?;
        let id = self.next_id.fetch_add(1, Relaxed);
        self.blocks.lock().insert(
            id,
            Arc::new(StorageBlock {
                id,
                relation_id,
                accessor,
            }),
        );
        tracing::trace!("StorageManager: created block `{}` for relation `{}`", id, relation_id);
        Ok(id)
    }

    /// Get the block, it must belong to the relation
    pub fn get_block(&self, block_id: BlockId, relation_id: RelationId) -> Result<Arc<StorageBlock>> {
        let block = self
            .blocks
            .lock()
            .get(&block_id)
            .cloned()
            .context(BlockNotFoundSnafu { block_id })?;
        ensure!(
            block.relation_id == relation_id,
            RelationMismatchSnafu {
                block_id,
                expected: relation_id,
                actual: block.relation_id
            }
        );
        Ok(block)
    }

    /// Allocate a zeroed blob with `num_bytes` bytes
    pub fn allocate_blob(&self, num_bytes: usize) -> Arc<StorageBlob> {
        let id = self.next_id.fetch_add(1, Relaxed);
        let blob = Arc::new(StorageBlob::new(id, num_bytes));
        self.blobs.lock().insert(id, Arc::clone(&blob));
        tracing::trace!("StorageManager: allocated blob `{}` with `{}` bytes", id, num_bytes);
        blob
    }

    /// Delete the block or blob. The memory is released when the last reference is
    /// dropped
    pub fn delete_block_or_blob_file(&self, block_id: BlockId) -> Result<()> {
        if self.blobs.lock().remove(&block_id).is_some() {
            return Ok(());
        }
        ensure!(
            self.blocks.lock().remove(&block_id).is_some(),
            DeleteNonexistentSnafu { block_id }
        );
        Ok(())
    }

    /// Number of live blobs
    #[inline]
    pub fn num_blobs(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Returns true if the blob is registered
    #[inline]
    pub fn has_blob(&self, blob_id: BlockId) -> bool {
        self.blobs.lock().contains_key(&blob_id)
    }
}

impl Default for StorageManager {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
