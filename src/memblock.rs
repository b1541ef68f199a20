//! Reference counted memory blocks posted downstream by the capture engine.
//!
//! The pool hands out fill-then-freeze blocks for the copy read path, while
//! [Memblock::new_fixed] wraps foreign memory (the mmap'ed DMA region)
//! without taking ownership of it.

use std::fmt;
use std::slice;
use std::sync::Arc;

/// Default ceiling for a single block, in bytes.
pub const DEFAULT_BLOCK_SIZE_MAX: usize = 64 * 1024;

/// A shared allocator for capture buffers.
///
/// Cloning is cheap and all clones draw from the same accounting. The pool
/// is safe to share between the I/O thread and downstream consumers.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    block_size_max: usize,
}

impl Mempool {
    /// Construct a pool with the default block size ceiling.
    pub fn new() -> Self {
        Self::with_block_size_max(DEFAULT_BLOCK_SIZE_MAX)
    }

    /// Construct a pool with an explicit block size ceiling.
    pub fn with_block_size_max(block_size_max: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                block_size_max: block_size_max.max(1),
            }),
        }
    }

    /// The largest block this pool will hand out.
    ///
    /// Readers cap their burst size by this so a chunk always fits into a
    /// single downstream slot.
    pub fn block_size_max(&self) -> usize {
        self.inner.block_size_max
    }

    /// Allocate a writable block of the pool's preferred size.
    pub fn allocate(&self) -> MemblockMut {
        self.allocate_sized(self.inner.block_size_max)
    }

    /// Allocate a writable block of an explicit size.
    pub fn allocate_sized(&self, len: usize) -> MemblockMut {
        let len = len.min(self.inner.block_size_max).max(1);
        MemblockMut {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("block_size_max", &self.inner.block_size_max)
            .finish()
    }
}

/// A uniquely owned, writable block.
///
/// Produced by [Mempool::allocate]; once filled it is frozen into a
/// shareable [Memblock].
pub struct MemblockMut {
    data: Box<[u8]>,
}

impl MemblockMut {
    /// Capacity of the block, in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The writable contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Freeze the block into an immutable, reference counted one.
    pub fn freeze(self) -> Memblock {
        Memblock {
            inner: Arc::new(Inner::Owned(self.data)),
        }
    }
}

impl fmt::Debug for MemblockMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemblockMut")
            .field("len", &self.data.len())
            .finish()
    }
}

/// An immutable, reference counted block of captured audio.
#[derive(Clone)]
pub struct Memblock {
    inner: Arc<Inner>,
}

enum Inner {
    Owned(Box<[u8]>),
    Fixed { ptr: *const u8, len: usize },
}

// Safety: Owned data is plain bytes. Fixed regions are only constructed
// through [Memblock::new_fixed], whose contract requires the region to stay
// valid and unwritten for as long as any clone is alive.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Memblock {
    /// Wrap a foreign memory region without taking ownership of it.
    ///
    /// Dropping the block (and every clone of it) does *not* free the
    /// region. The mmap read path uses this to post the kernel's DMA buffer
    /// downstream without a copy.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that remain valid and
    /// unmodified until the last clone of the returned block is dropped.
    /// The capture engine guarantees this by dropping its reference before
    /// handing the region back to the kernel; consumers that keep a clone
    /// beyond the `post` call inherit the obligation to copy first.
    pub unsafe fn new_fixed(ptr: *const u8, len: usize) -> Self {
        Self {
            inner: Arc::new(Inner::Fixed { ptr, len }),
        }
    }

    /// Whether this block wraps foreign memory.
    pub fn is_fixed(&self) -> bool {
        matches!(&*self.inner, Inner::Fixed { .. })
    }

    /// Length of the block, in bytes.
    pub fn len(&self) -> usize {
        match &*self.inner {
            Inner::Owned(data) => data.len(),
            Inner::Fixed { len, .. } => *len,
        }
    }

    /// The block contents.
    pub fn as_slice(&self) -> &[u8] {
        match &*self.inner {
            Inner::Owned(data) => data,
            Inner::Fixed { ptr, len } => unsafe { slice::from_raw_parts(*ptr, *len) },
        }
    }

    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Memblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memblock")
            .field("len", &self.len())
            .field("fixed", &self.is_fixed())
            .finish()
    }
}

/// A chunk of captured audio as posted downstream.
#[derive(Debug, Clone)]
pub struct MemChunk {
    /// The backing block.
    pub memblock: Memblock,
    /// Offset of the first valid byte.
    pub index: usize,
    /// Number of valid bytes.
    pub length: usize,
}

impl MemChunk {
    /// The valid bytes of the chunk.
    pub fn as_slice(&self) -> &[u8] {
        &self.memblock.as_slice()[self.index..self.index + self.length]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_caps_allocations() {
        let pool = Mempool::with_block_size_max(16);
        assert_eq!(pool.allocate_sized(1024).len(), 16);
        assert_eq!(pool.allocate().len(), 16);
    }

    #[test]
    fn freeze_then_share() {
        let pool = Mempool::new();
        let mut block = pool.allocate_sized(4);
        block.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);

        let frozen = block.freeze();
        let clone = frozen.clone();
        assert_eq!(clone.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(frozen.ref_count(), 2);
    }

    #[test]
    fn fixed_blocks_do_not_own() {
        let storage = [9u8; 8];
        let block = unsafe { Memblock::new_fixed(storage.as_ptr(), storage.len()) };
        assert!(block.is_fixed());
        assert_eq!(block.as_slice(), &storage[..]);
        drop(block);
        // The region is still ours.
        assert_eq!(storage[0], 9);
    }
}
