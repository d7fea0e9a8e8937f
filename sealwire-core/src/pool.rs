//! Bump allocator for per-object scratch records.
//!
//! Allocations are carved from one fixed region in word-aligned steps.
//! Individual frees do not reclaim pool space; requests that no longer fit
//! fall back to the heap and are freed normally. The whole region is wiped
//! when the pool is dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use zeroize::Zeroizing;

use crate::error::{Error, Result, Status};

/// Smallest pool accepted by [`ResourcePool::new`].
pub const MIN_POOL_SIZE: usize = 64;

const ALIGN: usize = std::mem::size_of::<usize>();

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

fn round_up(n: usize) -> Option<usize> {
    n.checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1))
}

#[derive(Debug)]
enum Backing {
    Pooled { pool: u64, start: usize },
    Heap(Zeroizing<Vec<u8>>),
}

/// A block handed out by a [`ResourcePool`].
#[derive(Debug)]
pub struct PoolBlock {
    backing: Backing,
    len: usize,
}

impl PoolBlock {
    /// Requested length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the block was served from the heap fallback.
    pub fn is_heap(&self) -> bool {
        matches!(self.backing, Backing::Heap(_))
    }
}

/// Fixed-region bump allocator.
pub struct ResourcePool {
    id: u64,
    region: Zeroizing<Vec<u8>>,
    offset: usize,
}

impl ResourcePool {
    /// Pool over a fresh region of `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_POOL_SIZE {
            return Err(Error::with_detail(Status::BadParam, "pool smaller than minimum"));
        }
        let mut region = Vec::new();
        region
            .try_reserve_exact(size)
            .map_err(|_| Error::with_detail(Status::Memory, "pool allocation failed"))?;
        region.resize(size, 0);
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            region: Zeroizing::new(region),
            offset: 0,
        })
    }

    /// Region size.
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Bytes still available from the region.
    pub fn remaining(&self) -> usize {
        self.region.len().saturating_sub(self.offset)
    }

    fn check_offset(&self) -> Result<()> {
        if self.offset > self.region.len() {
            return Err(Error::with_detail(Status::Memory, "pool offset past end of region"));
        }
        Ok(())
    }

    /// Allocate `n` zeroed bytes.
    pub fn alloc(&mut self, n: usize) -> Result<PoolBlock> {
        self.check_offset()?;
        let rounded =
            round_up(n).ok_or_else(|| Error::with_detail(Status::Memory, "allocation size overflow"))?;
        if rounded <= self.remaining() {
            let start = self.offset;
            self.offset += rounded;
            return Ok(PoolBlock {
                backing: Backing::Pooled { pool: self.id, start },
                len: n,
            });
        }

        let mut heap = Vec::new();
        heap.try_reserve_exact(n)
            .map_err(|_| Error::with_detail(Status::Memory, "heap fallback allocation failed"))?;
        heap.resize(n, 0);
        tracing::trace!(requested = n, "pool exhausted, using heap");
        Ok(PoolBlock {
            backing: Backing::Heap(Zeroizing::new(heap)),
            len: n,
        })
    }

    /// Allocate a block holding a copy of `data`.
    pub fn alloc_copy(&mut self, data: &[u8]) -> Result<PoolBlock> {
        let mut block = self.alloc(data.len())?;
        self.bytes_mut(&mut block)?.copy_from_slice(data);
        Ok(block)
    }

    /// Return a block. Pool space is not reclaimed; heap blocks are wiped
    /// and released.
    pub fn free(&mut self, block: PoolBlock) {
        drop(block);
    }

    fn pooled_range(&self, pool: u64, start: usize, len: usize) -> Result<std::ops::Range<usize>> {
        if pool != self.id {
            return Err(Error::with_detail(Status::BadParam, "block belongs to another pool"));
        }
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.offset)
            .ok_or_else(|| Error::with_detail(Status::Memory, "block outside allocated region"))?;
        Ok(start..end)
    }

    /// Contents of a block.
    pub fn bytes<'a>(&'a self, block: &'a PoolBlock) -> Result<&'a [u8]> {
        match &block.backing {
            Backing::Pooled { pool, start } => {
                let range = self.pooled_range(*pool, *start, block.len)?;
                Ok(&self.region[range])
            }
            Backing::Heap(bytes) => Ok(&bytes[..]),
        }
    }

    /// Mutable contents of a block.
    pub fn bytes_mut<'a>(&'a mut self, block: &'a mut PoolBlock) -> Result<&'a mut [u8]> {
        match &mut block.backing {
            Backing::Pooled { pool, start } => {
                let range = self.pooled_range(*pool, *start, block.len)?;
                Ok(&mut self.region[range])
            }
            Backing::Heap(bytes) => Ok(&mut bytes[..]),
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("size", &self.region.len())
            .field("offset", &self.offset)
            .finish()
    }
}
