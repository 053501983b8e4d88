//! Chunks, the idle-block free list, and the chunk cache.
//!
//! All three live behind the heap's global lock. Chunk reference counts are
//! atomics, but every change to them happens with that lock held, so "last
//! block released" and "block claimed from the free list" cannot interleave.

use core::{
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::Ordering,
};

use crate::{
  block::BlockRef,
  config::CACHE_LIMIT,
  heap::Heap,
  layout::{ChunkHeader, RegionKind},
  pages::PageSource,
};

// =============================================================================
// Free block list
// =============================================================================

/// Intrusive link written at the first usable position of an idle block.
#[repr(C)]
pub(crate) struct FreeNode {
  prev: *mut FreeNode,
  next: *mut FreeNode,
}

pub(crate) const FREE_NODE_SIZE: usize = size_of::<FreeNode>();

/// Doubly-linked list of idle blocks from any chunk.
pub(crate) struct FreeList {
  head: *mut FreeNode,
  len: usize,
}

impl FreeList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// # Safety
  /// `node` must be writable, `FREE_NODE_SIZE` bytes, and not linked.
  pub(crate) unsafe fn push(&mut self, node: *mut FreeNode) {
    unsafe {
      (*node).prev = null_mut();
      (*node).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = node;
      }
    }
    self.head = node;
    self.len += 1;
  }

  pub(crate) fn pop(&mut self) -> Option<NonNull<FreeNode>> {
    let node = NonNull::new(self.head)?;
    unsafe { self.unlink(node.as_ptr()) };
    Some(node)
  }

  /// Removes `node` and zeroes its link so the memory reads clean again.
  ///
  /// # Safety
  /// `node` must currently be linked in this list.
  pub(crate) unsafe fn unlink(&mut self, node: *mut FreeNode) {
    unsafe {
      let prev = (*node).prev;
      let next = (*node).next;
      if prev.is_null() {
        debug_assert!(self.head == node, "unlink: node {node:p} is not linked");
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      ptr::write_bytes(node.cast::<u8>(), 0, FREE_NODE_SIZE);
    }
    self.len -= 1;
  }

  /// Visits linked nodes, head first, until `f` returns `false`.
  pub(crate) fn for_each(&self, mut f: impl FnMut(*mut FreeNode) -> bool) {
    let mut node = self.head;
    while !node.is_null() {
      if !f(node) {
        return;
      }
      node = unsafe { (*node).next };
    }
  }
}

// =============================================================================
// Chunk cache
// =============================================================================

/// Whole idle chunks kept to avoid a release/reserve round trip.
pub(crate) struct ChunkCache {
  slots: [*mut u8; CACHE_LIMIT],
  len: usize,
  capacity: usize,
}

impl ChunkCache {
  const fn new(capacity: usize) -> Self {
    Self {
      slots: [null_mut(); CACHE_LIMIT],
      len: 0,
      capacity,
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Stores `region`, or returns `false` when the cache is full.
  pub(crate) fn push(&mut self, region: NonNull<u8>) -> bool {
    if self.len >= self.capacity {
      return false;
    }
    self.slots[self.len] = region.as_ptr();
    self.len += 1;
    true
  }

  pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
    if self.len == 0 {
      return None;
    }
    self.len -= 1;
    NonNull::new(core::mem::replace(&mut self.slots[self.len], null_mut()))
  }
}

// =============================================================================
// Pool (guarded by the global lock)
// =============================================================================

pub(crate) struct Pool {
  pub(crate) free: FreeList,
  pub(crate) cache: ChunkCache,
}

unsafe impl Send for Pool {}

impl Pool {
  pub(crate) const fn new(cache_slots: usize) -> Self {
    Self {
      free: FreeList::new(),
      cache: ChunkCache::new(cache_slots),
    }
  }
}

// =============================================================================
// Chunk lifecycle
// =============================================================================

impl<P: PageSource> Heap<P> {
  /// Reserves one chunk-sized, chunk-aligned region from the page source.
  /// Never called with a heap lock held.
  pub(crate) fn region_reserve(&self) -> Option<NonNull<u8>> {
    self.pages.reserve(self.geo.chunk_pages(), self.geo.chunk_log as u8)
  }

  pub(crate) fn region_release(&self, region: NonNull<u8>) {
    unsafe { self.pages.release(region, self.geo.chunk_pages()) };
  }

  /// Writes a chunk header over `region`, claims block 0, and queues the
  /// remaining blocks on the free list.
  pub(crate) fn chunk_carve(&self, pool: &mut Pool, region: NonNull<u8>) -> BlockRef {
    let chunk = region.cast::<ChunkHeader>();
    let start = self.geo.block_start;
    unsafe { (&raw mut (*chunk.as_ptr()).marker).write(RegionKind::Chunk.marker()) };
    let hdr = unsafe { chunk.as_ref() };
    hdr.refs.store(1, Ordering::Relaxed);
    for block in hdr.blocks.iter() {
      block.refs.store(0, Ordering::Relaxed);
      block.pos.store(start, Ordering::Relaxed);
    }
    hdr.blocks[0].refs.store(1, Ordering::Relaxed);

    // Pushed in reverse so block 1 is the next one handed out.
    for index in (1..self.geo.blocks_per_chunk).rev() {
      let node = BlockRef { chunk, index }.node(&self.geo);
      unsafe { pool.free.push(node) };
    }

    BlockRef { chunk, index: 0 }
  }

  /// Drops one block reference from `chunk`. When it was the last one, all
  /// of the chunk's blocks leave the free list and the chunk is cached; the
  /// region is returned when the cache is full and it must be released
  /// (after the lock is dropped).
  pub(crate) fn chunk_free_locked(
    &self,
    pool: &mut Pool,
    chunk: NonNull<ChunkHeader>,
  ) -> Option<NonNull<u8>> {
    let hdr = unsafe { chunk.as_ref() };
    let prev = hdr.refs.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev >= 1, "chunk_free: refs underflow on {:p}", chunk);
    if prev != 1 {
      return None;
    }

    for index in 0..self.geo.blocks_per_chunk {
      debug_assert_eq!(
        hdr.blocks[index].refs.load(Ordering::Relaxed),
        0,
        "chunk_free: block {index} still claimed"
      );
      unsafe { pool.free.unlink(BlockRef { chunk, index }.node(&self.geo)) };
    }

    let region = chunk.cast::<u8>();
    if pool.cache.push(region) { None } else { Some(region) }
  }
}
