//! Blocks: claiming, releasing, scrubbing, and bump-slicing through an arena.

use core::{
  ptr::{self, NonNull},
  sync::atomic::Ordering,
};

use crate::{
  chunk::{FREE_NODE_SIZE, FreeNode},
  config::{BlockReset, POISON_BYTE},
  error::{Error, Result},
  heap::Heap,
  layout::{BlockHeader, ChunkHeader, Geometry},
  pages::PageSource,
};

/// One block of one chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockRef {
  pub(crate) chunk: NonNull<ChunkHeader>,
  pub(crate) index: usize,
}

unsafe impl Send for BlockRef {}

impl BlockRef {
  /// The block holding `ptr`, which must point into a chunk.
  #[inline]
  pub(crate) fn containing(geo: &Geometry, chunk: NonNull<ChunkHeader>, ptr: *const u8) -> Self {
    Self {
      chunk,
      index: geo.block_index(ptr),
    }
  }

  #[inline]
  pub(crate) fn header(&self) -> &BlockHeader {
    unsafe { &self.chunk.as_ref().blocks[self.index] }
  }

  /// Where the block's free-list link lives while it is idle.
  #[inline]
  pub(crate) fn node(&self, geo: &Geometry) -> *mut FreeNode {
    geo.block_ptr(self.chunk, self.index, geo.block_start).cast()
  }

  #[inline]
  pub(crate) fn from_node(geo: &Geometry, node: NonNull<FreeNode>) -> Self {
    let ptr = node.as_ptr().cast::<u8>();
    let base = ptr as usize & !(geo.chunk_size() - 1);
    Self {
      // A linked node lies inside a chunk, which is never at address zero.
      chunk: unsafe { NonNull::new_unchecked(base as *mut ChunkHeader) },
      index: geo.block_index(ptr),
    }
  }
}

/// A pointer `realloc` would like to grow in place.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReallocHint {
  pub(crate) ptr: NonNull<u8>,
  /// Bytes of `ptr` the caller needs preserved.
  pub(crate) copy_len: usize,
}

/// Cursor state of the arena or big slot that is slicing a region.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct Cursor {
  /// Position of the most recent slice, while it can still grow in place.
  pub(crate) last_pos: Option<u32>,
}

impl<P: PageSource> Heap<P> {
  /// Scrubs `[from, used)` units at `base` per the reset policy; `total` is
  /// the end of the region for [`BlockReset::Full`].
  pub(crate) fn scrub(&self, base: *mut u8, from: u32, used: u32, total: u32) {
    let unit_log = self.geo.unit_log;
    let span = |end: u32| ((end.saturating_sub(from)) as usize) << unit_log;
    let start = unsafe { base.add((from as usize) << unit_log) };
    match self.settings.block_reset {
      BlockReset::Full => unsafe { ptr::write_bytes(start, 0, span(total)) },
      BlockReset::Used => unsafe { ptr::write_bytes(start, 0, span(used)) },
      BlockReset::Poison => unsafe { ptr::write_bytes(start, POISON_BYTE, span(used)) },
      BlockReset::Header => unsafe { ptr::write_bytes(start, 0, FREE_NODE_SIZE.min(span(total))) },
    }
  }

  fn block_scrub(&self, block: BlockRef) {
    let hdr = block.header();
    let base = self.geo.block_base(block.chunk, block.index);
    let used = hdr.pos.load(Ordering::Relaxed);
    self.scrub(base, self.geo.block_start, used, self.geo.units_per_block);
    hdr.pos.store(self.geo.block_start, Ordering::Relaxed);
  }

  /// Claims an idle block, carving a new chunk when none is free.
  /// The returned block has `refs == 1` (the caller's hold) and an empty cursor.
  pub(crate) fn block_new(&self) -> Option<BlockRef> {
    {
      let mut pool = self.pool.lock();
      if let Some(node) = pool.free.pop() {
        let block = BlockRef::from_node(&self.geo, node);
        let chunk_refs = unsafe { &block.chunk.as_ref().refs };
        chunk_refs.fetch_add(1, Ordering::AcqRel);
        let hdr = block.header();
        debug_assert_eq!(hdr.refs.load(Ordering::Relaxed), 0, "block_new: idle block has refs");
        hdr.refs.store(1, Ordering::Release);
        hdr.pos.store(self.geo.block_start, Ordering::Relaxed);
        return Some(block);
      }
      if let Some(region) = pool.cache.pop() {
        return Some(self.chunk_carve(&mut pool, region));
      }
    }

    let region = self.region_reserve()?;
    let mut pool = self.pool.lock();
    Some(self.chunk_carve(&mut pool, region))
  }

  /// Drops one reference from `block`. The last one scrubs it, returns it to
  /// the free list and releases its hold on the chunk.
  pub(crate) fn block_free(&self, block: BlockRef) {
    let hdr = block.header();
    let prev = hdr.refs.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(
      prev >= 1 && prev as usize <= self.geo.units_per_block as usize + 1,
      "block_free: refs {prev} out of range (double free?)"
    );
    if prev != 1 {
      return;
    }

    self.block_scrub(block);
    let release = {
      let mut pool = self.pool.lock();
      unsafe { pool.free.push(block.node(&self.geo)) };
      self.chunk_free_locked(&mut pool, block.chunk)
    };
    if let Some(region) = release {
      self.region_release(region);
    }
  }

  /// Bump-allocates `size` bytes from the calling thread's arena.
  pub(crate) fn slice_new(&self, size: usize, hint: Option<ReallocHint>) -> Result<NonNull<u8>> {
    let units = self.geo.units_for(size) as u32;
    let geo = &self.geo;
    let mut arena = self.arena_lock();

    loop {
      let block = match arena.block {
        Some(block) => block,
        None => {
          let block = self.block_new().ok_or(Error::OutOfMemory { requested: size })?;
          arena.block = Some(block);
          arena.cursor = Cursor::default();
          block
        }
      };

      let hdr = block.header();
      let prior = hdr.refs.fetch_add(1, Ordering::Acquire);
      let mut pos = hdr.pos.load(Ordering::Relaxed);
      if prior == 1 && pos != geo.block_start {
        // Only the arena holds the block: start over instead of moving on.
        self.block_scrub(block);
        pos = geo.block_start;
        arena.cursor = Cursor::default();
      }

      if let (Some(hint), Some(last)) = (hint, arena.cursor.last_pos)
        && geo.block_ptr(block.chunk, block.index, last) == hint.ptr.as_ptr()
        && last + units <= geo.units_per_block
      {
        // The slice being reallocated is the newest one: resize it in place.
        hdr.refs.fetch_sub(1, Ordering::Relaxed);
        self.resize_tail(hint, last, pos);
        hdr.pos.store(last + units, Ordering::Relaxed);
        return Ok(hint.ptr);
      }

      if pos + units <= geo.units_per_block {
        hdr.pos.store(pos + units, Ordering::Relaxed);
        arena.cursor.last_pos = Some(pos);
        let ptr = geo.block_ptr(block.chunk, block.index, pos);
        return NonNull::new(ptr).ok_or(Error::OutOfMemory { requested: size });
      }

      // Exhausted. Claim the next block before letting go of this one, so a
      // chunk whose last block this is does not get released and re-reserved.
      let fresh = self.block_new();
      hdr.refs.fetch_sub(1, Ordering::Release);
      let Some(fresh) = fresh else {
        return Err(Error::OutOfMemory { requested: size });
      };
      arena.block = Some(fresh);
      arena.cursor = Cursor::default();
      self.block_free(block);
    }
  }

  /// Under zero-initialisation, clears the bytes of an in-place resize that
  /// the caller did not ask to keep: `[copy_len, old_end)` of the slice.
  pub(crate) fn resize_tail(&self, hint: ReallocHint, last: u32, old_end: u32) {
    if !self.settings.initialize_allocations {
      return;
    }
    let old_len = ((old_end - last) as usize) << self.geo.unit_log;
    if old_len > hint.copy_len {
      unsafe { ptr::write_bytes(hint.ptr.as_ptr().add(hint.copy_len), 0, old_len - hint.copy_len) };
    }
  }
}
