//! The allocator state: arenas, the pool behind the global lock, the big
//! slot, and the public operations that route requests between tiers.

use core::{
  ptr::{self, NonNull},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{
  arena::Arena,
  big::BigSlot,
  block::{BlockRef, ReallocHint},
  chunk::Pool,
  config::{ARENA_LIMIT, Config, Settings},
  error::{Error, Result},
  layout::{Geometry, MappedHeader, Region, RegionKind},
  pages::{OsPages, PAGE_SIZE_LOG, PageSource, pages_for},
  sync::Locked,
};

// =============================================================================
// Zero-size sentinel
// =============================================================================

#[repr(C, align(1024))]
struct ZeroSized([u8; 16]);

static ZERO_SIZED: ZeroSized = ZeroSized([0; 16]);

/// Address returned for zero-byte requests. Never dereferenced; freeing it
/// is a no-op.
#[inline]
pub fn zero_size_ptr() -> NonNull<u8> {
  NonNull::from(&ZERO_SIZED).cast()
}

// =============================================================================
// Heap
// =============================================================================

/// One allocator instance.
///
/// Every tier hands out raw pointers whose owner is found by masking, so a
/// pointer must always be returned to the heap that produced it.
pub struct Heap<P: PageSource = OsPages> {
  pub(crate) settings: Settings,
  pub(crate) geo: Geometry,
  pub(crate) pages: P,
  /// The global lock: free block list and chunk cache.
  pub(crate) pool: Locked<Pool>,
  pub(crate) big: Locked<BigSlot>,
  /// Only the first `settings.arena_count` are used.
  pub(crate) arenas: [Arena; ARENA_LIMIT],
  pub(crate) contention_warned: AtomicBool,
}

impl Heap<OsPages> {
  /// A heap drawing its memory straight from the operating system.
  pub fn new(config: Config) -> Result<Self> {
    Self::with_page_source(config, OsPages)
  }
}

impl<P: PageSource> Heap<P> {
  pub fn with_page_source(config: Config, pages: P) -> Result<Self> {
    Ok(Self::with_settings(config.validate()?, pages))
  }

  /// Builds the heap without allocating through the global allocator.
  pub(crate) fn with_settings(settings: Settings, pages: P) -> Self {
    let blocking = settings.use_thread_mutex;
    let mut heap = Self {
      settings,
      geo: Geometry::new(&settings),
      pages,
      pool: Locked::new(Pool::new(settings.cache_slots), blocking),
      big: Locked::new(BigSlot::new(), blocking),
      arenas: core::array::from_fn(|_| Arena::new(blocking)),
      contention_warned: AtomicBool::new(false),
    };
    heap.warm_up();
    heap
  }

  /// The resolved configuration.
  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  /// Alignment of every pointer this heap returns.
  pub fn alignment(&self) -> usize {
    self.geo.unit()
  }

  /// Largest request served from an arena block.
  pub fn block_limit(&self) -> usize {
    self.geo.block_limit
  }

  /// Largest request served without a direct mapping.
  pub fn big_limit(&self) -> usize {
    self.geo.big_limit
  }

  pub fn chunk_size(&self) -> usize {
    self.geo.chunk_size()
  }

  pub fn page_source(&self) -> &P {
    &self.pages
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  fn alloc_inner(&self, size: usize, hint: Option<ReallocHint>) -> Result<NonNull<u8>> {
    if size <= self.geo.block_limit {
      self.slice_new(size, hint)
    } else if size <= self.geo.big_limit {
      self.big_slice(size, hint)
    } else {
      self.mmap_alloc(size)
    }
  }

  /// Allocates `size` bytes aligned to [`Heap::alignment`]. A zero-byte
  /// request returns [`zero_size_ptr`].
  pub fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
    if size == 0 {
      return Ok(zero_size_ptr());
    }
    self.alloc_inner(size, None)
  }

  /// Allocates `count * size` zeroed bytes; fails when the product overflows.
  pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>> {
    let total = count
      .checked_mul(size)
      .ok_or(Error::SizeOverflow { count, size })?;
    let ptr = self.malloc(total)?;
    // Mappings come zeroed from the page source.
    if total != 0 && total <= self.geo.big_limit && !self.settings.initialize_allocations {
      unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    }
    Ok(ptr)
  }

  /// Allocates with an alignment above [`Heap::alignment`].
  ///
  /// Block and big-block slices are padded up to the alignment. Requests that
  /// outgrow the big tier get a direct mapping whose data starts `align`
  /// bytes in. Alignments of a whole chunk or more are not supported. Freed
  /// with [`Heap::free`] like any other pointer.
  pub fn malloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
    let unit = self.geo.unit();
    if !align.is_power_of_two() || align >= self.geo.chunk_size() {
      return Err(Error::UnsupportedAlignment { align });
    }
    if align <= unit {
      return self.malloc(size);
    }
    match size.max(1).checked_add(align - unit) {
      Some(padded) if padded <= self.geo.big_limit => {
        let raw = self.alloc_inner(padded, None)?;
        let offset = raw.as_ptr().align_offset(align);
        Ok(unsafe { raw.add(offset) })
      }
      _ => self.mapped_new(size, align.max(self.geo.mapped_start)),
    }
  }

  /// Reserves a direct mapping for `size` bytes, whatever the size.
  ///
  /// The mapping is chunk-aligned and its header sits at the region start,
  /// one allocation unit before the returned pointer (two with 8-byte units).
  pub fn mmap_alloc(&self, size: usize) -> Result<NonNull<u8>> {
    self.mapped_new(size, self.geo.mapped_start)
  }

  fn mapped_new(&self, size: usize, offset: usize) -> Result<NonNull<u8>> {
    let oom = Error::OutOfMemory { requested: size };
    let pages = size.checked_add(offset).map(pages_for).ok_or(oom)?;
    let count = u32::try_from(pages).map_err(|_| oom)?;
    let region = self.pages.reserve(pages, self.geo.chunk_log as u8).ok_or(oom)?;
    unsafe {
      region.cast::<MappedHeader>().as_ptr().write(MappedHeader {
        marker: RegionKind::Mapped.marker(),
        pages: count,
        offset: offset as u32,
      });
      Ok(region.add(offset))
    }
  }

  fn mapped_room(&self, mapped: NonNull<MappedHeader>) -> usize {
    let header = unsafe { mapped.as_ref() };
    ((header.pages as usize) << PAGE_SIZE_LOG) - header.offset as usize
  }

  /// The pointer handed out for this mapping.
  #[inline]
  fn mapped_data(&self, mapped: NonNull<MappedHeader>) -> *mut u8 {
    let offset = unsafe { mapped.as_ref().offset } as usize;
    mapped.as_ptr().cast::<u8>().wrapping_add(offset)
  }

  /// Resizes a direct mapping through the page source, in place if it can.
  unsafe fn mapped_resize(
    &self,
    mapped: NonNull<MappedHeader>,
    new_size: usize,
    copy_len: usize,
  ) -> Result<NonNull<u8>> {
    let oom = Error::OutOfMemory { requested: new_size };
    let (old_pages, offset) = {
      let header = unsafe { mapped.as_ref() };
      (header.pages as usize, header.offset as usize)
    };
    let old_room = self.mapped_room(mapped);
    let pages = new_size.checked_add(offset).map(pages_for).ok_or(oom)?;
    let count = u32::try_from(pages).map_err(|_| oom)?;

    let region = unsafe {
      self
        .pages
        .remap(mapped.cast(), old_pages, pages, self.geo.chunk_log as u8)
    }
    .ok_or(oom)?;
    let mapped = region.cast::<MappedHeader>();
    unsafe { (&raw mut (*mapped.as_ptr()).pages).write(count) };

    let data = unsafe { region.add(offset) };
    let kept = old_room.min(self.mapped_room(mapped));
    if self.settings.initialize_allocations && kept > copy_len {
      unsafe { ptr::write_bytes(data.as_ptr().add(copy_len), 0, kept - copy_len) };
    }
    Ok(data)
  }

  // ===========================================================================
  // Release and resize
  // ===========================================================================

  /// Returns `ptr` to the heap. Null and [`zero_size_ptr`] are ignored, and a
  /// pointer that resolves to no region is logged and ignored.
  ///
  /// # Safety
  /// `ptr` must be null, the zero-size sentinel, or a live pointer returned
  /// by this heap.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if ptr.is_null() || ptr == zero_size_ptr().as_ptr() {
      return;
    }
    match unsafe { self.geo.resolve(ptr) } {
      Some(Region::Chunk(chunk)) => self.block_free(BlockRef::containing(&self.geo, chunk, ptr)),
      Some(Region::Big(big)) => self.big_free(big),
      Some(Region::Mapped(mapped)) if ptr == self.mapped_data(mapped) => {
        let pages = unsafe { mapped.as_ref().pages } as usize;
        unsafe { self.pages.release(mapped.cast(), pages) };
      }
      Some(Region::Mapped(_)) => {
        log::error!("chunkmalloc: free({ptr:p}) points inside a direct mapping; ignored");
      }
      None => log::error!("chunkmalloc: free({ptr:p}) has no owning chunk; ignored"),
    }
  }

  /// `realloc2(ptr, new_size, new_size)`.
  ///
  /// # Safety
  /// See [`Heap::realloc2`].
  pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>> {
    unsafe { self.realloc2(ptr, new_size, new_size) }
  }

  /// Resizes `ptr` to `new_size`, preserving only its first `copy_len` bytes.
  ///
  /// When `ptr` is the newest slice of its arena block or big block, it grows
  /// or shrinks in place and nothing is copied. A null or zero-size `ptr`
  /// behaves like `malloc`; `new_size == 0` frees `ptr` and returns the
  /// zero-size sentinel. With `initialize_allocations`, bytes past
  /// `copy_len` read as zero.
  ///
  /// # Safety
  /// Same as [`Heap::free`]. On success `ptr` must no longer be used unless
  /// the same pointer came back.
  pub unsafe fn realloc2(&self, ptr: *mut u8, new_size: usize, copy_len: usize) -> Result<NonNull<u8>> {
    let Some(old) = NonNull::new(ptr).filter(|&p| p != zero_size_ptr()) else {
      return self.malloc(new_size);
    };
    if new_size == 0 {
      unsafe { self.free(ptr) };
      return Ok(zero_size_ptr());
    }

    let region = unsafe { self.geo.resolve(ptr) };
    let room = match region {
      Some(Region::Chunk(_)) => self.geo.block_room(ptr),
      Some(Region::Big(_)) => self.geo.chunk_room(ptr),
      Some(Region::Mapped(mapped)) if ptr == self.mapped_data(mapped) => self.mapped_room(mapped),
      _ => {
        log::error!("chunkmalloc: realloc({ptr:p}) has no owning chunk");
        return Err(Error::InvalidPointer { addr: ptr as usize });
      }
    };
    let copy_len = copy_len.min(room).min(new_size);

    if let Some(Region::Mapped(mapped)) = region
      && new_size > self.geo.big_limit
    {
      return unsafe { self.mapped_resize(mapped, new_size, copy_len) };
    }

    let fresh = self.alloc_inner(new_size, Some(ReallocHint { ptr: old, copy_len }))?;
    if fresh == old {
      return Ok(fresh);
    }

    // Copy whole units; the fraction past `copy_len` is not the caller's data.
    // `copy_len` may reach past the old slice, and a fresh slice carved from
    // the same block then overlaps the source.
    let rounded = self.geo.round_up(copy_len);
    unsafe {
      ptr::copy(ptr, fresh.as_ptr(), rounded);
      ptr::write_bytes(fresh.as_ptr().add(copy_len), 0, rounded - copy_len);
      self.free(ptr);
    }
    Ok(fresh)
  }

  /// Bytes readable from `ptr` up to the end of its block, big block, or
  /// mapping. This bounds the allocation from above; slices carry no size of
  /// their own. Returns 0 for null, the sentinel, and foreign pointers.
  ///
  /// # Safety
  /// Same as [`Heap::free`].
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    if ptr.is_null() || ptr == zero_size_ptr().as_ptr() {
      return 0;
    }
    match unsafe { self.geo.resolve(ptr) } {
      Some(Region::Chunk(_)) => self.geo.block_room(ptr),
      Some(Region::Big(_)) => self.geo.chunk_room(ptr),
      Some(Region::Mapped(mapped)) if ptr == self.mapped_data(mapped) => self.mapped_room(mapped),
      _ => 0,
    }
  }

  // ===========================================================================
  // Lifecycle
  // ===========================================================================

  /// Forces every lock of the heap back to the unlocked state.
  ///
  /// # Safety
  /// Only for the child of a `fork`, before it starts any other thread. Any
  /// operation that was in flight in the parent is abandoned.
  pub unsafe fn after_fork(&self) {
    for arena in &self.arenas {
      unsafe { arena.slot.reinit() };
    }
    unsafe {
      self.pool.reinit();
      self.big.reinit();
    }
  }

  /// Drops the arenas' and the big slot's holds, then returns every idle
  /// chunk to the page source.
  ///
  /// Blocks still holding live allocations are reported. Their chunks are
  /// released too when they have idle blocks on the free list, so pointers
  /// from before the teardown must not be used afterwards. The heap stays
  /// usable and may be torn down again.
  pub fn teardown(&self) {
    let mut locked = 0;
    let mut live = 0;
    for arena in &self.arenas[..self.settings.arena_count] {
      let Some(mut slot) = arena.slot.try_lock() else {
        locked += 1;
        continue;
      };
      let block = slot.block.take();
      slot.cursor = Default::default();
      drop(slot);
      if let Some(block) = block {
        live += block.header().refs.load(Ordering::Acquire) - 1;
        self.block_free(block);
      }
    }

    let big = {
      let mut slot = self.big.lock();
      slot.cursor = Default::default();
      slot.block.take()
    };
    if let Some(big) = big {
      live += unsafe { big.as_ref() }.refs.load(Ordering::Acquire) - 1;
      self.big_free(big);
    }

    let stray = self.pool.lock().free.len();
    let mut released = 0usize;
    loop {
      let region = {
        let mut pool = self.pool.lock();
        let Some(node) = pool.free.pop() else { break };
        let block = BlockRef::from_node(&self.geo, node);
        let chunk = unsafe { block.chunk.as_ref() };
        for index in 0..self.geo.blocks_per_chunk {
          if index != block.index && chunk.blocks[index].refs.load(Ordering::Relaxed) == 0 {
            let sibling = BlockRef { chunk: block.chunk, index };
            unsafe { pool.free.unlink(sibling.node(&self.geo)) };
          }
        }
        block.chunk.cast::<u8>()
      };
      self.region_release(region);
      released += 1;
    }

    loop {
      let cached = self.pool.lock().cache.pop();
      let Some(region) = cached else { break };
      self.region_release(region);
      released += 1;
    }

    if locked > 0 {
      log::error!("chunkmalloc: teardown skipped {locked} arena(s) still locked");
    }
    if stray > 0 || live > 0 {
      log::warn!("chunkmalloc: teardown found {stray} stray free block(s) and {live} live slice(s)");
    }
    log::debug!("chunkmalloc: teardown released {released} chunk(s)");
  }
}

impl<P: PageSource> Drop for Heap<P> {
  fn drop(&mut self) {
    self.teardown();
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  /// 256K chunks of four 64K blocks, one arena.
  pub(crate) fn small_config() -> Config {
    Config {
      system_allocation_size_log: 18,
      blocks_per_allocation_log: 2,
      arena_count: 1,
      cache_slots: 2,
      ..Config::default()
    }
  }

  fn heap(cfg: Config) -> Heap {
    Heap::new(cfg).unwrap()
  }

  #[test]
  fn zero_bytes_get_the_sentinel() {
    let h = heap(small_config());
    let p = h.malloc(0).unwrap();
    assert_eq!(p, zero_size_ptr());
    unsafe {
      h.free(p.as_ptr());
      h.free(core::ptr::null_mut());
      assert_eq!(h.realloc(p.as_ptr(), 0).unwrap(), zero_size_ptr());
    }
    assert_eq!(zero_size_ptr().as_ptr() as usize % h.alignment(), 0);
  }

  #[test]
  fn slices_share_a_block_and_stay_aligned() {
    let h = heap(small_config());
    let a = h.malloc(24).unwrap();
    let b = h.malloc(100).unwrap();
    assert_eq!(a.as_ptr() as usize % 16, 0);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 32);
    unsafe {
      h.free(a.as_ptr());
      h.free(b.as_ptr());
    }
  }

  #[test]
  fn sole_owner_block_restarts_from_the_top() {
    let h = heap(small_config());
    let a = h.malloc(64).unwrap();
    unsafe { h.free(a.as_ptr()) };
    let b = h.malloc(64).unwrap();
    assert_eq!(a, b);
    unsafe { h.free(b.as_ptr()) };
  }

  #[test]
  fn newest_slice_grows_in_place() {
    let h = heap(small_config());
    let p = h.malloc(32).unwrap();
    unsafe {
      p.as_ptr().write_bytes(7, 32);
      let q = h.realloc(p.as_ptr(), 4000).unwrap();
      assert_eq!(p, q);
      assert!(core::slice::from_raw_parts(q.as_ptr(), 32).iter().all(|&b| b == 7));

      // Another slice lands after it, so the next growth must move.
      let other = h.malloc(16).unwrap();
      let r = h.realloc(q.as_ptr(), 8000).unwrap();
      assert_ne!(q, r);
      assert!(core::slice::from_raw_parts(r.as_ptr(), 32).iter().all(|&b| b == 7));
      h.free(other.as_ptr());
      h.free(r.as_ptr());
    }
  }

  #[test]
  fn realloc_moving_into_its_own_block_keeps_the_prefix() {
    let h = heap(small_config());
    let p = h.malloc(64).unwrap();
    let other = h.malloc(16).unwrap();
    unsafe {
      for i in 0..64 {
        p.as_ptr().add(i).write(i as u8);
      }
      // The new slice starts right after `other`, inside the 1000 bytes
      // read from `p`.
      let q = h.realloc(p.as_ptr(), 1000).unwrap();
      let gap = q.as_ptr() as usize - p.as_ptr() as usize;
      assert!(gap > 0 && gap < 1000, "gap {gap}");
      for i in 0..64 {
        assert_eq!(*q.as_ptr().add(i), i as u8);
      }
      h.free(other.as_ptr());
      h.free(q.as_ptr());
    }
  }

  #[test]
  fn sizes_route_to_their_tier() {
    let h = heap(small_config());
    let small = h.malloc(h.block_limit()).unwrap();
    let big = h.malloc(h.block_limit() + 1).unwrap();
    let mapped = h.malloc(h.big_limit() + 1).unwrap();
    unsafe {
      assert!(matches!(h.geo.resolve(small.as_ptr()), Some(Region::Chunk(_))));
      assert!(matches!(h.geo.resolve(big.as_ptr()), Some(Region::Big(_))));
      assert!(matches!(h.geo.resolve(mapped.as_ptr()), Some(Region::Mapped(_))));
      assert!(h.usable_size(mapped.as_ptr()) >= h.big_limit() + 1);
      h.free(small.as_ptr());
      h.free(big.as_ptr());
      h.free(mapped.as_ptr());
    }
  }

  #[test]
  fn big_tier_disabled_goes_straight_to_mappings() {
    let h = heap(Config {
      enable_big_alloc: false,
      ..small_config()
    });
    let p = h.malloc(h.block_limit() + 1).unwrap();
    unsafe {
      assert!(matches!(h.geo.resolve(p.as_ptr()), Some(Region::Mapped(_))));
      h.free(p.as_ptr());
    }
  }

  #[test]
  fn calloc_zeroes_reused_memory() {
    let h = heap(small_config());
    let p = h.malloc(256).unwrap();
    let keep = h.malloc(16).unwrap();
    unsafe {
      p.as_ptr().write_bytes(0xEE, 256);
      h.free(p.as_ptr());
    }
    let q = h.calloc(16, 16).unwrap();
    unsafe {
      assert!(core::slice::from_raw_parts(q.as_ptr(), 256).iter().all(|&b| b == 0));
      h.free(q.as_ptr());
      h.free(keep.as_ptr());
    }
  }

  #[test]
  fn calloc_overflow_is_an_error() {
    let h = heap(small_config());
    assert_eq!(
      h.calloc(usize::MAX, 2),
      Err(Error::SizeOverflow { count: usize::MAX, size: 2 })
    );
  }

  #[test]
  fn foreign_pointers_are_tolerated() {
    let h = heap(small_config());
    let bogus = 16 as *mut u8;
    unsafe {
      h.free(bogus);
      assert_eq!(h.realloc(bogus, 8), Err(Error::InvalidPointer { addr: 16 }));
      assert_eq!(h.usable_size(bogus), 0);
    }
  }

  #[test]
  fn over_aligned_requests_are_padded() {
    let h = heap(small_config());
    for align in [32, 256, 4096] {
      let p = h.malloc_aligned(100, align).unwrap();
      assert_eq!(p.as_ptr() as usize % align, 0);
      unsafe { h.free(p.as_ptr()) };
    }
    assert_eq!(
      h.malloc_aligned(8, 3),
      Err(Error::UnsupportedAlignment { align: 3 })
    );
    assert_eq!(
      h.malloc_aligned(8, h.chunk_size()),
      Err(Error::UnsupportedAlignment { align: h.chunk_size() })
    );
  }

  #[test]
  fn over_aligned_requests_past_the_big_tier_are_mapped() {
    let h = heap(small_config());
    for align in [64, 4096, h.chunk_size() / 2] {
      let size = 2 * h.chunk_size();
      let p = h.malloc_aligned(size, align).unwrap();
      assert_eq!(p.as_ptr() as usize % align, 0);
      unsafe {
        assert!(matches!(h.geo.resolve(p.as_ptr()), Some(Region::Mapped(_))));
        assert!(h.usable_size(p.as_ptr()) >= size);
        p.as_ptr().write(3);
        p.as_ptr().add(size - 1).write(4);

        let q = h.realloc(p.as_ptr(), 3 * h.chunk_size()).unwrap();
        assert_eq!(q.as_ptr() as usize % align, 0);
        assert_eq!(*q.as_ptr(), 3);
        assert_eq!(*q.as_ptr().add(size - 1), 4);
        h.free(q.as_ptr());
      }
    }
    assert_eq!(
      h.malloc_aligned(usize::MAX - 8, 64),
      Err(Error::OutOfMemory { requested: usize::MAX - 8 })
    );
  }

  #[test]
  fn mapped_resize_keeps_the_prefix() {
    let h = heap(small_config());
    let p = h.mmap_alloc(10).unwrap();
    unsafe {
      for i in 0..10 {
        p.as_ptr().add(i).write(i as u8);
      }
      let q = h.realloc(p.as_ptr(), 4 * h.chunk_size()).unwrap();
      for i in 0..10 {
        assert_eq!(*q.as_ptr().add(i), i as u8);
      }
      q.as_ptr().add(4 * h.chunk_size() - 1).write(1);
      let r = h.realloc(q.as_ptr(), 100).unwrap();
      assert!(matches!(h.geo.resolve(r.as_ptr()), Some(Region::Chunk(_))));
      assert_eq!(*r.as_ptr().add(9), 9);
      h.free(r.as_ptr());
    }
  }

  #[test]
  fn after_fork_unlocks_a_stranded_arena() {
    let h = heap(small_config());
    core::mem::forget(h.arenas[0].slot.lock());
    core::mem::forget(h.pool.lock());
    assert!(h.arenas[0].slot.try_lock().is_none());
    unsafe { h.after_fork() };
    let p = h.malloc(8).unwrap();
    unsafe { h.free(p.as_ptr()) };
  }

  #[test]
  fn teardown_leaves_a_usable_heap() {
    let h = heap(small_config());
    let p = h.malloc(1000).unwrap();
    unsafe { h.free(p.as_ptr()) };
    h.teardown();
    h.teardown();
    assert_eq!(h.pool.lock().free.len(), 0);
    assert_eq!(h.pool.lock().cache.len(), 0);
    let q = h.malloc(1000).unwrap();
    unsafe { h.free(q.as_ptr()) };
  }
}
