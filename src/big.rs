//! Big block tier: mid-size requests sliced from one shared chunk-sized region.
//!
//! Same shape as the arena path, but with a single slot behind its own lock,
//! separate from the global lock so small and big allocations do not contend.

use core::{
  mem::size_of,
  ptr::{self, NonNull},
  sync::atomic::Ordering,
};

use crate::{
  block::{Cursor, ReallocHint},
  error::{Error, Result},
  heap::Heap,
  layout::{BigHeader, ChunkHeader, RegionKind},
  pages::PageSource,
};

pub(crate) struct BigSlot {
  /// Current big block; the slot owns one of its references.
  pub(crate) block: Option<NonNull<BigHeader>>,
  pub(crate) cursor: Cursor,
}

unsafe impl Send for BigSlot {}

impl BigSlot {
  pub(crate) const fn new() -> Self {
    Self {
      block: None,
      cursor: Cursor { last_pos: None },
    }
  }
}

impl<P: PageSource> Heap<P> {
  /// A fresh big block with `refs == 1`, from the chunk cache or the page source.
  fn big_new(&self) -> Option<NonNull<BigHeader>> {
    let cached = self.pool.lock().cache.pop();
    let region = match cached {
      Some(region) => {
        // Clear whatever chunk header the region carried; big data starts inside it.
        unsafe { ptr::write_bytes(region.as_ptr(), 0, size_of::<ChunkHeader>()) };
        region
      }
      None => self.region_reserve()?,
    };

    let big = region.cast::<BigHeader>();
    unsafe { (&raw mut (*big.as_ptr()).marker).write(RegionKind::Big.marker()) };
    let hdr = unsafe { big.as_ref() };
    hdr.refs.store(1, Ordering::Relaxed);
    hdr.pos.store(self.geo.big_start, Ordering::Relaxed);
    Some(big)
  }

  fn big_scrub(&self, big: NonNull<BigHeader>) {
    let hdr = unsafe { big.as_ref() };
    let used = hdr.pos.load(Ordering::Relaxed);
    let start = self.geo.big_start;
    self.scrub(big.as_ptr().cast(), start, used, self.geo.units_per_chunk);
    hdr.pos.store(start, Ordering::Relaxed);
  }

  /// Drops one reference from a big block; the last one caches or releases it.
  pub(crate) fn big_free(&self, big: NonNull<BigHeader>) {
    let hdr = unsafe { big.as_ref() };
    let prev = hdr.refs.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(
      prev >= 1 && prev as usize <= self.geo.units_per_chunk as usize + 1,
      "big_free: refs {prev} out of range (double free?)"
    );
    if prev != 1 {
      return;
    }

    self.big_scrub(big);
    let region = big.cast::<u8>();
    let cached = self.pool.lock().cache.push(region);
    if !cached {
      self.region_release(region);
    }
  }

  /// Slices `size` bytes from the shared big block.
  pub(crate) fn big_slice(&self, size: usize, hint: Option<ReallocHint>) -> Result<NonNull<u8>> {
    let units = self.geo.units_for(size) as u32;
    let limit = self.geo.units_per_chunk;
    let mut slot = self.big.lock();

    loop {
      let big = match slot.block {
        Some(big) => big,
        None => {
          let big = self.big_new().ok_or(Error::OutOfMemory { requested: size })?;
          slot.block = Some(big);
          slot.cursor = Cursor::default();
          big
        }
      };

      let hdr = unsafe { big.as_ref() };
      let prior = hdr.refs.fetch_add(1, Ordering::Acquire);
      let mut pos = hdr.pos.load(Ordering::Relaxed);
      if prior == 1 && pos != self.geo.big_start {
        self.big_scrub(big);
        pos = self.geo.big_start;
        slot.cursor = Cursor::default();
      }

      if let (Some(hint), Some(last)) = (hint, slot.cursor.last_pos)
        && self.geo.big_ptr(big, last) == hint.ptr.as_ptr()
        && last + units <= limit
      {
        hdr.refs.fetch_sub(1, Ordering::Relaxed);
        self.resize_tail(hint, last, pos);
        hdr.pos.store(last + units, Ordering::Relaxed);
        return Ok(hint.ptr);
      }

      if pos + units <= limit {
        hdr.pos.store(pos + units, Ordering::Relaxed);
        slot.cursor.last_pos = Some(pos);
        return NonNull::new(self.geo.big_ptr(big, pos)).ok_or(Error::OutOfMemory { requested: size });
      }

      let fresh = self.big_new();
      hdr.refs.fetch_sub(1, Ordering::Release);
      let Some(fresh) = fresh else {
        return Err(Error::OutOfMemory { requested: size });
      };
      slot.block = Some(fresh);
      slot.cursor = Cursor::default();
      self.big_free(big);
    }
  }
}
