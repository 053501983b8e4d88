//! Page source: raw, alignment-guaranteed memory from the operating system.

use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

/// `log2` of the page unit used by [`PageSource`] sizes.
pub const PAGE_SIZE_LOG: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG;

/// Pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
  bytes.div_ceil(PAGE_SIZE)
}

/// Supplier of page-granular memory.
///
/// The three hooks form one unit: a heap never mixes memory from different
/// sources, so overriding one means overriding all of them. Returned memory
/// must read as zero and be aligned to `1 << align_log` bytes.
pub trait PageSource: Send + Sync {
  /// Reserves `pages` pages aligned to `1 << align_log`. `None` means the
  /// system is out of memory; there is no retry at this layer.
  fn reserve(&self, pages: usize, align_log: u8) -> Option<NonNull<u8>>;

  /// Resizes a reservation made by `reserve`, preserving the first
  /// `min(old_pages, new_pages)` pages. Shrinking never fails. Growing may move
  /// the reservation; on failure the original is left untouched.
  ///
  /// # Safety
  /// `ptr` must come from this source with a size of `old_pages`.
  unsafe fn remap(
    &self,
    ptr: NonNull<u8>,
    old_pages: usize,
    new_pages: usize,
    align_log: u8,
  ) -> Option<NonNull<u8>>;

  /// Returns a reservation to the system.
  ///
  /// # Safety
  /// `ptr` must come from this source with a size of `pages`, and must not be
  /// used afterwards.
  unsafe fn release(&self, ptr: NonNull<u8>, pages: usize);
}

impl<T: PageSource + ?Sized> PageSource for &T {
  fn reserve(&self, pages: usize, align_log: u8) -> Option<NonNull<u8>> {
    (**self).reserve(pages, align_log)
  }

  unsafe fn remap(
    &self,
    ptr: NonNull<u8>,
    old_pages: usize,
    new_pages: usize,
    align_log: u8,
  ) -> Option<NonNull<u8>> {
    unsafe { (**self).remap(ptr, old_pages, new_pages, align_log) }
  }

  unsafe fn release(&self, ptr: NonNull<u8>, pages: usize) {
    unsafe { (**self).release(ptr, pages) }
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(hint: *mut u8, size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      hint.cast(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if size != 0 {
    unsafe { libc::munmap(ptr.cast(), size) };
  }
}

/// Extends a mapping without moving it. Returns `false` if the pages after
/// the mapping are not available.
#[cfg(target_os = "linux")]
unsafe fn os_extend_in_place(ptr: *mut u8, old_len: usize, new_len: usize) -> bool {
  let res = unsafe { libc::mremap(ptr.cast(), old_len, new_len, 0) };
  res != libc::MAP_FAILED
}

#[cfg(not(target_os = "linux"))]
unsafe fn os_extend_in_place(ptr: *mut u8, old_len: usize, new_len: usize) -> bool {
  let tail = unsafe { ptr.add(old_len) };
  let extra = new_len - old_len;
  let got = unsafe { os_mmap(tail, extra) };
  if got == tail {
    return true;
  }
  if !got.is_null() {
    unsafe { os_munmap(got, extra) };
  }
  false
}

/// End of the latest aligned reservation. The next reservation first asks
/// for the aligned address just past it.
static NEXT_HINT: AtomicUsize = AtomicUsize::new(0);

/// Anonymous private mappings from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

impl OsPages {
  /// Extends a mapping, in place when the kernel allows it, otherwise by
  /// mapping a new region, copying, and unmapping the old one.
  ///
  /// # Safety
  /// See [`PageSource::remap`].
  pub unsafe fn grow(
    &self,
    ptr: NonNull<u8>,
    old_pages: usize,
    new_pages: usize,
    align_log: u8,
  ) -> Option<NonNull<u8>> {
    let old_len = old_pages << PAGE_SIZE_LOG;
    let new_len = new_pages << PAGE_SIZE_LOG;
    if unsafe { os_extend_in_place(ptr.as_ptr(), old_len, new_len) } {
      return Some(ptr);
    }

    let fresh = self.reserve(new_pages, align_log)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_len);
      os_munmap(ptr.as_ptr(), old_len);
    }
    Some(fresh)
  }

  /// Unmaps the pages past `new_pages`.
  ///
  /// # Safety
  /// See [`PageSource::remap`].
  pub unsafe fn shrink(&self, ptr: NonNull<u8>, old_pages: usize, new_pages: usize) {
    let keep = new_pages << PAGE_SIZE_LOG;
    let drop_len = (old_pages - new_pages) << PAGE_SIZE_LOG;
    unsafe { os_munmap(ptr.as_ptr().add(keep), drop_len) };
  }
}

impl PageSource for OsPages {
  fn reserve(&self, pages: usize, align_log: u8) -> Option<NonNull<u8>> {
    let len = pages.checked_mul(PAGE_SIZE)?;
    let align = (1usize << align_log).max(PAGE_SIZE);

    let hint = NEXT_HINT.load(Ordering::Relaxed);
    let hint = if hint == 0 { 0 } else { align_up(hint, align) };
    let raw = unsafe { os_mmap(hint as *mut u8, len) };
    if raw.is_null() {
      return None;
    }
    if raw as usize & (align - 1) == 0 {
      NEXT_HINT.store(raw as usize + len, Ordering::Relaxed);
      return NonNull::new(raw);
    }

    // Misaligned: over-allocate and trim the unaligned head and tail.
    unsafe { os_munmap(raw, len) };
    let padded = len.checked_add(align)?;
    let raw = unsafe { os_mmap(null_mut(), padded) };
    if raw.is_null() {
      return None;
    }
    let aligned = align_up(raw as usize, align);
    let head = aligned - raw as usize;
    let tail = padded - head - len;
    unsafe {
      os_munmap(raw, head);
      os_munmap((aligned + len) as *mut u8, tail);
    }
    NEXT_HINT.store(aligned + len, Ordering::Relaxed);
    NonNull::new(aligned as *mut u8)
  }

  unsafe fn remap(
    &self,
    ptr: NonNull<u8>,
    old_pages: usize,
    new_pages: usize,
    align_log: u8,
  ) -> Option<NonNull<u8>> {
    if new_pages == old_pages {
      return Some(ptr);
    }
    if new_pages < old_pages {
      unsafe { self.shrink(ptr, old_pages, new_pages) };
      return Some(ptr);
    }
    unsafe { self.grow(ptr, old_pages, new_pages, align_log) }
  }

  unsafe fn release(&self, ptr: NonNull<u8>, pages: usize) {
    unsafe { os_munmap(ptr.as_ptr(), pages << PAGE_SIZE_LOG) };
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  const CHUNK_LOG: u8 = 20;

  #[test]
  fn reserve_honours_alignment() {
    let os = OsPages;
    let pages = pages_for(1 << CHUNK_LOG);
    let p = os.reserve(pages, CHUNK_LOG).unwrap();
    assert_eq!(p.as_ptr() as usize & ((1 << CHUNK_LOG) - 1), 0);
    unsafe {
      assert_eq!(*p.as_ptr(), 0);
      p.as_ptr().add((1 << CHUNK_LOG) - 1).write(7);
      os.release(p, pages);
    }
  }

  #[test]
  fn reservations_advance_the_hint() {
    let os = OsPages;
    let pages = pages_for(1 << CHUNK_LOG);
    let ptrs: Vec<_> = (0..4).map(|_| os.reserve(pages, CHUNK_LOG).unwrap()).collect();
    for p in &ptrs {
      assert_eq!(p.as_ptr() as usize & ((1 << CHUNK_LOG) - 1), 0);
    }
    assert_ne!(NEXT_HINT.load(Ordering::Relaxed), 0);
    for p in ptrs {
      unsafe { os.release(p, pages) };
    }
  }

  #[test]
  fn grow_preserves_contents() {
    let os = OsPages;
    let p = os.reserve(2, CHUNK_LOG).unwrap();
    unsafe {
      for i in 0..2 * PAGE_SIZE {
        p.as_ptr().add(i).write(i as u8);
      }
      let q = os.remap(p, 2, 64, CHUNK_LOG).unwrap();
      assert_eq!(q.as_ptr() as usize & ((1 << CHUNK_LOG) - 1), 0);
      for i in 0..2 * PAGE_SIZE {
        assert_eq!(*q.as_ptr().add(i), i as u8);
      }
      q.as_ptr().add(64 * PAGE_SIZE - 1).write(1);
      os.release(q, 64);
    }
  }

  #[test]
  fn shrink_keeps_the_head() {
    let os = OsPages;
    let p = os.reserve(8, CHUNK_LOG).unwrap();
    unsafe {
      p.as_ptr().write(9);
      let q = os.remap(p, 8, 1, CHUNK_LOG).unwrap();
      assert_eq!(p, q);
      assert_eq!(*q.as_ptr(), 9);
      os.release(q, 1);
    }
  }

  #[test]
  fn page_math() {
    assert_eq!(pages_for(0), 0);
    assert_eq!(pages_for(1), 1);
    assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    assert_eq!(align_up(17, 16), 32);
  }
}
