#![allow(dead_code)]

use std::{
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};

use chunkmalloc::{Config, OsPages, PageSource};

/// OS pages with a tally of every call.
#[derive(Default)]
pub struct CountingPages {
  pub reserves: AtomicUsize,
  pub remaps: AtomicUsize,
  pub releases: AtomicUsize,
}

impl CountingPages {
  pub fn reserves(&self) -> usize {
    self.reserves.load(Ordering::Relaxed)
  }

  pub fn remaps(&self) -> usize {
    self.remaps.load(Ordering::Relaxed)
  }

  pub fn releases(&self) -> usize {
    self.releases.load(Ordering::Relaxed)
  }

  /// Every call so far.
  pub fn calls(&self) -> usize {
    self.reserves() + self.remaps() + self.releases()
  }
}

impl PageSource for CountingPages {
  fn reserve(&self, pages: usize, align_log: u8) -> Option<NonNull<u8>> {
    self.reserves.fetch_add(1, Ordering::Relaxed);
    OsPages.reserve(pages, align_log)
  }

  unsafe fn remap(
    &self,
    ptr: NonNull<u8>,
    old_pages: usize,
    new_pages: usize,
    align_log: u8,
  ) -> Option<NonNull<u8>> {
    self.remaps.fetch_add(1, Ordering::Relaxed);
    unsafe { OsPages.remap(ptr, old_pages, new_pages, align_log) }
  }

  unsafe fn release(&self, ptr: NonNull<u8>, pages: usize) {
    self.releases.fetch_add(1, Ordering::Relaxed);
    unsafe { OsPages.release(ptr, pages) }
  }
}

/// 256K chunks of four 64K blocks: 16K block limit, 64K big limit.
pub fn small_config() -> Config {
  Config {
    system_allocation_size_log: 18,
    blocks_per_allocation_log: 2,
    arena_count: 1,
    cache_slots: 8,
    ..Config::default()
  }
}

pub fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
  for i in 0..len {
    unsafe { ptr.as_ptr().add(i).write(pattern(i, seed)) };
  }
}

pub fn holds_pattern(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
  (0..len).all(|i| unsafe { *ptr.as_ptr().add(i) } == pattern(i, seed))
}

pub fn is_zeroed(ptr: NonNull<u8>, from: usize, to: usize) -> bool {
  (from..to).all(|i| unsafe { *ptr.as_ptr().add(i) } == 0)
}

#[inline]
fn pattern(i: usize, seed: u8) -> u8 {
  (i as u8).wrapping_mul(31).wrapping_add(seed)
}
