//! Arenas: per-thread-ish front ends, each holding one active block.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
  block::{BlockRef, Cursor},
  heap::Heap,
  pages::PageSource,
  sync::{Guard, Locked},
};

pub(crate) struct ArenaSlot {
  /// Block being sliced; the arena owns one of its references.
  pub(crate) block: Option<BlockRef>,
  pub(crate) cursor: Cursor,
}

/// Padded to a cache line so neighbouring arena locks do not share one.
#[repr(align(64))]
pub(crate) struct Arena {
  pub(crate) slot: Locked<ArenaSlot>,
}

impl Arena {
  pub(crate) const fn new(blocking: bool) -> Self {
    Self {
      slot: Locked::new(
        ArenaSlot {
          block: None,
          cursor: Cursor { last_pos: None },
        },
        blocking,
      ),
    }
  }
}

// Each thread gets a different ID
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  // During thread teardown the slot may already be gone; any arena will do.
  TID.try_with(|&id| id).unwrap_or(0)
}

/// Spreads sequential thread ids over the arena indices.
#[inline]
fn arena_hash(tid: u32, count: usize) -> usize {
  ((tid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % count
}

impl<P: PageSource> Heap<P> {
  /// Locks an arena for the calling thread.
  ///
  /// Starts at the thread's hashed arena and probes onward with `try_lock`
  /// for `2 * count` attempts. When every probe fails, a blocking lock waits on
  /// the hashed arena, while a spin lock yields the CPU and probes again.
  pub(crate) fn arena_lock(&self) -> Guard<'_, ArenaSlot> {
    let count = self.settings.arena_count;
    if count == 1 {
      return self.arenas[0].slot.lock();
    }

    let home = arena_hash(thread_id_u32(), count);
    loop {
      for i in 0..2 * count {
        if let Some(guard) = self.arenas[(home + i) % count].slot.try_lock() {
          return guard;
        }
      }

      self.warn_contention();
      let arena = &self.arenas[home].slot;
      if arena.is_blocking() {
        return arena.lock();
      }
      std::thread::yield_now();
    }
  }

  fn warn_contention(&self) {
    if self.settings.arena_count_fixed && !self.contention_warned.swap(true, Ordering::Relaxed) {
      log::warn!(
        "chunkmalloc: all {} arenas contended; consider a larger or CPU-derived arena count",
        self.settings.arena_count
      );
    }
  }

  /// Hands blocks to the first `settings.warmup` arenas.
  pub(crate) fn warm_up(&mut self) {
    for i in 0..self.settings.warmup {
      let block = self.block_new();
      if block.is_none() {
        break;
      }
      self.arenas[i].slot.get_mut().block = block;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{config::Config, heap::tests::small_config};

  /// Holds every arena lock while another thread allocates, then lets it in.
  fn allocate_past_held_arenas(use_thread_mutex: bool) {
    let h = Heap::new(Config {
      arena_count: 2,
      use_thread_mutex: Some(use_thread_mutex),
      ..small_config()
    })
    .unwrap();
    assert!(h.settings.arena_count_fixed);

    std::thread::scope(|s| {
      let held = [h.arenas[0].slot.lock(), h.arenas[1].slot.lock()];
      let worker = s.spawn(|| h.malloc(48).unwrap().as_ptr() as usize);
      while !h.contention_warned.load(Ordering::Relaxed) {
        std::thread::yield_now();
      }
      assert!(!worker.is_finished());
      drop(held);

      let p = worker.join().unwrap();
      unsafe { h.free(p as *mut u8) };
    });
  }

  #[test]
  fn spinning_arenas_yield_until_one_frees_up() {
    allocate_past_held_arenas(false);
  }

  #[test]
  fn blocking_arenas_wait_on_the_home_arena() {
    allocate_past_held_arenas(true);
  }

  #[test]
  fn derived_arena_count_never_warns() {
    let h = Heap::new(Config {
      arena_count: -1,
      arena_count_max: 2,
      ..small_config()
    })
    .unwrap();
    h.warn_contention();
    assert!(!h.contention_warned.load(Ordering::Relaxed));
  }

  #[test]
  fn hash_stays_in_range() {
    for count in 1..=16 {
      for tid in 0..200 {
        assert!(arena_hash(tid, count) < count);
      }
    }
  }

  #[test]
  fn sequential_threads_spread() {
    let mut hit = [false; 8];
    for tid in 1..=64 {
      hit[arena_hash(tid, 8)] = true;
    }
    assert!(hit.iter().all(|&h| h));
  }

  #[test]
  fn thread_ids_differ() {
    let here = thread_id_u32();
    let there = std::thread::spawn(thread_id_u32).join().unwrap();
    assert_ne!(here, there);
    assert_eq!(here, thread_id_u32());
  }
}
