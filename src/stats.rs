//! Point-in-time view of a heap, for diagnostics.
//!
//! Nothing here is part of the allocation contract. Each lock is taken
//! briefly and in turn, so the parts of a [`Snapshot`] may disagree with one
//! another on a busy heap.

use core::{fmt, sync::atomic::Ordering};

use crate::{config::Settings, heap::Heap, pages::PageSource};

/// Occupancy of one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSnapshot {
  pub index: usize,
  /// `(chunk address, block index)` of the active block.
  pub block: Option<(usize, usize)>,
  /// References on the active block, the arena's own included.
  pub refs: i32,
  /// Bytes handed out from the active block since its last reset.
  pub used: usize,
  /// `false` when the arena was locked and could not be inspected.
  pub inspected: bool,
}

/// State of the shared big block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSnapshot {
  pub addr: usize,
  pub refs: i32,
  pub used: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  pub settings: Settings,
  pub arenas: Vec<ArenaSnapshot>,
  /// Idle blocks on the free list.
  pub free_blocks: usize,
  /// Addresses of the idle blocks, head first.
  pub free_list: Vec<usize>,
  pub cached_chunks: usize,
  pub big: Option<BigSnapshot>,
}

impl<P: PageSource> Heap<P> {
  /// Inspects the heap. Never allocates while holding one of its locks.
  pub fn snapshot(&self) -> Snapshot {
    let unit_log = self.geo.unit_log;
    let count = self.settings.arena_count;

    let mut arenas = Vec::with_capacity(count);
    for (index, arena) in self.arenas[..count].iter().enumerate() {
      let Some(slot) = arena.slot.try_lock() else {
        arenas.push(ArenaSnapshot { index, block: None, refs: 0, used: 0, inspected: false });
        continue;
      };
      let snap = match slot.block {
        Some(block) => {
          let hdr = block.header();
          let pos = hdr.pos.load(Ordering::Relaxed);
          ArenaSnapshot {
            index,
            block: Some((block.chunk.as_ptr() as usize, block.index)),
            refs: hdr.refs.load(Ordering::Relaxed),
            used: ((pos - self.geo.block_start) as usize) << unit_log,
            inspected: true,
          }
        }
        None => ArenaSnapshot { index, block: None, refs: 0, used: 0, inspected: true },
      };
      drop(slot);
      arenas.push(snap);
    }

    let big = self.big.lock().block.map(|big| {
      let hdr = unsafe { big.as_ref() };
      let pos = hdr.pos.load(Ordering::Relaxed);
      BigSnapshot {
        addr: big.as_ptr() as usize,
        refs: hdr.refs.load(Ordering::Relaxed),
        used: ((pos - self.geo.big_start) as usize) << unit_log,
      }
    });

    // Sized outside the lock; entries past the reserved room are dropped
    // rather than growing the vector under it.
    let hint = self.pool.lock().free.len();
    let mut free_list = Vec::with_capacity(hint);
    let (free_blocks, cached_chunks) = {
      let pool = self.pool.lock();
      pool.free.for_each(|node| {
        if free_list.len() == free_list.capacity() {
          return false;
        }
        free_list.push(node as usize);
        true
      });
      (pool.free.len(), pool.cache.len())
    };

    Snapshot {
      settings: self.settings,
      arenas,
      free_blocks,
      free_list,
      cached_chunks,
      big,
    }
  }
}

impl fmt::Display for Snapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = &self.settings;
    writeln!(
      f,
      "chunkmalloc: align={} chunk={}K blocks={} arenas={}{} big={} zero={} mutex={} reset={:?}",
      1usize << s.alignment_log,
      (1usize << s.chunk_log) >> 10,
      1usize << s.blocks_log,
      s.arena_count,
      if s.arena_count_fixed { "" } else { " (auto)" },
      s.enable_big_alloc,
      s.initialize_allocations,
      s.use_thread_mutex,
      s.block_reset,
    )?;
    for arena in &self.arenas {
      match (arena.inspected, arena.block) {
        (false, _) => writeln!(f, "  arena {:>3}: locked", arena.index)?,
        (true, None) => writeln!(f, "  arena {:>3}: idle", arena.index)?,
        (true, Some((chunk, block))) => writeln!(
          f,
          "  arena {:>3}: chunk {:#x} block {} refs {} used {}",
          arena.index, chunk, block, arena.refs, arena.used
        )?,
      }
    }
    match self.big {
      Some(big) => writeln!(f, "  big: {:#x} refs {} used {}", big.addr, big.refs, big.used)?,
      None => writeln!(f, "  big: none")?,
    }
    writeln!(f, "  free blocks: {}", self.free_blocks)?;
    for addr in &self.free_list {
      writeln!(f, "    {addr:#x}")?;
    }
    write!(f, "  cached chunks: {}", self.cached_chunks)
  }
}
