//! Memory layout: region headers and the size arithmetic derived from a
//! [`Settings`].
//!
//! Every region the heap obtains from its page source (chunk, big block, or
//! direct mapping) is aligned to the chunk size, so the region owning any
//! pointer is found by masking off the low bits. The first word of every
//! region is a marker naming which header follows.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicI32, AtomicU32},
};

use crate::{
  config::{MAX_BLOCKS_PER_CHUNK, Settings},
  pages::{PAGE_SIZE, align_up},
};

// =============================================================================
// Region headers
// =============================================================================

const CHUNK_MARKER: u32 = 0x4B4E_4843; // "CHNK"
const BIG_MARKER: u32 = 0x4247_4942; // "BIGB"
const MAPPED_MARKER: u32 = 0x5041_4D4D; // "MMAP"

/// What kind of header sits at the start of a region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RegionKind {
  Chunk,
  Big,
  Mapped,
}

impl RegionKind {
  pub(crate) const fn marker(self) -> u32 {
    match self {
      RegionKind::Chunk => CHUNK_MARKER,
      RegionKind::Big => BIG_MARKER,
      RegionKind::Mapped => MAPPED_MARKER,
    }
  }

  pub(crate) const fn from_marker(marker: u32) -> Option<Self> {
    match marker {
      CHUNK_MARKER => Some(RegionKind::Chunk),
      BIG_MARKER => Some(RegionKind::Big),
      MAPPED_MARKER => Some(RegionKind::Mapped),
      _ => None,
    }
  }
}

/// Per-block bookkeeping, stored in the owning chunk's header.
#[repr(C)]
pub(crate) struct BlockHeader {
  /// Live allocations in the block, plus one while an arena holds it.
  pub(crate) refs: AtomicI32,
  /// Next free position, in allocation units from the block base.
  pub(crate) pos: AtomicU32,
}

#[repr(C)]
pub(crate) struct ChunkHeader {
  pub(crate) marker: u32,
  /// Blocks of this chunk currently claimed (not idle in the free list).
  pub(crate) refs: AtomicI32,
  pub(crate) blocks: [BlockHeader; MAX_BLOCKS_PER_CHUNK],
}

#[repr(C)]
pub(crate) struct BigHeader {
  pub(crate) marker: u32,
  /// Live slices, plus one while the big slot holds it.
  pub(crate) refs: AtomicI32,
  pub(crate) pos: AtomicU32,
}

/// Header of a direct mapping.
#[repr(C)]
pub(crate) struct MappedHeader {
  pub(crate) marker: u32,
  pub(crate) pages: u32,
  /// Bytes from the region start to the caller's pointer. Always below the
  /// chunk size, so the pointer masks back to this header.
  pub(crate) offset: u32,
}

const _: () = assert!(size_of::<MappedHeader>() <= 16);
const _: () = assert!(size_of::<BigHeader>() <= size_of::<ChunkHeader>());

/// A resolved region, tagged by its header kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Region {
  Chunk(NonNull<ChunkHeader>),
  Big(NonNull<BigHeader>),
  Mapped(NonNull<MappedHeader>),
}

// =============================================================================
// Geometry
// =============================================================================

/// Sizes and limits shared by every tier of one heap.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
  pub(crate) unit_log: u32,
  pub(crate) chunk_log: u32,
  pub(crate) block_log: u32,
  pub(crate) blocks_per_chunk: usize,
  /// First usable position of every block, past the chunk header.
  pub(crate) block_start: u32,
  pub(crate) units_per_block: u32,
  /// First usable position of a big block.
  pub(crate) big_start: u32,
  pub(crate) units_per_chunk: u32,
  /// Largest request served from a block.
  pub(crate) block_limit: usize,
  /// Largest request served from the big block; equals `block_limit` when
  /// the big tier is disabled.
  pub(crate) big_limit: usize,
  /// Smallest data offset of a direct mapping: the header rounded up to a
  /// whole unit.
  pub(crate) mapped_start: usize,
}

impl Geometry {
  pub(crate) fn new(settings: &Settings) -> Self {
    let unit_log = settings.alignment_log as u32;
    let chunk_log = settings.chunk_log as u32;
    let block_log = chunk_log - settings.blocks_log as u32;
    let unit = 1usize << unit_log;
    let block_size = 1usize << block_log;
    let chunk_size = 1usize << chunk_log;

    let block_start = (size_of::<ChunkHeader>().div_ceil(unit)) as u32;
    let units_per_block = (block_size >> unit_log) as u32;
    let usable = ((units_per_block - block_start) as usize) << unit_log;

    let shift = if settings.enable_big_alloc { 2 } else { 1 };
    let block_limit = (block_size >> shift).min(usable) & !(unit - 1);
    let big_limit = if settings.enable_big_alloc {
      (chunk_size >> 2).max(block_limit)
    } else {
      block_limit
    };

    Self {
      unit_log,
      chunk_log,
      block_log,
      blocks_per_chunk: 1 << settings.blocks_log,
      block_start,
      units_per_block,
      big_start: (size_of::<BigHeader>().div_ceil(unit)) as u32,
      units_per_chunk: (chunk_size >> unit_log) as u32,
      block_limit,
      big_limit,
      mapped_start: align_up(size_of::<MappedHeader>(), unit),
    }
  }

  #[inline]
  pub(crate) const fn unit(&self) -> usize {
    1 << self.unit_log
  }

  #[inline]
  pub(crate) const fn chunk_size(&self) -> usize {
    1 << self.chunk_log
  }

  #[inline]
  pub(crate) const fn block_size(&self) -> usize {
    1 << self.block_log
  }

  /// Pages of one chunk.
  #[inline]
  pub(crate) const fn chunk_pages(&self) -> usize {
    self.chunk_size() / PAGE_SIZE
  }

  /// `bytes` rounded up to whole allocation units, in units.
  #[inline]
  pub(crate) fn units_for(&self, bytes: usize) -> usize {
    bytes.div_ceil(self.unit())
  }

  #[inline]
  pub(crate) fn round_up(&self, bytes: usize) -> usize {
    align_up(bytes, self.unit())
  }

  /// Start of the chunk-aligned region containing `ptr`, if any.
  #[inline]
  pub(crate) fn region_base(&self, ptr: *const u8) -> Option<NonNull<u8>> {
    NonNull::new((ptr as usize & !(self.chunk_size() - 1)) as *mut u8)
  }

  /// Index of the block containing `ptr` inside its chunk.
  #[inline]
  pub(crate) fn block_index(&self, ptr: *const u8) -> usize {
    (ptr as usize & (self.chunk_size() - 1)) >> self.block_log
  }

  #[inline]
  pub(crate) fn block_base(&self, chunk: NonNull<ChunkHeader>, index: usize) -> *mut u8 {
    unsafe { chunk.as_ptr().cast::<u8>().add(index << self.block_log) }
  }

  /// Address `pos` units into block `index`.
  #[inline]
  pub(crate) fn block_ptr(&self, chunk: NonNull<ChunkHeader>, index: usize, pos: u32) -> *mut u8 {
    unsafe { self.block_base(chunk, index).add((pos as usize) << self.unit_log) }
  }

  /// Address `pos` units into a big block.
  #[inline]
  pub(crate) fn big_ptr(&self, big: NonNull<BigHeader>, pos: u32) -> *mut u8 {
    unsafe { big.as_ptr().cast::<u8>().add((pos as usize) << self.unit_log) }
  }

  /// Bytes between `ptr` and the end of the block holding it.
  #[inline]
  pub(crate) fn block_room(&self, ptr: *const u8) -> usize {
    self.block_size() - (ptr as usize & (self.block_size() - 1))
  }

  /// Bytes between `ptr` and the end of the chunk-sized region holding it.
  #[inline]
  pub(crate) fn chunk_room(&self, ptr: *const u8) -> usize {
    self.chunk_size() - (ptr as usize & (self.chunk_size() - 1))
  }

  /// Resolves the region owning `ptr` by masking and reading its marker.
  ///
  /// # Safety
  /// `ptr` must point into memory this heap handed out, or be small enough
  /// to mask to null.
  pub(crate) unsafe fn resolve(&self, ptr: *const u8) -> Option<Region> {
    let base = self.region_base(ptr)?;
    let marker = unsafe { base.cast::<u32>().as_ptr().read() };
    Some(match RegionKind::from_marker(marker)? {
      RegionKind::Chunk => Region::Chunk(base.cast()),
      RegionKind::Big => Region::Big(base.cast()),
      RegionKind::Mapped => Region::Mapped(base.cast()),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  fn geometry(cfg: Config) -> Geometry {
    Geometry::new(&cfg.validate().unwrap())
  }

  #[test]
  fn default_limits() {
    let g = geometry(Config::default());
    assert_eq!(g.chunk_size(), 4 << 20);
    assert_eq!(g.blocks_per_chunk, 8);
    assert_eq!(g.block_size(), 512 << 10);
    assert_eq!(g.block_limit, 128 << 10);
    assert_eq!(g.big_limit, 1 << 20);
    assert_eq!(g.units_per_block as usize, g.block_size() / 16);
    assert!(g.block_start as usize * 16 >= size_of::<ChunkHeader>());
    assert_eq!(g.mapped_start, 16);
  }

  #[test]
  fn big_tier_disabled_collapses_limits() {
    let g = geometry(Config {
      enable_big_alloc: false,
      ..Config::default()
    });
    assert_eq!(g.big_limit, g.block_limit);
    assert_eq!(g.block_limit, 256 << 10);
  }

  #[test]
  fn smallest_blocks_still_fit_their_limit() {
    for unit_log in 3..=10 {
      let g = geometry(Config {
        alignment_log: unit_log,
        system_allocation_size_log: 17,
        blocks_per_allocation_log: 5,
        ..Config::default()
      });
      let usable = (g.units_per_block - g.block_start) as usize * g.unit();
      assert!(g.block_limit <= usable, "unit_log {unit_log}");
      assert!(g.block_limit >= g.unit());
    }
  }

  #[test]
  fn masking() {
    let g = geometry(Config::default());
    let base = 0x4000_0000usize;
    let p = (base + 3 * g.block_size() + 48) as *const u8;
    assert_eq!(g.region_base(p).unwrap().as_ptr() as usize, base);
    assert_eq!(g.block_index(p), 3);
    assert_eq!(g.block_room(p), g.block_size() - 48);
    assert!(g.region_base(16 as *const u8).is_none());
  }

  #[test]
  fn markers_round_trip_through_kind() {
    for kind in [RegionKind::Chunk, RegionKind::Big, RegionKind::Mapped] {
      assert_eq!(RegionKind::from_marker(kind.marker()), Some(kind));
    }
    assert_eq!(RegionKind::from_marker(0), None);
  }
}
