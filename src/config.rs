//! Allocator configuration.
//!
//! Values are fixed when a [`Heap`](crate::Heap) is built. The process-wide
//! heap reads overrides from `CHUNKMALLOC_*` environment variables through
//! `libc::getenv`, which does not allocate: the global heap may be the
//! global allocator, so nothing on its init path may call back into it.

use core::ffi::CStr;

use crate::error::{Error, Result};

/// Hard cap on the number of arenas a heap can hold inline.
pub const ARENA_LIMIT: usize = 128;

/// Hard cap on the chunk cache capacity.
pub const CACHE_LIMIT: usize = 64;

/// Most blocks a chunk can be divided into (`1 << 5`).
pub const MAX_BLOCKS_PER_CHUNK: usize = 32;

/// How a block's memory is scrubbed when its last reference is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReset {
  /// Zero the whole block.
  Full,
  /// Zero only the bytes handed out since the last reset.
  Used,
  /// Fill the used bytes with [`POISON_BYTE`] to expose use-after-free.
  Poison,
  /// Zero only the free-list link, leaving old contents in place.
  Header,
}

/// Byte written over released memory by [`BlockReset::Poison`].
pub const POISON_BYTE: u8 = 0xA5;

impl BlockReset {
  /// Whether memory handed out after this reset reads as zero.
  pub const fn zeroes(self) -> bool {
    matches!(self, BlockReset::Full | BlockReset::Used)
  }
}

/// User-facing allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// `log2` of the alignment of every returned pointer (3..=10).
  pub alignment_log: u8,
  /// `log2` of one chunk, the unit requested from the page source (17..=24).
  pub system_allocation_size_log: u8,
  /// Number of idle chunks kept instead of being released.
  pub cache_slots: usize,
  /// `log2` of the number of blocks per chunk (0..=5).
  pub blocks_per_allocation_log: u8,
  /// Serve mid-size requests from a shared chunk-sized big block.
  pub enable_big_alloc: bool,
  /// Fixed arena count, or negative to derive it from the CPU count.
  pub arena_count: i32,
  /// Arena count used when the CPU count is unknown.
  pub arena_count_fallback: usize,
  /// Upper bound for the derived arena count.
  pub arena_count_max: usize,
  /// Every `malloc` returns zeroed memory, and `realloc2` zeroes the uncopied tail.
  pub initialize_allocations: bool,
  /// Blocking mutex instead of a spin lock. `None` picks a mutex iff the
  /// arena count is fixed.
  pub use_thread_mutex: Option<bool>,
  /// Block scrubbing policy. `None` derives it from `initialize_allocations`.
  pub block_reset: Option<BlockReset>,
  /// Number of arenas handed a block at construction.
  pub warmup: usize,
  /// Register `after_fork` with `pthread_atfork` (process-wide heap only).
  pub register_fork_hook: bool,
  /// Register `shutdown` with `atexit` (process-wide heap only).
  pub teardown_at_exit: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      alignment_log: 4,
      system_allocation_size_log: 22,
      cache_slots: 4,
      blocks_per_allocation_log: 3,
      enable_big_alloc: true,
      arena_count: -1,
      arena_count_fallback: 8,
      arena_count_max: 64,
      initialize_allocations: false,
      use_thread_mutex: None,
      block_reset: None,
      warmup: 0,
      register_fork_hook: true,
      teardown_at_exit: false,
    }
  }
}

impl Config {
  /// Default configuration with `CHUNKMALLOC_*` environment overrides applied.
  pub fn from_env() -> Self {
    let mut cfg = Self::default();
    if let Some(v) = env_int(c"CHUNKMALLOC_ALIGN_LOG") {
      cfg.alignment_log = v.clamp(0, u8::MAX as i64) as u8;
    }
    if let Some(v) = env_int(c"CHUNKMALLOC_CHUNK_LOG") {
      cfg.system_allocation_size_log = v.clamp(0, u8::MAX as i64) as u8;
    }
    if let Some(v) = env_int(c"CHUNKMALLOC_CACHE_SLOTS") {
      cfg.cache_slots = v.max(0) as usize;
    }
    if let Some(v) = env_int(c"CHUNKMALLOC_BLOCKS_LOG") {
      cfg.blocks_per_allocation_log = v.clamp(0, u8::MAX as i64) as u8;
    }
    if let Some(v) = env_bool(c"CHUNKMALLOC_BIG_ALLOC") {
      cfg.enable_big_alloc = v;
    }
    if let Some(v) = env_int(c"CHUNKMALLOC_ARENAS") {
      cfg.arena_count = v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
    if let Some(v) = env_bool(c"CHUNKMALLOC_ZERO") {
      cfg.initialize_allocations = v;
    }
    if let Some(v) = env_bool(c"CHUNKMALLOC_MUTEX") {
      cfg.use_thread_mutex = Some(v);
    }
    if let Some(v) = env_int(c"CHUNKMALLOC_WARMUP") {
      cfg.warmup = v.max(0) as usize;
    }
    cfg
  }

  /// Puts every field [`Config::validate`] rejects back to its default,
  /// keeping the others.
  pub fn reset_invalid(mut self) -> Self {
    let defaults = Self::default();
    while let Err(Error::InvalidConfig { field, .. }) = self.validate() {
      match field {
        "alignment_log" => self.alignment_log = defaults.alignment_log,
        "system_allocation_size_log" => {
          self.system_allocation_size_log = defaults.system_allocation_size_log
        }
        "blocks_per_allocation_log" => {
          self.blocks_per_allocation_log = defaults.blocks_per_allocation_log
        }
        "cache_slots" => self.cache_slots = defaults.cache_slots,
        "arena_count_max" => self.arena_count_max = defaults.arena_count_max,
        "arena_count" => self.arena_count = defaults.arena_count,
        "block_reset" => self.block_reset = defaults.block_reset,
        _ => return defaults,
      }
    }
    self
  }

  /// Checks ranges and resolves every derived value.
  pub fn validate(&self) -> Result<Settings> {
    check("alignment_log", self.alignment_log as i64, 3, 10)?;
    check("system_allocation_size_log", self.system_allocation_size_log as i64, 17, 24)?;
    check("blocks_per_allocation_log", self.blocks_per_allocation_log as i64, 0, 5)?;
    check("cache_slots", self.cache_slots as i64, 0, CACHE_LIMIT as i64)?;
    check("arena_count_max", self.arena_count_max as i64, 1, ARENA_LIMIT as i64)?;
    if self.arena_count as i64 > ARENA_LIMIT as i64 {
      return Err(Error::InvalidConfig {
        field: "arena_count",
        value: self.arena_count as i64,
      });
    }

    let arena_count_fixed = self.arena_count >= 0;
    let arena_count = if arena_count_fixed {
      (self.arena_count as usize).max(1)
    } else {
      derive_arena_count(cpu_count(), self.arena_count_fallback, self.arena_count_max)
    };

    let block_reset = match self.block_reset {
      Some(reset) if self.initialize_allocations && !reset.zeroes() => {
        return Err(Error::InvalidConfig {
          field: "block_reset",
          value: reset as i64,
        });
      }
      Some(reset) => reset,
      None if self.initialize_allocations => BlockReset::Used,
      None if cfg!(debug_assertions) => BlockReset::Poison,
      None => BlockReset::Header,
    };

    Ok(Settings {
      alignment_log: self.alignment_log,
      chunk_log: self.system_allocation_size_log,
      cache_slots: self.cache_slots,
      blocks_log: self.blocks_per_allocation_log,
      enable_big_alloc: self.enable_big_alloc,
      arena_count,
      arena_count_fixed,
      initialize_allocations: self.initialize_allocations,
      use_thread_mutex: self.use_thread_mutex.unwrap_or(arena_count_fixed),
      block_reset,
      warmup: self.warmup.min(arena_count),
      register_fork_hook: self.register_fork_hook,
      teardown_at_exit: self.teardown_at_exit,
    })
  }
}

/// Configuration with every derived value resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
  pub alignment_log: u8,
  pub chunk_log: u8,
  pub cache_slots: usize,
  pub blocks_log: u8,
  pub enable_big_alloc: bool,
  pub arena_count: usize,
  /// `false` when `arena_count` was derived from the CPU count.
  pub arena_count_fixed: bool,
  pub initialize_allocations: bool,
  pub use_thread_mutex: bool,
  pub block_reset: BlockReset,
  pub warmup: usize,
  pub register_fork_hook: bool,
  pub teardown_at_exit: bool,
}

/// `cores * 2 + 2`, clamped to `[1, max]`; `fallback` when `cores` is unknown.
pub fn derive_arena_count(cores: Option<usize>, fallback: usize, max: usize) -> usize {
  let max = max.clamp(1, ARENA_LIMIT);
  match cores {
    Some(n) if n > 0 => n.saturating_mul(2).saturating_add(2).clamp(1, max),
    _ => fallback.clamp(1, max),
  }
}

fn check(field: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
  if (min..=max).contains(&value) {
    Ok(())
  } else {
    Err(Error::InvalidConfig { field, value })
  }
}

fn cpu_count() -> Option<usize> {
  let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  (n > 0).then_some(n as usize)
}

fn env_bytes(name: &CStr) -> Option<&'static [u8]> {
  let raw = unsafe { libc::getenv(name.as_ptr()) };
  if raw.is_null() {
    return None;
  }
  // The environment outlives the heap's init path; the bytes are parsed immediately.
  Some(unsafe { CStr::from_ptr(raw) }.to_bytes())
}

fn env_int(name: &CStr) -> Option<i64> {
  env_bytes(name).and_then(parse_int)
}

fn env_bool(name: &CStr) -> Option<bool> {
  env_bytes(name).and_then(parse_bool)
}

fn parse_int(raw: &[u8]) -> Option<i64> {
  let s = core::str::from_utf8(raw).ok()?;
  s.trim().parse().ok()
}

fn parse_bool(raw: &[u8]) -> Option<bool> {
  match raw {
    b"1" | b"true" | b"yes" | b"on" | b"TRUE" | b"YES" | b"ON" => Some(true),
    b"0" | b"false" | b"no" | b"off" | b"FALSE" | b"NO" | b"OFF" => Some(false),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_validate() {
    let s = Config::default().validate().unwrap();
    assert_eq!(s.alignment_log, 4);
    assert_eq!(s.chunk_log, 22);
    assert!(!s.arena_count_fixed);
    assert!(!s.use_thread_mutex);
    assert!(s.arena_count >= 1 && s.arena_count <= 64);
  }

  #[test]
  fn fixed_arena_count_prefers_mutex() {
    let cfg = Config { arena_count: 3, ..Config::default() };
    let s = cfg.validate().unwrap();
    assert_eq!(s.arena_count, 3);
    assert!(s.arena_count_fixed);
    assert!(s.use_thread_mutex);

    let cfg = Config { arena_count: 0, ..Config::default() };
    assert_eq!(cfg.validate().unwrap().arena_count, 1);
  }

  #[test]
  fn out_of_range_values_are_rejected() {
    let cfg = Config { alignment_log: 2, ..Config::default() };
    assert_eq!(
      cfg.validate(),
      Err(Error::InvalidConfig { field: "alignment_log", value: 2 })
    );
    let cfg = Config { system_allocation_size_log: 25, ..Config::default() };
    assert!(cfg.validate().is_err());
    let cfg = Config { blocks_per_allocation_log: 6, ..Config::default() };
    assert!(cfg.validate().is_err());
    let cfg = Config { cache_slots: CACHE_LIMIT + 1, ..Config::default() };
    assert!(cfg.validate().is_err());
    let cfg = Config { arena_count: 1000, ..Config::default() };
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn zeroing_requires_a_zeroing_reset() {
    let cfg = Config {
      initialize_allocations: true,
      block_reset: Some(BlockReset::Header),
      ..Config::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = Config { initialize_allocations: true, ..Config::default() };
    assert_eq!(cfg.validate().unwrap().block_reset, BlockReset::Used);
  }

  #[test]
  fn reset_invalid_keeps_the_valid_overrides() {
    let cfg = Config {
      alignment_log: 12,
      cache_slots: CACHE_LIMIT + 5,
      blocks_per_allocation_log: 2,
      initialize_allocations: true,
      block_reset: Some(BlockReset::Poison),
      ..Config::default()
    }
    .reset_invalid();
    assert_eq!(cfg.alignment_log, 4);
    assert_eq!(cfg.cache_slots, 4);
    assert_eq!(cfg.block_reset, None);
    assert_eq!(cfg.blocks_per_allocation_log, 2);
    assert!(cfg.initialize_allocations);
    assert!(cfg.validate().is_ok());

    let fine = Config { warmup: 3, ..Config::default() };
    assert_eq!(fine.reset_invalid(), fine);
  }

  #[test]
  fn arena_count_derivation() {
    assert_eq!(derive_arena_count(Some(4), 8, 64), 10);
    assert_eq!(derive_arena_count(Some(100), 8, 64), 64);
    assert_eq!(derive_arena_count(None, 8, 64), 8);
    assert_eq!(derive_arena_count(Some(0), 0, 64), 1);
  }

  #[test]
  fn env_value_parsing() {
    assert_eq!(parse_int(b" 12 "), Some(12));
    assert_eq!(parse_int(b"-1"), Some(-1));
    assert_eq!(parse_int(b"x"), None);
    assert_eq!(parse_bool(b"on"), Some(true));
    assert_eq!(parse_bool(b"0"), Some(false));
    assert_eq!(parse_bool(b"maybe"), None);
  }
}
