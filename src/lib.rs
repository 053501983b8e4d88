//! `chunkmalloc`: a chunk/block slab allocator.
//!
//! Small requests are bump-allocated from blocks held by per-thread arenas,
//! mid-size requests from one shared big block, and large ones get their own
//! mapping. [`Heap`] is one allocator instance; the free functions of this
//! module drive a lazily built process-wide heap, which [`Allocator`] exposes
//! as a `GlobalAlloc`.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};
use std::sync::OnceLock;

mod arena;
mod big;
mod block;
mod chunk;
pub mod config;
pub mod error;
mod heap;
mod layout;
pub mod pages;
mod stats;
mod sync;

pub use config::{BlockReset, Config, Settings};
pub use error::{Error, Result};
pub use heap::{Heap, zero_size_ptr};
pub use pages::{OsPages, PAGE_SIZE, PageSource};
pub use stats::{ArenaSnapshot, BigSnapshot, Snapshot};

// =============================================================================
// Process-wide heap
// =============================================================================

/// Page source of the process-wide heap.
pub type SystemPages = &'static dyn PageSource;

static OS_PAGES: OsPages = OsPages;
static PAGE_HOOKS: OnceLock<SystemPages> = OnceLock::new();
static GLOBAL: OnceLock<Heap<SystemPages>> = OnceLock::new();
static HOOKS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Replaces the OS page hooks of the process-wide heap.
///
/// Must run before the first allocation through this module; afterwards the
/// heap already owns memory from the previous source.
pub fn install_page_source(source: &'static dyn PageSource) -> Result<()> {
  if GLOBAL.get().is_some() {
    return Err(Error::AlreadyInitialized);
  }
  PAGE_HOOKS.set(source).map_err(|_| Error::AlreadyInitialized)
}

#[inline]
fn global() -> &'static Heap<SystemPages> {
  match GLOBAL.get() {
    Some(heap) => heap,
    None => init_global(),
  }
}

// The heap may be the global allocator, so nothing in here may allocate.
#[cold]
fn init_global() -> &'static Heap<SystemPages> {
  let heap = GLOBAL.get_or_init(|| {
    let pages: SystemPages = *PAGE_HOOKS.get_or_init(|| &OS_PAGES);
    // A rejected environment override falls back to that field's default.
    match Config::from_env().reset_invalid().validate() {
      Ok(settings) => Heap::with_settings(settings, pages),
      Err(err) => panic!("chunkmalloc: {err}"),
    }
  });

  // Registration may itself allocate, which re-enters here and must not
  // register twice.
  if !HOOKS_REGISTERED.swap(true, Ordering::AcqRel) {
    register_hooks(heap.settings());
  }
  heap
}

unsafe extern "C" fn fork_child() {
  unsafe { after_fork() };
}

extern "C" fn at_exit() {
  shutdown();
}

fn register_hooks(settings: &Settings) {
  if settings.register_fork_hook && unsafe { libc::pthread_atfork(None, None, Some(fork_child)) } != 0 {
    log::warn!("chunkmalloc: pthread_atfork failed; call after_fork() in forked children");
  }
  if settings.teardown_at_exit && unsafe { libc::atexit(at_exit) } != 0 {
    log::warn!("chunkmalloc: atexit failed; heap will not be torn down at exit");
  }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_errno(code: i32) {
  #[cfg(target_os = "linux")]
  let slot = unsafe { libc::__errno_location() };
  #[cfg(target_os = "android")]
  let slot = unsafe { libc::__errno() };
  unsafe { *slot = code };
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_errno(code: i32) {
  unsafe { *libc::__error() = code };
}

#[cfg(not(any(
  target_os = "linux",
  target_os = "android",
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd"
)))]
fn set_errno(_code: i32) {}

/// Null on failure, with `errno` set the way a C caller expects.
#[inline]
fn or_null(res: Result<NonNull<u8>>) -> *mut u8 {
  match res {
    Ok(ptr) => ptr.as_ptr(),
    Err(err) => {
      set_errno(err.errno());
      null_mut()
    }
  }
}

/// See [`Heap::malloc`].
pub fn malloc(size: usize) -> *mut u8 {
  or_null(global().malloc(size))
}

/// See [`Heap::calloc`].
pub fn calloc(count: usize, size: usize) -> *mut u8 {
  or_null(global().calloc(count, size))
}

/// See [`Heap::realloc`]. On failure `ptr` stays valid.
///
/// # Safety
/// `ptr` must be null, the zero-size sentinel, or a live pointer returned by
/// this module. When a different pointer comes back, `ptr` is freed.
pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
  or_null(unsafe { global().realloc(ptr, new_size) })
}

/// See [`Heap::realloc2`]. On failure `ptr` stays valid.
///
/// # Safety
/// Same as [`realloc`].
pub unsafe fn realloc2(ptr: *mut u8, new_size: usize, copy_len: usize) -> *mut u8 {
  or_null(unsafe { global().realloc2(ptr, new_size, copy_len) })
}

/// See [`Heap::free`].
///
/// # Safety
/// `ptr` must be null, the zero-size sentinel, or a live pointer returned by
/// this module, and must not be used afterwards.
pub unsafe fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  unsafe { global().free(ptr) };
}

/// See [`Heap::mmap_alloc`].
pub fn mmap_alloc(size: usize) -> *mut u8 {
  or_null(global().mmap_alloc(size))
}

/// Resets every lock of the process-wide heap in a forked child. Registered
/// with `pthread_atfork` unless the configuration opts out.
///
/// # Safety
/// See [`Heap::after_fork`].
pub unsafe fn after_fork() {
  if let Some(heap) = GLOBAL.get() {
    unsafe { heap.after_fork() };
  }
}

/// Tears the process-wide heap down (see [`Heap::teardown`]). Pointers it
/// handed out must not be used afterwards.
pub fn shutdown() {
  if let Some(heap) = GLOBAL.get() {
    heap.teardown();
  }
}

/// See [`Heap::snapshot`].
pub fn snapshot() -> Snapshot {
  global().snapshot()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The process-wide heap as a Rust global allocator.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let heap = global();
    let res = if layout.align() <= heap.alignment() {
      heap.malloc(layout.size())
    } else {
      heap.malloc_aligned(layout.size(), layout.align())
    };
    res.map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free(ptr) };
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let heap = global();
    if layout.align() <= heap.alignment() {
      return heap.calloc(1, layout.size()).map_or(null_mut(), NonNull::as_ptr);
    }
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let heap = global();
    let keep = layout.size().min(new_size);
    if layout.align() <= heap.alignment() {
      return unsafe { heap.realloc2(ptr, new_size, keep) }.map_or(null_mut(), NonNull::as_ptr);
    }

    // Padded slices cannot grow in place.
    let fresh = unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    if !fresh.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, keep);
        self.dealloc(ptr, layout);
      }
    }
    fresh
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use super::{global, or_null};

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    super::malloc(size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    super::calloc(nmemb, size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { super::realloc(ptr, size) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { super::free(ptr) };
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
      return libc::EINVAL;
    }
    match global().malloc_aligned(size, alignment) {
      Ok(ptr) => {
        unsafe { *memptr = ptr.as_ptr() };
        0
      }
      Err(err) => err.errno(),
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    or_null(global().malloc_aligned(size, alignment))
  }
}
