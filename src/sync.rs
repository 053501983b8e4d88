//! Locks that can be forcibly re-initialised after `fork`.
//!
//! A child process inherits lock words from whichever parent threads held
//! them, and those threads do not exist in the child. `reinit` overwrites the
//! lock with a fresh, unlocked one instead of trying to unlock it, which for
//! `parking_lot` could touch parking state of threads that were left behind.

use core::{
  cell::UnsafeCell,
  hint,
  marker::PhantomData,
  ops::{Deref, DerefMut},
  ptr,
  sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::lock_api::RawMutex as _;

// =============================================================================
// Spin lock
// =============================================================================

pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }
}

// =============================================================================
// Raw lock (spin or blocking)
// =============================================================================

enum LockImpl {
  Spin(SpinLock),
  Mutex(parking_lot::RawMutex),
}

impl LockImpl {
  const fn new(blocking: bool) -> Self {
    if blocking {
      LockImpl::Mutex(parking_lot::RawMutex::INIT)
    } else {
      LockImpl::Spin(SpinLock::new())
    }
  }
}

/// A spin lock or a blocking mutex, picked once at construction.
pub(crate) struct RawLock {
  inner: UnsafeCell<LockImpl>,
}

unsafe impl Sync for RawLock {}
unsafe impl Send for RawLock {}

impl RawLock {
  pub(crate) const fn new(blocking: bool) -> Self {
    Self {
      inner: UnsafeCell::new(LockImpl::new(blocking)),
    }
  }

  #[inline]
  fn imp(&self) -> &LockImpl {
    // Only `reinit` writes through the cell, and it requires exclusive use.
    unsafe { &*self.inner.get() }
  }

  /// `true` when waiting blocks the thread instead of spinning.
  pub(crate) fn is_blocking(&self) -> bool {
    matches!(self.imp(), LockImpl::Mutex(_))
  }

  #[inline]
  pub(crate) fn lock(&self) {
    match self.imp() {
      LockImpl::Spin(s) => s.lock(),
      LockImpl::Mutex(m) => m.lock(),
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    match self.imp() {
      LockImpl::Spin(s) => s.try_lock(),
      LockImpl::Mutex(m) => m.try_lock(),
    }
  }

  /// # Safety
  /// The lock must be held by the current context.
  #[inline]
  pub(crate) unsafe fn unlock(&self) {
    match self.imp() {
      LockImpl::Spin(s) => s.unlock(),
      LockImpl::Mutex(m) => unsafe { m.unlock() },
    }
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    match self.imp() {
      LockImpl::Spin(s) => s.is_locked(),
      LockImpl::Mutex(m) => m.is_locked(),
    }
  }

  /// Replaces the lock with a fresh unlocked one of the same kind.
  ///
  /// # Safety
  /// No other thread may be using the lock: the intended caller is the only
  /// thread of a freshly forked child.
  pub(crate) unsafe fn reinit(&self) {
    let blocking = self.is_blocking();
    unsafe { ptr::write(self.inner.get(), LockImpl::new(blocking)) };
  }
}

// =============================================================================
// Locked data
// =============================================================================

/// Data guarded by a [`RawLock`].
pub(crate) struct Locked<T> {
  lock: RawLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}
unsafe impl<T: Send> Send for Locked<T> {}

impl<T> Locked<T> {
  pub(crate) const fn new(data: T, blocking: bool) -> Self {
    Self {
      lock: RawLock::new(blocking),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> Guard<'_, T> {
    self.lock.lock();
    Guard::new(self)
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> Option<Guard<'_, T>> {
    self.lock.try_lock().then(|| Guard::new(self))
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    self.lock.is_locked()
  }

  pub(crate) fn is_blocking(&self) -> bool {
    self.lock.is_blocking()
  }

  pub(crate) fn get_mut(&mut self) -> &mut T {
    self.data.get_mut()
  }

  /// # Safety
  /// See [`RawLock::reinit`].
  pub(crate) unsafe fn reinit(&self) {
    unsafe { self.lock.reinit() };
  }
}

pub(crate) struct Guard<'a, T> {
  owner: &'a Locked<T>,
  _not_send: PhantomData<*mut ()>,
}

impl<'a, T> Guard<'a, T> {
  fn new(owner: &'a Locked<T>) -> Self {
    Self {
      owner,
      _not_send: PhantomData,
    }
  }
}

impl<T> Deref for Guard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.owner.data.get() }
  }
}

impl<T> DerefMut for Guard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.owner.data.get() }
  }
}

impl<T> Drop for Guard<'_, T> {
  fn drop(&mut self) {
    unsafe { self.owner.lock.unlock() };
  }
}
