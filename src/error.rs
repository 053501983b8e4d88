use thiserror::Error;

/// Failures surfaced by [`Heap`](crate::Heap) operations and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  /// The page source could not satisfy the request at any tier.
  #[error("out of memory while allocating {requested} bytes")]
  OutOfMemory { requested: usize },

  /// `count * size` does not fit in `usize`.
  #[error("allocation size overflow: {count} x {size}")]
  SizeOverflow { count: usize, size: usize },

  /// The pointer does not resolve to a region owned by this heap.
  #[error("pointer {addr:#x} is not owned by this heap")]
  InvalidPointer { addr: usize },

  /// Requested alignment cannot be honoured.
  #[error("unsupported alignment {align}")]
  UnsupportedAlignment { align: usize },

  /// A configuration value is out of range.
  #[error("invalid configuration: {field} = {value}")]
  InvalidConfig { field: &'static str, value: i64 },

  /// The process-wide heap already exists.
  #[error("global heap already initialized")]
  AlreadyInitialized,
}

impl Error {
  /// The `errno` value a C caller expects for this failure.
  pub fn errno(self) -> i32 {
    match self {
      Error::UnsupportedAlignment { .. } | Error::InvalidConfig { .. } => libc::EINVAL,
      Error::InvalidPointer { .. } => libc::EINVAL,
      _ => libc::ENOMEM,
    }
  }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
