#![forbid(unsafe_code)]
//! Error types for the WireFS client data-staging layer.
//!
//! # Error taxonomy
//!
//! | Class | Variant | Behavior |
//! |-------|---------|----------|
//! | Resource exhaustion | `Exhausted` | Transient; callers retry after backoff |
//! | Fetch failure | `Poisoned` | The affected page is excluded from lookups; the waiting request fails |
//! | Dispatch failure | `FlushFailed` | A coalesce group exhausted its retry budget; every member request fails |
//! | Transport | `Transport` | A single wire-level dispatch or completion error |
//! | Shutdown | `Shutdown` | The flush engine is draining; no new work accepted |
//!
//! Invariant violations (reference underflow, double scheduling, double free)
//! are **not** errors: they indicate memory-safety-relevant corruption and
//! fail loudly via `assert!`/`panic!` in the owning crate.
//!
//! Every variant maps to exactly one POSIX errno via [`WfsError::to_errno`]
//! for the FUSE-style front end that consumes this layer. The mapping is
//! exhaustive — adding a variant without an errno is a compile error.

use thiserror::Error;

/// Unified error type surfaced by the staging layer.
#[derive(Debug, Error)]
pub enum WfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level dispatch or completion failure for a single request.
    #[error("transport error: {0}")]
    Transport(String),

    /// A coalesce group could not be delivered within its retry budget.
    ///
    /// Affects every member request of the group atomically; surfaced to
    /// callers blocked in flush/fsync/close.
    #[error("write-back flush failed after {retries} retries: {detail}")]
    FlushFailed { retries: u32, detail: String },

    /// The cached page at this bmap-relative offset experienced an
    /// unrecoverable fetch error and was removed from circulation.
    #[error("page at offset {offset} poisoned by fetch error: {detail}")]
    Poisoned { offset: u32, detail: String },

    /// The buffer pool is exhausted and reclamation yielded nothing in time.
    /// Transient: reads must retry, writes may retry after backoff.
    #[error("buffer pool exhausted")]
    Exhausted,

    /// A blocking wait on request completion exceeded its deadline.
    #[error("timed out waiting for I/O completion")]
    TimedOut,

    /// Request range falls outside the bmap or has zero length.
    #[error("invalid I/O range: offset={offset} len={len}")]
    InvalidRange { offset: u32, len: u32 },

    /// The flush engine is shutting down.
    #[error("staging layer is shutting down")]
    Shutdown,
}

impl WfsError {
    /// Convert into a POSIX errno suitable for FUSE replies.
    ///
    /// Exhaustive by design: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Transport(_) | Self::FlushFailed { .. } | Self::Poisoned { .. } => libc::EIO,
            Self::Exhausted => libc::EAGAIN,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::InvalidRange { .. } => libc::EINVAL,
            Self::Shutdown => libc::ESHUTDOWN,
        }
    }

    /// Whether a caller may reasonably retry the operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted | Self::TimedOut)
    }
}

impl Clone for WfsError {
    fn clone(&self) -> Self {
        // std::io::Error is not Clone; preserve kind and text.
        match self {
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::Transport(s) => Self::Transport(s.clone()),
            Self::FlushFailed { retries, detail } => Self::FlushFailed {
                retries: *retries,
                detail: detail.clone(),
            },
            Self::Poisoned { offset, detail } => Self::Poisoned {
                offset: *offset,
                detail: detail.clone(),
            },
            Self::Exhausted => Self::Exhausted,
            Self::TimedOut => Self::TimedOut,
            Self::InvalidRange { offset, len } => Self::InvalidRange {
                offset: *offset,
                len: *len,
            },
            Self::Shutdown => Self::Shutdown,
        }
    }
}

/// Result alias using `WfsError`.
pub type Result<T> = std::result::Result<T, WfsError>;
