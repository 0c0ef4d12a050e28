#![forbid(unsafe_code)]
//! Shared identifiers and cache geometry for the WireFS client.
//!
//! Everything here is a plain value type: newtyped identifiers so byte
//! offsets, page offsets, and bmap indices cannot be mixed up, plus
//! [`CacheParams`], the validated geometry that the page cache, the flush
//! engine, and the transport all agree on.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Global file identifier, assigned by the metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

/// One bmap: a fixed-size block-range of a file, the unit of leasing and
/// caching. `index` counts bmap-sized strides from the start of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BmapId {
    pub file: FileId,
    pub index: u32,
}

impl BmapId {
    #[must_use]
    pub fn new(file: FileId, index: u32) -> Self {
        Self { file, index }
    }
}

/// Storage-node descriptor handed to the transport when dispatching I/O.
///
/// Replica selection is the lease layer's problem; the cache only carries the
/// descriptor through to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IosId(pub u32);

/// Absolute byte offset within a file (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Bmap-relative, page-aligned offset of a cache entry.
///
/// Constructed only through [`CacheParams::page_floor`], so holding one is
/// proof of alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageOffset(u32);

impl PageOffset {
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Reasons a [`CacheParams`] construction can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated cache geometry.
///
/// Shared (behind an `Arc`) by every bmap page cache, the buffer pool, and
/// the flush engine so that all byte math agrees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParams {
    /// Cache page size in bytes. Power of two.
    pub page_size: u32,
    /// Bmap size in bytes. Multiple of the page size.
    pub bmap_size: u32,
    /// Transport single-request payload bound, in bytes.
    pub mtu: u32,
    /// Minimum coalesced size considered an efficient write RPC.
    pub min_coalesce: u32,
    /// Age after which a queued write request is flushed regardless of size.
    pub max_age: Duration,
    /// Buffer pool capacity, in pages.
    pub pool_pages: usize,
    /// Cap on concurrently in-flight write RPCs.
    pub max_inflight_rpcs: usize,
    /// Bounded retries for a failed coalesce-group dispatch before the
    /// group's requests are hard-failed.
    pub max_dispatch_retries: u32,
}

impl CacheParams {
    /// Construct with validation.
    pub fn new(
        page_size: u32,
        bmap_size: u32,
        mtu: u32,
        pool_pages: usize,
    ) -> Result<Self, ParamError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(ParamError::Invalid {
                field: "page_size",
                reason: "must be a nonzero power of two",
            });
        }
        if bmap_size == 0 || bmap_size % page_size != 0 {
            return Err(ParamError::Invalid {
                field: "bmap_size",
                reason: "must be a nonzero multiple of page_size",
            });
        }
        if mtu < page_size {
            return Err(ParamError::Invalid {
                field: "mtu",
                reason: "must be at least one page",
            });
        }
        if pool_pages == 0 {
            return Err(ParamError::Invalid {
                field: "pool_pages",
                reason: "must be nonzero",
            });
        }
        Ok(Self {
            page_size,
            bmap_size,
            mtu,
            min_coalesce: mtu,
            max_age: Duration::from_millis(100),
            pool_pages,
            max_inflight_rpcs: 128,
            max_dispatch_retries: 3,
        })
    }

    /// Round a bmap-relative offset down to its page boundary.
    #[must_use]
    pub fn page_floor(&self, off: u32) -> PageOffset {
        PageOffset(off & !(self.page_size - 1))
    }

    /// Round a bmap-relative offset up to the next page boundary.
    #[must_use]
    pub fn page_ceil(&self, off: u32) -> u32 {
        let mask = self.page_size - 1;
        (off + mask) & !mask
    }

    /// Whether `off` sits on a page boundary.
    #[must_use]
    pub fn is_page_aligned(&self, off: u32) -> bool {
        off & (self.page_size - 1) == 0
    }

    /// The page-aligned offsets spanned by `[off, off + len)`.
    pub fn pages_spanning(&self, off: u32, len: u32) -> impl Iterator<Item = PageOffset> + '_ {
        let first = self.page_floor(off).get();
        let end = self.page_ceil(off + len);
        (first..end)
            .step_by(self.page_size as usize)
            .map(PageOffset)
    }

    /// Number of pages spanned by `[off, off + len)`.
    #[must_use]
    pub fn page_count(&self, off: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let first = self.page_floor(off).get();
        let end = self.page_ceil(off + len);
        ((end - first) / self.page_size) as usize
    }

    /// Absolute file offset of a bmap-relative position.
    #[must_use]
    pub fn absolute(&self, bmap: BmapId, off: u32) -> ByteOffset {
        ByteOffset(u64::from(bmap.index) * u64::from(self.bmap_size) + u64::from(off))
    }
}

impl Default for CacheParams {
    /// 4 KiB pages, 128 MiB bmaps, 1 MiB MTU, 16 Ki pool pages.
    fn default() -> Self {
        Self::new(4096, 128 * 1024 * 1024, 1024 * 1024, 16384)
            .expect("default geometry is valid")
    }
}
