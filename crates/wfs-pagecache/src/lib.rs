#![forbid(unsafe_code)]
//! Client-side data staging for WireFS: a per-bmap page cache with
//! write-back flushing.
//!
//! Files are addressed in fixed-size bmaps (128 MiB by default). Each
//! [`Bmap`] caches page-sized buffers drawn from one global
//! [`PagePool`]; reads and writes pin the pages they cover through an
//! [`IoRequest`]. Dirty requests accumulate on their bmap until the
//! [`FlushEngine`] coalesces adjacent extents and pushes them over a
//! [`Transport`] in MTU-bounded write RPCs. A background
//! [`FlushDaemon`] runs passes periodically; `flush_now` and
//! `quiesce_wait` give callers synchronous control.
//!
//! # Lock order
//!
//! A bmap's cache lock is taken before any of its entry locks. The
//! pool lock and the engine's queue and inflight locks are leaves and
//! never nest inside either. Request locks never wrap an entry or
//! cache lock acquisition.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wfs_pagecache::{ClientCache, MemTransport, Transport};
//! use wfs_types::{CacheParams, FileId, IosId};
//!
//! let transport = MemTransport::new();
//! let cache = ClientCache::new(
//!     CacheParams::default(),
//!     Arc::clone(&transport) as Arc<dyn Transport>,
//! );
//! let bmap = cache.bmap(FileId(1), 0, IosId(1));
//!
//! let req = cache.write(&bmap, 100, b"hello").unwrap();
//! cache.flush_now(&[req], Duration::from_secs(5)).unwrap();
//!
//! let mut back = [0u8; 5];
//! cache.read(&bmap, 100, &mut back).unwrap();
//! assert_eq!(&back, b"hello");
//! ```

mod bmap;
mod entry;
mod flush;
mod pool;
mod request;
mod stats;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

pub use bmap::Bmap;
pub use entry::{EntryState, PageEntry, RefKind};
pub use flush::{start_flush_daemon, FlushDaemon, FlushDaemonConfig, FlushEngine};
pub use pool::PagePool;
pub use request::{IoKind, IoRequest, ReqState};
pub use stats::{CacheStats, StatsSnapshot};
pub use transport::{
    IoVec, MemTransport, ReadCompletion, Transport, WireRequest, WriteCompletion,
};

pub use wfs_error::{Result, WfsError};
pub use wfs_types::{BmapId, ByteOffset, CacheParams, FileId, IosId, PageOffset};

/// Top-level handle tying the pool, the flush engine, and the bmap
/// table together.
pub struct ClientCache {
    params: Arc<CacheParams>,
    stats: Arc<CacheStats>,
    pool: Arc<PagePool>,
    engine: Arc<FlushEngine>,
    bmaps: Mutex<HashMap<BmapId, Arc<Bmap>>>,
}

impl ClientCache {
    #[must_use]
    pub fn new(params: CacheParams, transport: Arc<dyn Transport>) -> Arc<Self> {
        let params = Arc::new(params);
        let stats = Arc::new(CacheStats::default());
        let pool = PagePool::new(
            params.page_size as usize,
            params.pool_pages,
            Arc::clone(&stats),
        );
        let engine = FlushEngine::new(Arc::clone(&params), transport, Arc::clone(&stats));
        debug!(
            target: "wfs::cache",
            page_size = params.page_size,
            bmap_size = params.bmap_size,
            pool_pages = params.pool_pages,
            "client cache created"
        );
        Arc::new(Self {
            params,
            stats,
            pool,
            engine,
            bmaps: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<FlushEngine> {
        &self.engine
    }

    /// Get or create the cache for bmap `index` of `file`, targeting
    /// I/O server `target`. New bmaps register with the pool's reaper.
    pub fn bmap(&self, file: FileId, index: u32, target: IosId) -> Arc<Bmap> {
        let id = BmapId::new(file, index);
        let mut bmaps = self.bmaps.lock();
        if let Some(bmap) = bmaps.get(&id) {
            return Arc::clone(bmap);
        }
        let bmap = Bmap::new(
            id,
            target,
            Arc::clone(&self.params),
            Arc::clone(&self.pool),
            Arc::clone(&self.stats),
            Arc::clone(&self.engine),
        );
        self.pool.register_source(&bmap);
        bmaps.insert(id, Arc::clone(&bmap));
        bmap
    }

    /// Drop a clean bmap from the table, releasing its cached pages
    /// once all outstanding requests let go. Returns false if the bmap
    /// still has queued writes.
    pub fn release_bmap(&self, id: BmapId) -> bool {
        let mut bmaps = self.bmaps.lock();
        let Some(bmap) = bmaps.get(&id) else {
            return true;
        };
        if bmap.pending_writes() > 0 {
            return false;
        }
        bmaps.remove(&id);
        true
    }

    /// Pin pages for a range without moving data yet. The caller
    /// follows up with `copy_in` or `copy_out` on the request.
    pub fn build_request(
        &self,
        bmap: &Arc<Bmap>,
        off: u32,
        len: u32,
        kind: IoKind,
    ) -> Result<Arc<IoRequest>> {
        if self.engine.is_shutdown() {
            return Err(WfsError::Shutdown);
        }
        IoRequest::build(bmap, off, len, kind)
    }

    /// Stage a write: pin, merge, and queue for flushing. Returns the
    /// request so the caller can wait on or force it.
    pub fn write(&self, bmap: &Arc<Bmap>, off: u32, data: &[u8]) -> Result<Arc<IoRequest>> {
        let req = self.build_request(bmap, off, data.len() as u32, IoKind::Write)?;
        req.copy_in(data)?;
        Ok(req)
    }

    /// Read a range through the cache, fetching missing pages.
    pub fn read(&self, bmap: &Arc<Bmap>, off: u32, buf: &mut [u8]) -> Result<()> {
        let req = self.build_request(bmap, off, buf.len() as u32, IoKind::Read)?;
        req.copy_out(buf)
    }

    /// Force the given requests out and wait for their completion.
    pub fn flush_now(&self, reqs: &[Arc<IoRequest>], timeout: Duration) -> Result<()> {
        self.engine.flush_now(reqs, timeout)
    }

    /// Spawn the background flush thread for this cache.
    #[must_use]
    pub fn start_flush_daemon(&self, config: FlushDaemonConfig) -> FlushDaemon {
        start_flush_daemon(Arc::clone(&self.engine), config)
    }
}
