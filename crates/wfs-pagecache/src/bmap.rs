//! Per-bmap page cache.
//!
//! Each bmap owns a sorted page index, an LRU of idle-but-cached
//! entries, and two request queues: `new` holds dirty write requests
//! not yet picked up by a flush pass, `pndg` holds requests whose
//! RPCs are outstanding. `pending_writes` always equals the sum of the
//! two queue lengths; it reaches zero exactly when the bmap is clean,
//! which is what `quiesce_wait` blocks on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use wfs_error::{Result, WfsError};
use wfs_types::{BmapId, CacheParams, IosId, PageOffset};

use crate::request::IoRequest;
use crate::entry::{EntryState, PageEntry, RefKind};
use crate::flush::FlushEngine;
use crate::pool::{PageBuf, PagePool};
use crate::stats::CacheStats;

pub(crate) struct PcInner {
    pub(crate) index: BTreeMap<u32, Arc<PageEntry>>,
    /// Idle entries, oldest at the front. Every member is also in the
    /// index with zero references.
    pub(crate) lru: Vec<Arc<PageEntry>>,
    pub(crate) new_reqs: Vec<Arc<IoRequest>>,
    pub(crate) pndg_reqs: Vec<Arc<IoRequest>>,
    pub(crate) pending_writes: usize,
    /// True while the bmap sits on (or is being processed off) the
    /// flush engine's work queue.
    flush_queued: bool,
}

impl PcInner {
    fn check_dirty_invariant(&self) {
        debug_assert_eq!(
            self.pending_writes,
            self.new_reqs.len() + self.pndg_reqs.len(),
            "pending_writes out of step with queues"
        );
    }
}

/// One 128 MiB-aligned region of a file, with its page cache.
pub struct Bmap {
    id: BmapId,
    target: IosId,
    pub(crate) params: Arc<CacheParams>,
    pub(crate) pool: Arc<PagePool>,
    pub(crate) stats: Arc<CacheStats>,
    pub(crate) engine: Arc<FlushEngine>,
    pub(crate) pc: Mutex<PcInner>,
    quiesce: Condvar,
    error: Mutex<Option<WfsError>>,
}

enum LookupAction {
    Hit { was_on_lru: bool },
    EvictPoisoned(Option<PageBuf>),
    SpinPoisoned,
}

impl Bmap {
    pub(crate) fn new(
        id: BmapId,
        target: IosId,
        params: Arc<CacheParams>,
        pool: Arc<PagePool>,
        stats: Arc<CacheStats>,
        engine: Arc<FlushEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            target,
            params,
            pool,
            stats,
            engine,
            pc: Mutex::new(PcInner {
                index: BTreeMap::new(),
                lru: Vec::new(),
                new_reqs: Vec::new(),
                pndg_reqs: Vec::new(),
                pending_writes: 0,
                flush_queued: false,
            }),
            quiesce: Condvar::new(),
            error: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> BmapId {
        self.id
    }

    #[must_use]
    pub fn target(&self) -> IosId {
        self.target
    }

    /// Find or create the entry for `off`, taking a reference of
    /// `kind`. Returns the entry and whether this caller created it;
    /// the creator is responsible for making the page `DataReady`.
    ///
    /// The buffer for a new entry is allocated with the cache lock
    /// dropped, since allocation can block on the pool and reap pages
    /// from this very bmap; the index is re-checked afterwards.
    pub(crate) fn lookup_or_create(
        self: &Arc<Self>,
        off: PageOffset,
        kind: RefKind,
    ) -> Result<(Arc<PageEntry>, bool)> {
        let mut spare: Option<PageBuf> = None;
        loop {
            let mut pc = self.pc.lock();
            if let Some(e) = pc.index.get(&off.get()).cloned() {
                let action = {
                    let mut g = e.inner.lock();
                    if g.state == EntryState::Poisoned {
                        if g.pinned() {
                            LookupAction::SpinPoisoned
                        } else {
                            LookupAction::EvictPoisoned(g.buf.take())
                        }
                    } else {
                        PageEntry::ref_add(&mut g, kind);
                        LookupAction::Hit { was_on_lru: std::mem::replace(&mut g.on_lru, false) }
                    }
                };
                match action {
                    LookupAction::Hit { was_on_lru } => {
                        if was_on_lru {
                            pc.lru.retain(|x| !Arc::ptr_eq(x, &e));
                        }
                        drop(pc);
                        if let Some(buf) = spare {
                            self.pool.free(buf);
                        }
                        CacheStats::bump(&self.stats.entry_hits);
                        return Ok((e, false));
                    }
                    LookupAction::EvictPoisoned(buf) => {
                        pc.index.remove(&off.get());
                        pc.lru.retain(|x| !Arc::ptr_eq(x, &e));
                        drop(pc);
                        trace!(target: "wfs::bmap", off = off.get(), "evicted poisoned page");
                        if let Some(buf) = buf {
                            self.pool.free(buf);
                        }
                        continue;
                    }
                    LookupAction::SpinPoisoned => {
                        drop(pc);
                        std::thread::yield_now();
                        continue;
                    }
                }
            }
            let Some(buf) = spare.take() else {
                drop(pc);
                spare = Some(self.pool.alloc()?);
                continue;
            };
            let e = Arc::new(PageEntry::new(off, buf));
            {
                let mut g = e.inner.lock();
                PageEntry::ref_add(&mut g, kind);
            }
            pc.index.insert(off.get(), Arc::clone(&e));
            CacheStats::bump(&self.stats.entry_misses);
            return Ok((e, true));
        }
    }

    /// Drop a reference. The last reference either parks a ready page
    /// on the LRU or tears the entry down (poisoned, discarded, or
    /// never became ready).
    pub(crate) fn release_entry(&self, e: &Arc<PageEntry>, kind: RefKind) {
        let mut pc = self.pc.lock();
        let freed;
        {
            let mut g = e.inner.lock();
            PageEntry::ref_drop(&mut g, kind);
            if g.pinned() {
                return;
            }
            if g.state == EntryState::DataReady && !g.discard {
                if !g.on_lru {
                    g.on_lru = true;
                    g.last_access = Instant::now();
                    drop(g);
                    pc.lru.push(Arc::clone(e));
                }
                return;
            }
            freed = g.buf.take();
        }
        pc.index.remove(&e.off().get());
        pc.lru.retain(|x| !Arc::ptr_eq(x, e));
        drop(pc);
        if let Some(buf) = freed {
            self.pool.free(buf);
        }
    }

    /// Evict up to `target` idle pages from the LRU front, returning
    /// their buffers to the pool. Called by the pool's reaper.
    pub(crate) fn reap_lru(&self, target: usize, pool: &PagePool) -> usize {
        let mut bufs = Vec::new();
        {
            let mut pc = self.pc.lock();
            while bufs.len() < target && !pc.lru.is_empty() {
                let e = pc.lru.remove(0);
                let mut g = e.inner.lock();
                debug_assert!(!g.pinned(), "referenced entry on lru at {}", e.off().get());
                g.on_lru = false;
                if let Some(buf) = g.buf.take() {
                    bufs.push(buf);
                }
                drop(g);
                pc.index.remove(&e.off().get());
            }
        }
        let n = bufs.len();
        if n > 0 {
            debug!(target: "wfs::bmap", bmap = self.id.index, n, "reaped lru pages");
        }
        pool.free_many(bufs);
        n
    }

    /// Idle timestamp of the coldest LRU page, if any.
    pub(crate) fn oldest_lru(&self) -> Option<Instant> {
        let pc = self.pc.lock();
        pc.lru.first().map(|e| e.inner.lock().last_access)
    }

    /// Queue a flush-ready write request. Returns true when the caller
    /// must hand this bmap to the flush engine.
    pub(crate) fn queue_request(&self, req: Arc<IoRequest>) -> bool {
        let mut pc = self.pc.lock();
        pc.new_reqs.push(req);
        pc.pending_writes += 1;
        pc.check_dirty_invariant();
        !std::mem::replace(&mut pc.flush_queued, true)
    }

    /// Requests awaiting a flush pass.
    pub(crate) fn snapshot_new(&self) -> Vec<Arc<IoRequest>> {
        self.pc.lock().new_reqs.clone()
    }

    /// A flush pass has dispatched `req`; move it to the pending queue.
    pub(crate) fn promote(&self, req: &Arc<IoRequest>) {
        let mut pc = self.pc.lock();
        let before = pc.new_reqs.len();
        pc.new_reqs.retain(|r| !Arc::ptr_eq(r, req));
        assert_eq!(pc.new_reqs.len() + 1, before, "promoted request not on new queue");
        pc.pndg_reqs.push(Arc::clone(req));
        pc.check_dirty_invariant();
    }

    /// Terminal completion of a queued request. Normally it sits on
    /// the pending queue, but a request failed before dispatch (its
    /// pages poisoned by an earlier group) is still on the new queue.
    pub(crate) fn request_done(&self, req: &Arc<IoRequest>) {
        let mut pc = self.pc.lock();
        let before = pc.new_reqs.len() + pc.pndg_reqs.len();
        pc.new_reqs.retain(|r| !Arc::ptr_eq(r, req));
        pc.pndg_reqs.retain(|r| !Arc::ptr_eq(r, req));
        assert_eq!(pc.new_reqs.len() + pc.pndg_reqs.len() + 1, before, "completed request not queued");
        pc.pending_writes -= 1;
        pc.check_dirty_invariant();
        if pc.pending_writes == 0 {
            drop(pc);
            self.quiesce.notify_all();
        }
    }

    /// A dispatched request is being retried; put it back where a
    /// flush pass will find it.
    pub(crate) fn requeue(&self, req: &Arc<IoRequest>) {
        let mut pc = self.pc.lock();
        pc.pndg_reqs.retain(|r| !Arc::ptr_eq(r, req));
        pc.new_reqs.push(Arc::clone(req));
        pc.check_dirty_invariant();
    }

    /// Remove a not-yet-dispatched request (front-end abort). The
    /// caller must hold the request's claim so no flush pass can be
    /// working on it. Returns whether it was still queued.
    pub(crate) fn remove_new(&self, req: &Arc<IoRequest>) -> bool {
        let mut pc = self.pc.lock();
        let before = pc.new_reqs.len();
        pc.new_reqs.retain(|r| !Arc::ptr_eq(r, req));
        let removed = pc.new_reqs.len() < before;
        if removed {
            pc.pending_writes -= 1;
            pc.check_dirty_invariant();
            if pc.pending_writes == 0 {
                drop(pc);
                self.quiesce.notify_all();
            }
        }
        removed
    }

    /// The flush engine popped this bmap off its work queue.
    pub(crate) fn begin_flush_pass(&self) {
        self.pc.lock().flush_queued = false;
    }

    /// Re-arm the work-queue marker if dirty requests remain. Returns
    /// true when the caller must enqueue the bmap.
    pub(crate) fn ensure_queued(&self) -> bool {
        let mut pc = self.pc.lock();
        if pc.new_reqs.is_empty() || pc.flush_queued {
            return false;
        }
        pc.flush_queued = true;
        true
    }

    /// Block until every queued write has completed or failed.
    pub fn quiesce_wait(&self, timeout: std::time::Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pc = self.pc.lock();
        while pc.pending_writes > 0 {
            if self.quiesce.wait_until(&mut pc, deadline).timed_out() {
                return Err(WfsError::TimedOut);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.pc.lock().pending_writes
    }

    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.pc.lock().index.len()
    }

    /// Record the first asynchronous flush failure for this bmap.
    pub(crate) fn set_error(&self, err: WfsError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Take the sticky flush error, if one occurred.
    pub fn take_error(&self) -> Option<WfsError> {
        self.error.lock().take()
    }
}
