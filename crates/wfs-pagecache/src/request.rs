//! I/O requests.
//!
//! An [`IoRequest`] pins the run of pages covering one contiguous byte
//! range of a bmap. Reads fetch missing pages and copy out; writes
//! merge caller bytes in, then sit on the bmap's dirty queue until the
//! flush engine coalesces and dispatches them.
//!
//! Write state machine: `New` at build, `Pending` once the payload is
//! merged (flush-ready), `Scheduled` when a flush pass claims it,
//! `Inflight` while its RPCs are out, `Done` on completion or failure.
//! A claimed request that did not make the dispatch cut is unclaimed
//! back to `Pending`. Read requests go straight from `New` to `Done`
//! in `copy_out`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use wfs_error::{Result, WfsError};

use crate::bmap::Bmap;
use crate::entry::{PageEntry, RefKind};
use crate::stats::CacheStats;

/// How long a request waits for another thread's fetch or fill before
/// giving up.
const PAGE_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    New,
    Pending,
    Scheduled,
    Inflight,
    Done,
}

pub(crate) struct PageSlot {
    pub(crate) entry: Arc<PageEntry>,
    pub(crate) creator: bool,
}

struct ReqInner {
    state: ReqState,
    flush_ready: bool,
    force_expired: bool,
    retries: u32,
    released: bool,
    error: Option<WfsError>,
}

/// One contiguous read or write against a single bmap.
pub struct IoRequest {
    bmap: Arc<Bmap>,
    off: u32,
    len: u32,
    kind: IoKind,
    created: Instant,
    /// Unaligned leading edge; the first page was read from backing
    /// storage before the payload is merged over it.
    rbw_first: bool,
    /// Unaligned trailing edge, same treatment for the last page.
    rbw_last: bool,
    slots: Vec<PageSlot>,
    inner: Mutex<ReqInner>,
    done_cond: Condvar,
}

impl IoRequest {
    /// Pin the pages covering `[off, off + len)` and, for pages that
    /// need backing data (all read pages, unaligned write edges),
    /// start their fetches.
    pub(crate) fn build(
        bmap: &Arc<Bmap>,
        off: u32,
        len: u32,
        kind: IoKind,
    ) -> Result<Arc<Self>> {
        let params = &bmap.params;
        if len == 0 || off.checked_add(len).map_or(true, |end| end > params.bmap_size) {
            return Err(WfsError::InvalidRange { offset: off, len });
        }
        let end = off + len;
        let rbw_first = kind == IoKind::Write && !params.is_page_aligned(off);
        let rbw_last = kind == IoKind::Write && !params.is_page_aligned(end);

        let refkind = match kind {
            IoKind::Read => RefKind::Read,
            IoKind::Write => RefKind::Write,
        };
        let npages = params.page_count(off, len);
        let mut slots = Vec::with_capacity(npages);
        for poff in params.pages_spanning(off, len) {
            match bmap.lookup_or_create(poff, refkind) {
                Ok((entry, creator)) => slots.push(PageSlot { entry, creator }),
                Err(e) => {
                    for slot in &slots {
                        bmap.release_entry(&slot.entry, refkind);
                    }
                    return Err(e);
                }
            }
        }

        // Creator pages that need backing bytes: every read page, and
        // the unaligned edges of a write.
        let mut fetch = Vec::new();
        for (i, slot) in slots.iter().enumerate() {
            if !slot.creator {
                continue;
            }
            let needs = match kind {
                IoKind::Read => true,
                IoKind::Write => (i == 0 && rbw_first) || (i == npages - 1 && rbw_last),
            };
            if needs {
                slot.entry.mark_fetch_pending();
                fetch.push(Arc::clone(&slot.entry));
            }
        }
        if !fetch.is_empty() {
            bmap.engine.dispatch_fetch(bmap, fetch);
        }

        CacheStats::bump(&bmap.stats.requests_built);
        trace!(
            target: "wfs::request",
            bmap = bmap.id().index,
            off,
            len,
            ?kind,
            rbw_first,
            rbw_last,
            pages = npages,
            "request built"
        );
        Ok(Arc::new(Self {
            bmap: Arc::clone(bmap),
            off,
            len,
            kind,
            created: Instant::now(),
            rbw_first,
            rbw_last,
            slots,
            inner: Mutex::new(ReqInner {
                state: ReqState::New,
                flush_ready: false,
                force_expired: false,
                retries: 0,
                released: false,
                error: None,
            }),
            done_cond: Condvar::new(),
        }))
    }

    #[must_use]
    pub fn off(&self) -> u32 {
        self.off
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last bmap-relative byte covered.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.off + self.len
    }

    #[must_use]
    pub fn kind(&self) -> IoKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> ReqState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn bmap(&self) -> &Arc<Bmap> {
        &self.bmap
    }

    #[must_use]
    pub fn has_rbw(&self) -> bool {
        self.rbw_first || self.rbw_last
    }

    pub(crate) fn slots(&self) -> &[PageSlot] {
        &self.slots
    }

    /// Overlap of slot `i`'s page with the request extent, as
    /// (page offset, page-relative start, length).
    fn coverage(&self, i: usize) -> (u32, usize, usize) {
        let psz = self.bmap.params.page_size;
        let poff = self.slots[i].entry.off().get();
        let lo = self.off.max(poff);
        let hi = self.end().min(poff + psz);
        (poff, (lo - poff) as usize, (hi - lo) as usize)
    }

    /// Merge the caller's bytes into the pinned pages and queue the
    /// request for flushing. Consumes the request's one write shot; on
    /// failure the request is torn down and the error returned.
    pub fn copy_in(self: &Arc<Self>, src: &[u8]) -> Result<()> {
        assert_eq!(self.kind, IoKind::Write, "copy_in on a read request");
        assert_eq!(src.len(), self.len as usize, "payload length mismatch");
        {
            let g = self.inner.lock();
            assert!(!g.flush_ready, "copy_in called twice");
            assert_eq!(g.state, ReqState::New);
        }

        let mut consumed = 0usize;
        for (i, slot) in self.slots.iter().enumerate() {
            let (_, rel, n) = self.coverage(i);
            let full_page = rel == 0 && n == self.bmap.params.page_size as usize;
            if !(slot.creator && full_page) {
                // Partial coverage or shared page: merge over existing
                // bytes, which must be (or become) resident first.
                if let Err(e) = slot.entry.wait_data_ready(PAGE_WAIT) {
                    self.fail_before_dispatch(e.clone());
                    return Err(e);
                }
            }
            slot.entry.write_at(rel, &src[consumed..consumed + n]);
            consumed += n;
        }
        debug_assert_eq!(consumed, src.len());

        {
            let mut g = self.inner.lock();
            g.flush_ready = true;
            g.state = ReqState::Pending;
        }
        if self.bmap.queue_request(Arc::clone(self)) {
            self.bmap.engine.enqueue_bmap(Arc::clone(&self.bmap));
        }
        debug!(
            target: "wfs::request",
            bmap = self.bmap.id().index,
            off = self.off,
            len = self.len,
            "write queued for flush"
        );
        Ok(())
    }

    /// Wait for every covered page and copy the range out. Terminal for
    /// a read request: page references are dropped on the way out.
    pub fn copy_out(self: &Arc<Self>, dst: &mut [u8]) -> Result<()> {
        assert_eq!(self.kind, IoKind::Read, "copy_out on a write request");
        assert_eq!(dst.len(), self.len as usize, "buffer length mismatch");

        let mut filled = 0usize;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Err(e) = slot.entry.wait_data_ready(PAGE_WAIT) {
                self.fail_before_dispatch(e.clone());
                return Err(e);
            }
            let (_, rel, n) = self.coverage(i);
            slot.entry.read_at(rel, &mut dst[filled..filled + n]);
            filled += n;
        }
        debug_assert_eq!(filled, dst.len());

        self.release_refs();
        let mut g = self.inner.lock();
        g.state = ReqState::Done;
        drop(g);
        self.done_cond.notify_all();
        Ok(())
    }

    /// Atomically claim a flush-ready request for dispatch.
    pub(crate) fn try_claim(&self) -> bool {
        let mut g = self.inner.lock();
        if g.state != ReqState::Pending || !g.flush_ready {
            return false;
        }
        g.state = ReqState::Scheduled;
        true
    }

    /// Give a claimed request back; it did not make the dispatch cut.
    pub(crate) fn unclaim(&self) {
        let mut g = self.inner.lock();
        assert_eq!(g.state, ReqState::Scheduled, "unclaim of unclaimed request");
        g.state = ReqState::Pending;
    }

    pub(crate) fn mark_inflight(&self) {
        let mut g = self.inner.lock();
        assert_eq!(g.state, ReqState::Scheduled, "dispatch of unclaimed request");
        g.state = ReqState::Inflight;
    }

    /// Whether the request must be flushed regardless of coalesced size.
    pub(crate) fn is_expired(&self, max_age: Duration) -> bool {
        self.inner.lock().force_expired || self.created.elapsed() >= max_age
    }

    /// Make the next flush pass dispatch this request unconditionally.
    pub fn force_expire(&self) {
        let mut g = self.inner.lock();
        if g.state != ReqState::Done {
            g.force_expired = true;
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.inner.lock().retries
    }

    /// Dispatched RPCs failed transiently; count the attempt and drop
    /// back to `Pending` for the next pass.
    pub(crate) fn begin_retry(&self) {
        let mut g = self.inner.lock();
        assert_eq!(g.state, ReqState::Inflight);
        g.retries += 1;
        g.state = ReqState::Pending;
    }

    /// All RPCs for the coalesced group carrying this request landed.
    pub(crate) fn complete_ok(self: &Arc<Self>) {
        self.bmap.request_done(self);
        self.release_refs();
        let mut g = self.inner.lock();
        assert_eq!(g.state, ReqState::Inflight);
        g.state = ReqState::Done;
        drop(g);
        self.done_cond.notify_all();
    }

    /// Retries are exhausted; poison the covered pages, surface the
    /// error, and complete.
    pub(crate) fn complete_err(self: &Arc<Self>, err: WfsError) {
        for slot in &self.slots {
            slot.entry.poison("write-back failed");
            CacheStats::bump(&self.bmap.stats.entries_poisoned);
        }
        self.bmap.set_error(err.clone());
        self.bmap.request_done(self);
        self.release_refs();
        let mut g = self.inner.lock();
        g.state = ReqState::Done;
        g.error = Some(err);
        drop(g);
        self.done_cond.notify_all();
        CacheStats::bump(&self.bmap.stats.requests_failed);
    }

    /// Failure before the request ever reached the flush engine
    /// (a fetch fault during copy-in or copy-out).
    fn fail_before_dispatch(self: &Arc<Self>, err: WfsError) {
        self.release_refs();
        let mut g = self.inner.lock();
        debug_assert_eq!(g.state, ReqState::New);
        g.state = ReqState::Done;
        g.error = Some(err);
        drop(g);
        self.done_cond.notify_all();
    }

    /// Abort a request that was never merged or already completed.
    /// A queued request is pulled off the bmap's dirty queue; a
    /// dispatched one is waited for first.
    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        loop {
            let state = self.inner.lock().state;
            match state {
                ReqState::New => {
                    self.release_refs();
                    let mut g = self.inner.lock();
                    g.state = ReqState::Done;
                    return Ok(());
                }
                ReqState::Pending => {
                    // Compete with the flush pass for the claim; only
                    // the winner may touch the dirty queue.
                    if self.try_claim() {
                        let removed = self.bmap.remove_new(self);
                        debug_assert!(removed, "claimed request missing from new queue");
                        self.release_refs();
                        let mut g = self.inner.lock();
                        g.state = ReqState::Done;
                        drop(g);
                        self.done_cond.notify_all();
                        return Ok(());
                    }
                    // A flush pass claimed it first; wait out the
                    // dispatch.
                    self.wait_done(PAGE_WAIT)?;
                }
                ReqState::Scheduled | ReqState::Inflight => {
                    self.wait_done(PAGE_WAIT)?;
                }
                ReqState::Done => return Ok(()),
            }
        }
    }

    /// Block until the request reaches `Done`, surfacing its error.
    pub fn wait_done(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock();
        while g.state != ReqState::Done {
            if self.done_cond.wait_until(&mut g, deadline).timed_out() {
                return Err(WfsError::TimedOut);
            }
        }
        match &g.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Sticky error, if the request failed.
    #[must_use]
    pub fn error(&self) -> Option<WfsError> {
        self.inner.lock().error.clone()
    }

    fn release_refs(&self) {
        let refkind = match self.kind {
            IoKind::Read => RefKind::Read,
            IoKind::Write => RefKind::Write,
        };
        {
            let mut g = self.inner.lock();
            if g.released {
                return;
            }
            g.released = true;
        }
        for slot in &self.slots {
            self.bmap.release_entry(&slot.entry, refkind);
        }
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock();
        write!(
            f,
            "IoRequest({:?} bmap={} off={} len={} st={:?}{}{}{})",
            self.kind,
            self.bmap.id().index,
            self.off,
            self.len,
            g.state,
            if g.flush_ready { " rdy" } else { "" },
            if g.force_expired { " exp" } else { "" },
            if self.has_rbw() { " rbw" } else { "" },
        )
    }
}
