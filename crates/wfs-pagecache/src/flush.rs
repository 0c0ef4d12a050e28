//! Write-back flush engine.
//!
//! Dirty bmaps sit on a FIFO work queue. A flush pass pops each bmap,
//! claims its flush-ready requests, sorts them by offset (longest
//! first on ties), and greedily coalesces adjacent or overlapping
//! extents into groups. A group is dispatched when it reaches the
//! efficient-RPC threshold or any member has aged out; otherwise its
//! members are unclaimed and wait for the next pass. Dispatched groups
//! are cut into MTU-bounded wire requests that share one completion
//! context; the group succeeds or retries as a unit, and after the
//! retry budget is spent it fails as a unit.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use wfs_error::{Result, WfsError};
use wfs_types::CacheParams;

use crate::request::IoRequest;
use crate::bmap::Bmap;
use crate::entry::{EntryState, PageEntry};
use crate::stats::CacheStats;
use crate::transport::{IoVec, Transport, WireRequest};

/// Upper bound on the shutdown drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Coalesces dirty write requests and drives them over the transport.
pub struct FlushEngine {
    pub(crate) params: Arc<CacheParams>,
    transport: Arc<dyn Transport>,
    stats: Arc<CacheStats>,
    queue: Mutex<VecDeque<Arc<Bmap>>>,
    kick: Condvar,
    /// Write RPCs currently on the wire; bounded by
    /// `params.max_inflight_rpcs`.
    inflight: Mutex<usize>,
    slot_free: Condvar,
    shutdown: AtomicBool,
}

impl FlushEngine {
    #[must_use]
    pub fn new(
        params: Arc<CacheParams>,
        transport: Arc<dyn Transport>,
        stats: Arc<CacheStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            transport,
            stats,
            queue: Mutex::new(VecDeque::new()),
            kick: Condvar::new(),
            inflight: Mutex::new(0),
            slot_free: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inflight_rpcs(&self) -> usize {
        *self.inflight.lock()
    }

    /// Hand a dirty bmap to the engine. Idempotence is the caller's
    /// concern via [`Bmap::queue_request`] / [`Bmap::ensure_queued`].
    pub(crate) fn enqueue_bmap(&self, bmap: Arc<Bmap>) {
        self.queue.lock().push_back(bmap);
        self.kick.notify_all();
    }

    /// Fetch backing bytes for freshly created entries. Contiguous
    /// pages ride one read RPC; a failed run poisons its pages.
    pub(crate) fn dispatch_fetch(&self, bmap: &Arc<Bmap>, entries: Vec<Arc<PageEntry>>) {
        let psz = self.params.page_size;
        let mut runs: Vec<Vec<Arc<PageEntry>>> = Vec::new();
        for e in entries {
            match runs.last_mut() {
                Some(run)
                    if run.last().map(|p| p.off().get() + psz) == Some(e.off().get()) =>
                {
                    run.push(e);
                }
                _ => runs.push(vec![e]),
            }
        }
        for run in runs {
            let vecs = run
                .iter()
                .map(|e| IoVec {
                    offset: self.params.absolute(bmap.id(), e.off().get()),
                    len: psz,
                    data: None,
                })
                .collect();
            let req = WireRequest { target: bmap.target(), file: bmap.id().file, vecs };
            let bytes = req.payload_len() as u64;
            CacheStats::bump(&self.stats.read_rpcs);
            let stats = Arc::clone(&self.stats);
            let pages = run.clone();
            let res = self.transport.dispatch_read(
                req,
                Box::new(move |res| match res {
                    Ok(bufs) => {
                        for (page, buf) in pages.iter().zip(bufs) {
                            page.fill(&buf);
                        }
                        CacheStats::add(&stats.bytes_fetched, bytes);
                    }
                    Err(e) => {
                        for page in &pages {
                            page.poison(&e.to_string());
                        }
                        CacheStats::add(&stats.entries_poisoned, pages.len() as u64);
                    }
                }),
            );
            if let Err(e) = res {
                for page in &run {
                    page.poison(&e.to_string());
                }
                CacheStats::add(&self.stats.entries_poisoned, run.len() as u64);
            }
        }
    }

    /// Run one pass over every currently queued bmap. Returns the
    /// number of write RPCs dispatched.
    pub fn flush_pass(self: &Arc<Self>) -> usize {
        let batch: Vec<Arc<Bmap>> = self.queue.lock().drain(..).collect();
        let mut rpcs = 0;
        for bmap in batch {
            bmap.begin_flush_pass();
            rpcs += self.flush_bmap(&bmap);
            if bmap.ensure_queued() {
                self.queue.lock().push_back(bmap);
            }
        }
        rpcs
    }

    fn flush_bmap(self: &Arc<Self>, bmap: &Arc<Bmap>) -> usize {
        let mut claimed = Vec::new();
        for req in bmap.snapshot_new() {
            if !req.try_claim() {
                continue;
            }
            // A page poisoned by an earlier failed group cannot be
            // flushed again; fail the request now.
            if req
                .slots()
                .iter()
                .any(|s| s.entry.state() == EntryState::Poisoned)
            {
                req.complete_err(WfsError::FlushFailed {
                    retries: req.retries(),
                    detail: "covered page was poisoned by an earlier failure".into(),
                });
                continue;
            }
            claimed.push(req);
        }
        if claimed.is_empty() {
            return 0;
        }
        claimed.sort_by(|a, b| a.off().cmp(&b.off()).then(b.len().cmp(&a.len())));

        let max_age = self.params.max_age;
        let mut rpcs = 0;
        let mut i = 0;
        while i < claimed.len() {
            let mut group = vec![Arc::clone(&claimed[i])];
            let mut end = claimed[i].end();
            let mut expired = claimed[i].is_expired(max_age);
            let mut j = i + 1;
            while j < claimed.len() && claimed[j].off() <= end {
                end = end.max(claimed[j].end());
                expired |= claimed[j].is_expired(max_age);
                group.push(Arc::clone(&claimed[j]));
                j += 1;
            }
            let size = end - group[0].off();
            if expired || size >= self.params.min_coalesce {
                rpcs += self.dispatch_group(bmap, group);
            } else {
                trace!(
                    target: "wfs::flush",
                    bmap = bmap.id().index,
                    members = group.len(),
                    size,
                    "group below coalesce threshold, descheduled"
                );
                for req in &group {
                    req.unclaim();
                }
            }
            i = j;
        }
        rpcs
    }

    /// Emit one coalesced group as MTU-bounded write RPCs sharing a
    /// single completion context.
    fn dispatch_group(self: &Arc<Self>, bmap: &Arc<Bmap>, group: Vec<Arc<IoRequest>>) -> usize {
        let psz = self.params.page_size;
        let lo = group[0].off();
        let hi = group
            .iter()
            .map(|r| r.end())
            .max()
            .unwrap_or_else(|| unreachable!("empty coalesce group"));

        // A page shared by several members is emitted and pinned once
        // per group; a repeat must already carry the pin.
        let mut pages: BTreeMap<u32, Arc<PageEntry>> = BTreeMap::new();
        for req in &group {
            for slot in req.slots() {
                let poff = slot.entry.off().get();
                if pages.contains_key(&poff) {
                    debug_assert!(slot.entry.is_scheduled(), "covered page not pinned");
                } else {
                    slot.entry.inflight_inc();
                    pages.insert(poff, Arc::clone(&slot.entry));
                }
            }
        }
        for req in &group {
            req.mark_inflight();
            bmap.promote(req);
        }

        let mut iovs = Vec::with_capacity(pages.len());
        for (&poff, page) in &pages {
            let seg_lo = lo.max(poff);
            let seg_hi = hi.min(poff + psz);
            debug_assert!(seg_lo < seg_hi, "page outside group extent");
            let data = page.snapshot((seg_lo - poff) as usize, (seg_hi - seg_lo) as usize);
            iovs.push(IoVec {
                offset: self.params.absolute(bmap.id(), seg_lo),
                len: seg_hi - seg_lo,
                data: Some(data),
            });
        }

        // Cut at vector granularity so no RPC exceeds the MTU.
        let mut chunks: Vec<Vec<IoVec>> = Vec::new();
        let mut cur: Vec<IoVec> = Vec::new();
        let mut cur_len = 0u32;
        for iov in iovs {
            if !cur.is_empty() && cur_len + iov.len > self.params.mtu {
                chunks.push(std::mem::take(&mut cur));
                cur_len = 0;
            }
            cur_len += iov.len;
            cur.push(iov);
        }
        if !cur.is_empty() {
            chunks.push(cur);
        }

        debug!(
            target: "wfs::flush",
            bmap = bmap.id().index,
            members = group.len(),
            pages = pages.len(),
            bytes = hi - lo,
            rpcs = chunks.len(),
            "dispatching coalesced group"
        );
        let ctx = Arc::new(GroupCtx {
            engine: Arc::clone(self),
            bmap: Arc::clone(bmap),
            reqs: group,
            pages: pages.into_values().collect(),
            remaining: AtomicUsize::new(chunks.len()),
            error: Mutex::new(None),
            bytes: u64::from(hi - lo),
        });
        let nrpcs = chunks.len();
        for vecs in chunks {
            self.take_rpc_slot();
            CacheStats::bump(&self.stats.write_rpcs);
            let req = WireRequest { target: bmap.target(), file: bmap.id().file, vecs };
            let cb_ctx = Arc::clone(&ctx);
            if let Err(e) = self
                .transport
                .dispatch_write(req, Box::new(move |res| cb_ctx.chunk_done(res)))
            {
                ctx.chunk_done(Err(e));
            }
        }
        nrpcs
    }

    fn take_rpc_slot(&self) {
        let mut n = self.inflight.lock();
        while *n >= self.params.max_inflight_rpcs {
            self.slot_free.wait(&mut n);
        }
        *n += 1;
    }

    fn release_rpc_slot(&self) {
        let mut n = self.inflight.lock();
        *n -= 1;
        drop(n);
        self.slot_free.notify_one();
        // A completion may unblock a daemon waiting for work to settle.
        self.kick.notify_all();
    }

    /// Force the given requests out on the next pass and wait for each
    /// to complete. Drives passes inline, so it works without a daemon.
    pub fn flush_now(self: &Arc<Self>, reqs: &[Arc<IoRequest>], timeout: Duration) -> Result<()> {
        for req in reqs {
            req.force_expire();
            if req.bmap().ensure_queued() {
                self.enqueue_bmap(Arc::clone(req.bmap()));
            }
        }
        self.kick.notify_all();
        let deadline = Instant::now() + timeout;
        for req in reqs {
            loop {
                match req.wait_done(Duration::from_millis(10)) {
                    Ok(()) => break,
                    Err(WfsError::TimedOut) => {
                        if Instant::now() > deadline {
                            return Err(WfsError::TimedOut);
                        }
                        self.flush_pass();
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Drain everything: force-expire all queued requests and run
    /// passes until the queue is empty and no RPC is on the wire.
    fn drain(self: &Arc<Self>) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let bmaps: Vec<Arc<Bmap>> = self.queue.lock().iter().cloned().collect();
            for bmap in &bmaps {
                for req in bmap.snapshot_new() {
                    req.force_expire();
                }
            }
            let dispatched = self.flush_pass();
            let busy = !self.queue.lock().is_empty() || self.inflight_rpcs() > 0;
            if !busy {
                return;
            }
            if Instant::now() > deadline {
                warn!(target: "wfs::flush", "shutdown drain timed out with dirty data");
                return;
            }
            if dispatched == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Completion state shared by every RPC cut from one coalesced group.
struct GroupCtx {
    engine: Arc<FlushEngine>,
    bmap: Arc<Bmap>,
    reqs: Vec<Arc<IoRequest>>,
    pages: Vec<Arc<PageEntry>>,
    remaining: AtomicUsize,
    error: Mutex<Option<WfsError>>,
    bytes: u64,
}

impl GroupCtx {
    fn chunk_done(self: &Arc<Self>, res: Result<()>) {
        self.engine.release_rpc_slot();
        if let Err(e) = res {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        for page in &self.pages {
            page.inflight_dec();
        }
        let err = self.error.lock().take();
        match err {
            None => {
                for req in &self.reqs {
                    req.complete_ok();
                }
                CacheStats::add(&self.engine.stats.bytes_flushed, self.bytes);
            }
            Some(e) => {
                let spent = self
                    .reqs
                    .iter()
                    .any(|r| r.retries() >= self.engine.params.max_dispatch_retries);
                if spent {
                    warn!(
                        target: "wfs::flush",
                        bmap = self.bmap.id().index,
                        members = self.reqs.len(),
                        error = %e,
                        "retry budget spent, failing group"
                    );
                    for req in &self.reqs {
                        req.complete_err(WfsError::FlushFailed {
                            retries: req.retries(),
                            detail: e.to_string(),
                        });
                    }
                } else {
                    debug!(
                        target: "wfs::flush",
                        bmap = self.bmap.id().index,
                        members = self.reqs.len(),
                        error = %e,
                        "group failed, requeueing for retry"
                    );
                    for req in &self.reqs {
                        req.begin_retry();
                        self.bmap.requeue(req);
                        CacheStats::bump(&self.engine.stats.requests_retried);
                    }
                    if self.bmap.ensure_queued() {
                        self.engine.enqueue_bmap(Arc::clone(&self.bmap));
                    }
                }
            }
        }
        self.engine.kick.notify_all();
    }
}

/// Tunables for the background flush thread.
#[derive(Debug, Clone)]
pub struct FlushDaemonConfig {
    /// Longest the daemon sleeps between passes with work queued.
    pub interval: Duration,
}

impl Default for FlushDaemonConfig {
    fn default() -> Self {
        Self { interval: Duration::from_millis(20) }
    }
}

/// Handle to the background flush thread. Dropping it without calling
/// [`FlushDaemon::shutdown`] detaches the thread.
pub struct FlushDaemon {
    engine: Arc<FlushEngine>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Spawn the periodic flush thread.
pub fn start_flush_daemon(engine: Arc<FlushEngine>, config: FlushDaemonConfig) -> FlushDaemon {
    let worker = Arc::clone(&engine);
    let handle = thread::Builder::new()
        .name("wfs-flush".into())
        .spawn(move || {
            debug!(target: "wfs::flush", "flush daemon started");
            while !worker.is_shutdown() {
                worker.flush_pass();
                let mut q = worker.queue.lock();
                if !worker.is_shutdown() {
                    worker.kick.wait_for(&mut q, config.interval);
                }
            }
            worker.drain();
            debug!(target: "wfs::flush", "flush daemon stopped");
        })
        .unwrap_or_else(|e| panic!("failed to spawn flush daemon: {e}"));
    FlushDaemon { engine, handle: Some(handle) }
}

impl FlushDaemon {
    /// Stop the daemon after draining all dirty data.
    pub fn shutdown(mut self) {
        self.engine.shutdown.store(true, Ordering::SeqCst);
        self.engine.kick.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "wfs::flush", "flush daemon panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{IoKind, ReqState};
    use crate::pool::PagePool;
    use crate::transport::MemTransport;
    use wfs_types::{BmapId, FileId, IosId};

    struct Rig {
        bmap: Arc<Bmap>,
        engine: Arc<FlushEngine>,
        transport: Arc<MemTransport>,
    }

    /// 64-byte pages, 256-byte MTU and coalesce floor, ageless.
    fn rig(max_age: Duration) -> Rig {
        let mut params = CacheParams::new(64, 64 * 64, 256, 64).unwrap();
        params.max_age = max_age;
        let params = Arc::new(params);
        let stats = Arc::new(CacheStats::default());
        let transport = MemTransport::new();
        let engine = FlushEngine::new(
            Arc::clone(&params),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&stats),
        );
        let pool = PagePool::new(64, 64, Arc::clone(&stats));
        let bmap = Bmap::new(
            BmapId::new(FileId(1), 0),
            IosId(1),
            params,
            Arc::clone(&pool),
            stats,
            Arc::clone(&engine),
        );
        pool.register_source(&bmap);
        Rig { bmap, engine, transport }
    }

    fn write(rig: &Rig, off: u32, data: &[u8]) -> Arc<IoRequest> {
        let req = IoRequest::build(&rig.bmap, off, data.len() as u32, IoKind::Write).unwrap();
        req.copy_in(data).unwrap();
        req
    }

    #[test]
    fn small_young_group_is_descheduled() {
        let rig = rig(Duration::from_secs(60));
        let req = write(&rig, 0, &[1u8; 64]);
        assert_eq!(rig.engine.flush_pass(), 0);
        assert_eq!(req.state(), ReqState::Pending);
        assert_eq!(rig.transport.write_rpcs(), 0);
        // Still dirty, still queued for a later pass.
        assert_eq!(rig.bmap.pending_writes(), 1);
    }

    #[test]
    fn aged_group_is_dispatched_regardless_of_size() {
        let rig = rig(Duration::ZERO);
        let req = write(&rig, 0, &[2u8; 64]);
        assert_eq!(rig.engine.flush_pass(), 1);
        req.wait_done(Duration::from_secs(5)).unwrap();
        assert_eq!(rig.transport.write_rpcs(), 1);
        assert_eq!(rig.bmap.pending_writes(), 0);
    }

    #[test]
    fn contiguous_requests_coalesce_into_one_rpc() {
        let rig = rig(Duration::from_secs(60));
        // Four contiguous pages reach the 256-byte coalesce floor.
        let reqs: Vec<_> = (0..4).map(|i| write(&rig, i * 64, &[i as u8; 64])).collect();
        assert_eq!(rig.engine.flush_pass(), 1);
        for req in &reqs {
            req.wait_done(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(rig.transport.write_sizes(), vec![256]);
    }

    #[test]
    fn oversized_group_splits_at_the_mtu() {
        let rig = rig(Duration::ZERO);
        // Five pages, MTU holds four.
        let req = write(&rig, 0, &[3u8; 320]);
        assert_eq!(rig.engine.flush_pass(), 2);
        req.wait_done(Duration::from_secs(5)).unwrap();
        assert_eq!(rig.transport.write_sizes(), vec![256, 64]);
    }

    #[test]
    fn disjoint_extents_stay_separate_groups() {
        let rig = rig(Duration::ZERO);
        let a = write(&rig, 0, &[4u8; 64]);
        let b = write(&rig, 512, &[5u8; 64]);
        assert_eq!(rig.engine.flush_pass(), 2);
        a.wait_done(Duration::from_secs(5)).unwrap();
        b.wait_done(Duration::from_secs(5)).unwrap();
        assert_eq!(rig.transport.write_sizes(), vec![64, 64]);
    }

    #[test]
    fn transient_failure_retries_then_succeeds() {
        let rig = rig(Duration::ZERO);
        rig.transport.fail_next_writes(1);
        let req = write(&rig, 0, &[6u8; 64]);
        assert_eq!(rig.engine.flush_pass(), 1);
        assert_eq!(req.state(), ReqState::Pending);
        assert_eq!(req.retries(), 1);

        assert_eq!(rig.engine.flush_pass(), 1);
        req.wait_done(Duration::from_secs(5)).unwrap();
        assert_eq!(rig.transport.file_bytes(FileId(1), 64), vec![6u8; 64]);
    }

    #[test]
    fn retry_budget_exhaustion_fails_the_group() {
        let rig = rig(Duration::ZERO);
        rig.transport.fail_next_writes(10);
        let req = write(&rig, 0, &[7u8; 64]);
        // Initial attempt plus max_dispatch_retries retries.
        for _ in 0..=rig.engine.params.max_dispatch_retries {
            rig.engine.flush_pass();
        }
        let err = req.wait_done(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, WfsError::FlushFailed { retries: 3, .. }));
        assert_eq!(rig.bmap.pending_writes(), 0);
        assert!(matches!(rig.bmap.take_error(), Some(WfsError::FlushFailed { .. })));
    }

    #[test]
    fn destroy_yields_to_a_claimed_request() {
        let rig = rig(Duration::from_secs(60));
        let req = write(&rig, 0, &[9u8; 64]);
        // Stand in for a flush pass that has claimed the request but
        // not yet promoted it off the new queue.
        assert!(req.try_claim());

        let victim = Arc::clone(&req);
        let aborter = thread::spawn(move || victim.destroy());
        thread::sleep(Duration::from_millis(50));
        // The claim keeps the request on the dirty queue.
        assert_eq!(rig.bmap.pending_writes(), 1);

        // The pass finishes its dispatch; the abort observes it.
        rig.bmap.promote(&req);
        req.mark_inflight();
        req.complete_ok();
        aborter.join().unwrap().unwrap();
        assert_eq!(rig.bmap.pending_writes(), 0);
    }

    #[test]
    fn destroyed_request_leaves_nothing_to_flush() {
        let rig = rig(Duration::ZERO);
        let req = write(&rig, 0, &[10u8; 64]);
        req.destroy().unwrap();
        assert_eq!(rig.bmap.pending_writes(), 0);
        assert_eq!(rig.engine.flush_pass(), 0);
        assert_eq!(rig.transport.write_rpcs(), 0);
    }

    #[test]
    fn overlapping_members_share_pages_in_one_group() {
        let rig = rig(Duration::ZERO);
        let a = write(&rig, 0, &[11u8; 96]);
        let b = write(&rig, 32, &[12u8; 96]);
        assert_eq!(rig.engine.flush_pass(), 1);
        a.wait_done(Duration::from_secs(5)).unwrap();
        b.wait_done(Duration::from_secs(5)).unwrap();
        assert_eq!(rig.transport.write_sizes(), vec![128]);

        let mut want = vec![11u8; 32];
        want.extend_from_slice(&[12u8; 96]);
        assert_eq!(rig.transport.file_bytes(FileId(1), 128), want);
    }

    #[test]
    fn flush_now_pushes_young_data_out() {
        let rig = rig(Duration::from_secs(60));
        let req = write(&rig, 0, &[8u8; 64]);
        rig.engine
            .flush_now(std::slice::from_ref(&req), Duration::from_secs(5))
            .unwrap();
        assert_eq!(rig.transport.file_bytes(FileId(1), 64), vec![8u8; 64]);
    }
}
