//! Per-page cache entries.
//!
//! An entry owns exactly one page-sized buffer and tracks who is using
//! it. Lifecycle: created in `Init` by the first lookup (the creator),
//! optionally `FetchPending` while a backing read is outstanding, then
//! `DataReady` for the rest of its life. A failed fetch or flush moves
//! it to `Poisoned`, which is terminal; waiters are woken and see the
//! error, and the entry is torn down once its last reference drops.
//!
//! Lock order: the owning bmap's cache lock, if held, is always taken
//! before the entry lock. The entry condvar is only ever waited on with
//! the entry lock alone.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use wfs_error::{Result, WfsError};
use wfs_types::PageOffset;

use crate::pool::PageBuf;

/// Content state of a page entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Freshly created; buffer contents are undefined.
    Init,
    /// A backing read for this page is in flight.
    FetchPending,
    /// Buffer holds valid data. Terminal unless poisoned.
    DataReady,
    /// A fetch or flush failed; contents must not be served.
    Poisoned,
}

/// Which side of the cache holds a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Read,
    Write,
}

pub(crate) struct EntryInner {
    pub(crate) state: EntryState,
    pub(crate) rdref: u32,
    pub(crate) wrref: u32,
    /// Write RPCs currently carrying this page. Nonzero means the page
    /// is claimed by the flush engine and must not be scheduled again.
    pub(crate) infref: u32,
    /// Eviction hint; set when a flush for this page failed.
    pub(crate) discard: bool,
    /// Present while the entry sits on the bmap LRU.
    pub(crate) on_lru: bool,
    pub(crate) last_access: Instant,
    pub(crate) buf: Option<PageBuf>,
    poison: Option<String>,
}

impl EntryInner {
    pub(crate) fn refs(&self) -> u32 {
        self.rdref + self.wrref
    }

    pub(crate) fn pinned(&self) -> bool {
        self.refs() > 0 || self.infref > 0
    }
}

/// One page of cached file data within a bmap.
pub struct PageEntry {
    off: PageOffset,
    pub(crate) inner: Mutex<EntryInner>,
    pub(crate) cond: Condvar,
}

impl PageEntry {
    pub(crate) fn new(off: PageOffset, buf: PageBuf) -> Self {
        Self {
            off,
            inner: Mutex::new(EntryInner {
                state: EntryState::Init,
                rdref: 0,
                wrref: 0,
                infref: 0,
                discard: false,
                on_lru: false,
                last_access: Instant::now(),
                buf: Some(buf),
                poison: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Bmap-relative offset of this page. Immutable for the entry's life.
    #[must_use]
    pub fn off(&self) -> PageOffset {
        self.off
    }

    #[must_use]
    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub(crate) fn ref_add(guard: &mut MutexGuard<'_, EntryInner>, kind: RefKind) {
        match kind {
            RefKind::Read => guard.rdref += 1,
            RefKind::Write => guard.wrref += 1,
        }
        guard.last_access = Instant::now();
    }

    pub(crate) fn ref_drop(guard: &mut MutexGuard<'_, EntryInner>, kind: RefKind) {
        match kind {
            RefKind::Read => {
                assert!(guard.rdref > 0, "read reference underflow");
                guard.rdref -= 1;
            }
            RefKind::Write => {
                assert!(guard.wrref > 0, "write reference underflow");
                guard.wrref -= 1;
            }
        }
    }

    /// Move `Init` to `FetchPending`. Caller is the entry's creator and
    /// is about to dispatch a backing read.
    pub(crate) fn mark_fetch_pending(&self) {
        let mut g = self.inner.lock();
        assert_eq!(g.state, EntryState::Init, "fetch on non-init page {}", self.off.get());
        g.state = EntryState::FetchPending;
    }

    /// Install fetched bytes and wake waiters.
    pub(crate) fn fill(&self, data: &[u8]) {
        let mut g = self.inner.lock();
        assert_eq!(g.state, EntryState::FetchPending, "fill of non-pending page {}", self.off.get());
        let buf = g.buf.as_mut().unwrap_or_else(|| unreachable!("pinned entry without buffer"));
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        g.state = EntryState::DataReady;
        trace!(target: "wfs::entry", off = self.off.get(), "page data ready");
        drop(g);
        self.cond.notify_all();
    }

    /// Mark the entry unusable and wake waiters with an error.
    pub(crate) fn poison(&self, detail: &str) {
        let mut g = self.inner.lock();
        g.state = EntryState::Poisoned;
        g.discard = true;
        if g.poison.is_none() {
            g.poison = Some(detail.to_owned());
        }
        drop(g);
        self.cond.notify_all();
    }

    fn poison_error(&self, g: &EntryInner) -> WfsError {
        WfsError::Poisoned {
            offset: self.off.get(),
            detail: g.poison.clone().unwrap_or_default(),
        }
    }

    /// Block until the page holds valid data, or fail if it was
    /// poisoned or the deadline passes.
    pub(crate) fn wait_data_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock();
        loop {
            match g.state {
                EntryState::DataReady => return Ok(()),
                EntryState::Poisoned => return Err(self.poison_error(&g)),
                EntryState::Init | EntryState::FetchPending => {
                    if self.cond.wait_until(&mut g, deadline).timed_out() {
                        return Err(WfsError::TimedOut);
                    }
                }
            }
        }
    }

    /// Copy `src` into the page at `rel` and mark the page ready.
    ///
    /// Only valid for a full overwrite by the creator (`Init`) or a
    /// merge into an already ready page. Callers wanting merge
    /// semantics on a not-yet-ready page must wait first.
    pub(crate) fn write_at(&self, rel: usize, src: &[u8]) {
        let mut g = self.inner.lock();
        assert!(
            matches!(g.state, EntryState::Init | EntryState::DataReady),
            "write into unwritable page {}", self.off.get()
        );
        let buf = g.buf.as_mut().unwrap_or_else(|| unreachable!("pinned entry without buffer"));
        buf.as_mut_slice()[rel..rel + src.len()].copy_from_slice(src);
        if g.state == EntryState::Init {
            g.state = EntryState::DataReady;
            drop(g);
            self.cond.notify_all();
        }
    }

    /// Copy page bytes at `rel` into `dst`. Page must be `DataReady`.
    pub(crate) fn read_at(&self, rel: usize, dst: &mut [u8]) {
        let g = self.inner.lock();
        assert_eq!(g.state, EntryState::DataReady, "read from non-ready page {}", self.off.get());
        let buf = g.buf.as_ref().unwrap_or_else(|| unreachable!("pinned entry without buffer"));
        dst.copy_from_slice(&buf.as_slice()[rel..rel + dst.len()]);
    }

    /// Clone page bytes in `rel..rel + len` for a write RPC payload.
    pub(crate) fn snapshot(&self, rel: usize, len: usize) -> Vec<u8> {
        let g = self.inner.lock();
        assert_eq!(g.state, EntryState::DataReady, "snapshot of non-ready page {}", self.off.get());
        let buf = g.buf.as_ref().unwrap_or_else(|| unreachable!("pinned entry without buffer"));
        buf.as_slice()[rel..rel + len].to_vec()
    }

    /// First write RPC claiming the page takes the inflight reference;
    /// overlapping requests in the same coalesced group share it.
    pub(crate) fn inflight_inc(&self) {
        let mut g = self.inner.lock();
        g.infref += 1;
    }

    pub(crate) fn inflight_dec(&self) {
        let mut g = self.inner.lock();
        assert!(g.infref > 0, "inflight underflow on page {}", self.off.get());
        g.infref -= 1;
    }

    #[must_use]
    pub(crate) fn is_scheduled(&self) -> bool {
        self.inner.lock().infref > 0
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.inner.lock();
        let s = match g.state {
            EntryState::Init => 'i',
            EntryState::FetchPending => 'f',
            EntryState::DataReady => 'd',
            EntryState::Poisoned => 'p',
        };
        write!(
            f,
            "PageEntry(off={} st={} rd={} wr={} inf={}{})",
            self.off.get(),
            s,
            g.rdref,
            g.wrref,
            g.infref,
            if g.on_lru { " lru" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PagePool;
    use std::sync::Arc;
    use std::thread;

    fn entry(page_size: u32) -> PageEntry {
        let params = wfs_types::CacheParams::new(page_size, page_size * 32, page_size, 4).unwrap();
        let pool = PagePool::new(page_size as usize, 4, Arc::default());
        let buf = pool.try_alloc().unwrap();
        PageEntry::new(params.page_floor(0), buf)
    }

    #[test]
    fn creator_write_makes_data_ready() {
        let e = entry(64);
        assert_eq!(e.state(), EntryState::Init);
        e.write_at(8, b"abc");
        assert_eq!(e.state(), EntryState::DataReady);
        let mut out = [0u8; 3];
        e.read_at(8, &mut out);
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn waiters_wake_on_fill() {
        let e = Arc::new(entry(64));
        e.mark_fetch_pending();
        let waiter = {
            let e = Arc::clone(&e);
            thread::spawn(move || e.wait_data_ready(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        e.fill(&[7u8; 64]);
        waiter.join().unwrap().unwrap();
        let mut out = [0u8; 1];
        e.read_at(63, &mut out);
        assert_eq!(out[0], 7);
    }

    #[test]
    fn waiters_see_poison() {
        let e = Arc::new(entry(64));
        e.mark_fetch_pending();
        let waiter = {
            let e = Arc::clone(&e);
            thread::spawn(move || e.wait_data_ready(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        e.poison("backing read failed");
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, WfsError::Poisoned { offset: 0, .. }));
    }

    #[test]
    fn inflight_refs_balance() {
        let e = entry(64);
        e.write_at(0, &[1u8; 64]);
        e.inflight_inc();
        assert!(e.is_scheduled());
        e.inflight_dec();
        assert!(!e.is_scheduled());
    }

    #[test]
    #[should_panic(expected = "inflight underflow")]
    fn inflight_underflow_asserts() {
        entry(64).inflight_dec();
    }
}
