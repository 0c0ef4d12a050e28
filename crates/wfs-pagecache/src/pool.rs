//! Global page buffer pool.
//!
//! All bmap caches draw page buffers from one fixed-capacity pool.
//! When the pool is empty, allocation first tries to reap idle pages
//! from the registered bmaps (oldest LRU tail first, only as many as
//! needed), then blocks until a buffer is freed. The pool lock is a
//! leaf lock: it is never taken while a bmap cache lock or an entry
//! lock is held.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use wfs_error::{Result, WfsError};

use crate::bmap::Bmap;
use crate::stats::CacheStats;

/// How long a blocked allocation waits before giving up.
const ALLOC_TIMEOUT: Duration = Duration::from_secs(2);

/// One page-sized buffer owned by a cache entry or the free list.
pub struct PageBuf {
    data: Vec<u8>,
}

impl PageBuf {
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

struct PoolInner {
    free: Vec<PageBuf>,
    outstanding: usize,
}

/// Fixed-capacity pool of page buffers shared by every bmap cache.
pub struct PagePool {
    page_size: usize,
    capacity: usize,
    inner: Mutex<PoolInner>,
    available: Condvar,
    sources: Mutex<Vec<Weak<Bmap>>>,
    stats: Arc<CacheStats>,
}

impl PagePool {
    #[must_use]
    pub fn new(page_size: usize, capacity: usize, stats: Arc<CacheStats>) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            capacity,
            inner: Mutex::new(PoolInner { free: Vec::new(), outstanding: 0 }),
            available: Condvar::new(),
            sources: Mutex::new(Vec::new()),
            stats,
        })
    }

    /// Register a bmap as a reap source. Dead weak refs are pruned on
    /// each reap pass, so there is no matching unregister.
    pub(crate) fn register_source(&self, bmap: &Arc<Bmap>) {
        self.sources.lock().push(Arc::downgrade(bmap));
    }

    /// Non-blocking allocation. Buffers are created lazily up to the
    /// pool capacity and recycled without rezeroing.
    pub(crate) fn try_alloc(&self) -> Option<PageBuf> {
        let mut inner = self.inner.lock();
        if let Some(buf) = inner.free.pop() {
            inner.outstanding += 1;
            return Some(buf);
        }
        if inner.outstanding < self.capacity {
            inner.outstanding += 1;
            drop(inner);
            return Some(PageBuf { data: vec![0u8; self.page_size] });
        }
        None
    }

    /// Blocking allocation: reap idle pages if the pool is exhausted,
    /// then wait for a free. Fails with [`WfsError::Exhausted`] when
    /// nothing can be reclaimed within [`ALLOC_TIMEOUT`].
    pub(crate) fn alloc(&self) -> Result<PageBuf> {
        if let Some(buf) = self.try_alloc() {
            return Ok(buf);
        }
        CacheStats::bump(&self.stats.alloc_waits);
        let deadline = Instant::now() + ALLOC_TIMEOUT;
        loop {
            let reaped = self.reap(1);
            if let Some(buf) = self.try_alloc() {
                return Ok(buf);
            }
            if reaped > 0 {
                // Someone raced us to the reaped buffer; go again.
                continue;
            }
            let mut inner = self.inner.lock();
            if inner.free.is_empty() && inner.outstanding >= self.capacity {
                if self.available.wait_until(&mut inner, deadline).timed_out() {
                    debug!(target: "wfs::pool", "allocation timed out with pool exhausted");
                    return Err(WfsError::Exhausted);
                }
            }
        }
    }

    /// Return a buffer to the free list and wake one waiter.
    pub(crate) fn free(&self, buf: PageBuf) {
        let mut inner = self.inner.lock();
        assert!(inner.outstanding > 0, "pool free without allocation");
        inner.outstanding -= 1;
        inner.free.push(buf);
        drop(inner);
        self.available.notify_one();
    }

    pub(crate) fn free_many(&self, bufs: Vec<PageBuf>) {
        if bufs.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        assert!(inner.outstanding >= bufs.len(), "pool free without allocation");
        inner.outstanding -= bufs.len();
        inner.free.extend(bufs);
        drop(inner);
        self.available.notify_all();
    }

    /// Evict unreferenced LRU pages across all registered bmaps until
    /// `target` buffers have been reclaimed. Oldest-idle bmap first;
    /// never evicts more than asked for.
    pub(crate) fn reap(&self, target: usize) -> usize {
        let mut candidates: Vec<Arc<Bmap>> = Vec::new();
        {
            let mut sources = self.sources.lock();
            sources.retain(|w| match w.upgrade() {
                Some(bmap) => {
                    candidates.push(bmap);
                    true
                }
                None => false,
            });
        }
        candidates.sort_by_key(|b| b.oldest_lru().unwrap_or_else(Instant::now));

        let mut freed = 0;
        for bmap in &candidates {
            if freed >= target {
                break;
            }
            freed += bmap.reap_lru(target - freed, self);
        }
        if freed > 0 {
            trace!(target: "wfs::pool", freed, target, "reaped idle pages");
            CacheStats::add(&self.stats.entries_reaped, freed as u64);
        }
        freed
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.lock().outstanding
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn alloc_up_to_capacity_then_none() {
        let pool = PagePool::new(64, 2, Arc::default());
        let a = pool.try_alloc().unwrap();
        let _b = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        assert_eq!(pool.in_use(), 2);
        pool.free(a);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn blocked_alloc_wakes_on_free() {
        let pool = PagePool::new(64, 1, Arc::default());
        let held = pool.try_alloc().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.alloc())
        };
        thread::sleep(Duration::from_millis(20));
        pool.free(held);
        waiter.join().unwrap().unwrap();
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn buffers_are_recycled() {
        let pool = PagePool::new(8, 1, Arc::default());
        let mut buf = pool.try_alloc().unwrap();
        buf.as_mut_slice()[0] = 0xAA;
        pool.free(buf);
        // Recycled without rezeroing.
        let buf = pool.try_alloc().unwrap();
        assert_eq!(buf.as_slice()[0], 0xAA);
    }
}
