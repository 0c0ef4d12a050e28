//! Cache-wide operation counters.
//!
//! Every counter is monotonic and updated with relaxed atomics; the
//! snapshot is advisory and not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by the cache, the pool and the flush engine.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub(crate) entry_hits: AtomicU64,
    pub(crate) entry_misses: AtomicU64,
    pub(crate) entries_reaped: AtomicU64,
    pub(crate) entries_poisoned: AtomicU64,
    pub(crate) alloc_waits: AtomicU64,
    pub(crate) requests_built: AtomicU64,
    pub(crate) requests_retried: AtomicU64,
    pub(crate) requests_failed: AtomicU64,
    pub(crate) write_rpcs: AtomicU64,
    pub(crate) read_rpcs: AtomicU64,
    pub(crate) bytes_flushed: AtomicU64,
    pub(crate) bytes_fetched: AtomicU64,
}

impl CacheStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            entry_hits: get(&self.entry_hits),
            entry_misses: get(&self.entry_misses),
            entries_reaped: get(&self.entries_reaped),
            entries_poisoned: get(&self.entries_poisoned),
            alloc_waits: get(&self.alloc_waits),
            requests_built: get(&self.requests_built),
            requests_retried: get(&self.requests_retried),
            requests_failed: get(&self.requests_failed),
            write_rpcs: get(&self.write_rpcs),
            read_rpcs: get(&self.read_rpcs),
            bytes_flushed: get(&self.bytes_flushed),
            bytes_fetched: get(&self.bytes_fetched),
        }
    }
}

/// Plain-value view of [`CacheStats`], suitable for logging or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub entry_hits: u64,
    pub entry_misses: u64,
    pub entries_reaped: u64,
    pub entries_poisoned: u64,
    pub alloc_waits: u64,
    pub requests_built: u64,
    pub requests_retried: u64,
    pub requests_failed: u64,
    pub write_rpcs: u64,
    pub read_rpcs: u64,
    pub bytes_flushed: u64,
    pub bytes_fetched: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = CacheStats::default();
        CacheStats::bump(&stats.entry_hits);
        CacheStats::bump(&stats.entry_hits);
        CacheStats::add(&stats.bytes_flushed, 4096);
        let snap = stats.snapshot();
        assert_eq!(snap.entry_hits, 2);
        assert_eq!(snap.entry_misses, 0);
        assert_eq!(snap.bytes_flushed, 4096);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = CacheStats::default();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"write_rpcs\":0"));
    }
}
