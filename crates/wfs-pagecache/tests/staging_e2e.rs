#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use wfs_pagecache::{
    CacheParams, ClientCache, FileId, IoKind, IosId, MemTransport, Transport,
};

const MIB: u32 = 1024 * 1024;

fn cache_with(params: CacheParams) -> (Arc<ClientCache>, Arc<MemTransport>) {
    let transport = MemTransport::new();
    let cache = ClientCache::new(params, Arc::clone(&transport) as Arc<dyn Transport>);
    (cache, transport)
}

/// An unaligned 10000-byte write at offset 100 spans three pages. The
/// partially covered first and last pages are read from backing
/// storage before the payload is merged over them; the fully covered
/// middle page is not.
#[test]
fn unaligned_write_reads_only_the_partial_edges() {
    let (cache, transport) = cache_with(CacheParams::default());
    let file = FileId(1);
    // Pre-existing file contents that the edges must preserve.
    let base = vec![0xEEu8; 16384];
    transport.seed_file(file, 0, &base);

    let bmap = cache.bmap(file, 0, IosId(1));
    let payload = vec![0x5Au8; 10000];
    let req = cache.write(&bmap, 100, &payload).unwrap();

    assert_eq!(bmap.cached_pages(), 3);
    // One fetch for page 0, one for page 2; the two runs are not
    // contiguous so they cannot share an RPC.
    assert_eq!(transport.read_rpcs(), 2);

    cache.flush_now(&[req], Duration::from_secs(5)).unwrap();
    let stored = transport.file_bytes(file, 16384);
    assert_eq!(&stored[..100], &base[..100]);
    assert_eq!(&stored[100..10100], &payload[..]);
    assert_eq!(&stored[10100..], &base[10100..]);
    // Only the written extent went over the wire.
    assert_eq!(transport.write_sizes(), vec![10000]);
}

/// Two contiguous writes coalesce into a single wire request covering
/// the merged extent.
#[test]
fn contiguous_writes_merge_into_one_rpc() {
    let (cache, transport) = cache_with(CacheParams::default());
    let bmap = cache.bmap(FileId(2), 0, IosId(1));

    let a = cache.write(&bmap, 0, &vec![1u8; 2048]).unwrap();
    let b = cache.write(&bmap, 2048, &vec![2u8; 2148]).unwrap();
    cache.flush_now(&[a, b], Duration::from_secs(5)).unwrap();

    assert_eq!(transport.write_sizes(), vec![4196]);
    let stored = transport.file_bytes(FileId(2), 4196);
    assert_eq!(&stored[..2048], &vec![1u8; 2048][..]);
    assert_eq!(&stored[2048..], &vec![2u8; 2148][..]);
}

/// Rewriting an extent that was already flushed and parked on the LRU
/// lands the later content in storage.
#[test]
fn rewrite_of_a_flushed_extent_wins() {
    let (cache, transport) = cache_with(CacheParams::default());
    let file = FileId(9);
    let bmap = cache.bmap(file, 0, IosId(1));

    let first = cache.write(&bmap, 100, &vec![0xA1u8; 3000]).unwrap();
    cache.flush_now(&[first], Duration::from_secs(5)).unwrap();
    assert_eq!(&transport.file_bytes(file, 3100)[100..], &vec![0xA1u8; 3000][..]);
    let fetches = transport.read_rpcs();

    let second = cache.write(&bmap, 100, &vec![0xB2u8; 3000]).unwrap();
    // The page is still cached, so the rewrite fetches nothing.
    assert_eq!(transport.read_rpcs(), fetches);
    cache.flush_now(&[second], Duration::from_secs(5)).unwrap();

    assert_eq!(&transport.file_bytes(file, 3100)[100..], &vec![0xB2u8; 3000][..]);
    assert_eq!(transport.write_sizes(), vec![3000, 3000]);
}

/// A write of exactly one MTU fits a single RPC; one byte more forces
/// a second RPC carrying just the overflow.
#[test]
fn mtu_bounds_each_wire_request() {
    let (cache, transport) = cache_with(CacheParams::default());

    let bmap = cache.bmap(FileId(3), 0, IosId(1));
    let exact = cache.write(&bmap, 0, &vec![7u8; MIB as usize]).unwrap();
    cache.flush_now(&[exact], Duration::from_secs(5)).unwrap();
    assert_eq!(transport.write_sizes(), vec![MIB as usize]);

    let bmap2 = cache.bmap(FileId(4), 0, IosId(1));
    let over = cache.write(&bmap2, 0, &vec![8u8; MIB as usize + 1]).unwrap();
    cache.flush_now(&[over], Duration::from_secs(5)).unwrap();
    assert_eq!(
        transport.write_sizes(),
        vec![MIB as usize, MIB as usize, 1]
    );
    let stored = transport.file_bytes(FileId(4), MIB as usize + 1);
    assert!(stored.iter().all(|&b| b == 8));
}

/// With the pool at capacity and every page idle on the LRU, a new
/// allocation reclaims exactly one page instead of emptying the cache.
#[test]
fn exhausted_pool_reaps_exactly_what_is_needed() {
    let mut params = CacheParams::default();
    params.pool_pages = 512;
    let (cache, _transport) = cache_with(params);
    let bmap = cache.bmap(FileId(5), 0, IosId(1));

    // Fill all 512 pool pages and let them settle onto the LRU.
    let big = cache.write(&bmap, 0, &vec![9u8; 512 * 4096]).unwrap();
    cache.flush_now(&[big], Duration::from_secs(10)).unwrap();
    assert_eq!(cache.pool().in_use(), 512);
    assert_eq!(bmap.cached_pages(), 512);

    // One more page: the blocked allocation evicts a single idle page.
    let one = cache.write(&bmap, 512 * 4096, &[1u8; 4096]).unwrap();
    cache.flush_now(&[one], Duration::from_secs(5)).unwrap();
    assert_eq!(cache.pool().in_use(), 512);
    assert_eq!(bmap.cached_pages(), 512);
    assert_eq!(cache.stats().entries_reaped, 1);
}

/// Force-expiring a batch of small, disjoint writes pushes each one
/// out on the next pass even though none meets the coalesce floor,
/// with the in-flight cap throttling dispatch rather than dropping
/// work.
#[test]
fn force_expired_requests_all_reach_storage() {
    let mut params = CacheParams::default();
    params.max_age = Duration::from_secs(3600);
    params.max_inflight_rpcs = 2;
    let (cache, transport) = cache_with(params);
    let bmap = cache.bmap(FileId(6), 0, IosId(1));

    // Disjoint pages so nothing coalesces.
    let reqs: Vec<_> = (0..5u32)
        .map(|i| cache.write(&bmap, i * 2 * 4096, &[i as u8; 512]).unwrap())
        .collect();

    // Far below the coalesce floor and nowhere near max_age: a pass
    // leaves everything queued.
    assert_eq!(cache.engine().flush_pass(), 0);
    assert_eq!(transport.write_rpcs(), 0);
    assert_eq!(bmap.pending_writes(), 5);

    cache.flush_now(&reqs, Duration::from_secs(5)).unwrap();
    assert_eq!(transport.write_rpcs(), 5);
    assert_eq!(bmap.pending_writes(), 0);
    for (i, _) in reqs.iter().enumerate() {
        let off = i * 2 * 4096;
        let stored = transport.file_bytes(FileId(6), off + 512);
        assert_eq!(&stored[off..], &vec![i as u8; 512][..]);
    }
}

/// Reads served from cached pages do not touch the transport again.
#[test]
fn read_hits_skip_the_wire() {
    let (cache, transport) = cache_with(CacheParams::default());
    let file = FileId(7);
    transport.seed_file(file, 0, &vec![0xABu8; 8192]);
    let bmap = cache.bmap(file, 0, IosId(1));

    let mut buf = vec![0u8; 8192];
    cache.read(&bmap, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAB));
    let fetches = transport.read_rpcs();
    assert!(fetches >= 1);

    let mut again = vec![0u8; 4096];
    cache.read(&bmap, 2048, &mut again).unwrap();
    assert!(again.iter().all(|&b| b == 0xAB));
    assert_eq!(transport.read_rpcs(), fetches);
    assert!(cache.stats().entry_hits >= 2);
}

/// Building a request past the bmap boundary is rejected up front.
#[test]
fn out_of_range_requests_are_rejected() {
    let (cache, _) = cache_with(CacheParams::default());
    let bmap = cache.bmap(FileId(8), 0, IosId(1));
    let end = cache.params().bmap_size;
    assert!(cache.build_request(&bmap, end - 1, 2, IoKind::Write).is_err());
    assert!(cache.build_request(&bmap, 0, 0, IoKind::Read).is_err());
    assert!(cache.build_request(&bmap, end - 1, 1, IoKind::Write).is_ok());
}
