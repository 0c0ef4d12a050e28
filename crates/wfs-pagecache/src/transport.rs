//! Wire boundary between the cache and the backing I/O servers.
//!
//! The flush engine and the read path never talk to a socket directly;
//! they hand fully formed [`WireRequest`]s to a [`Transport`] together
//! with a completion callback. Completions may run on the caller's
//! thread or on a transport-owned thread, so they must not assume any
//! lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use wfs_error::{Result, WfsError};
use wfs_types::{ByteOffset, FileId, IosId};

/// One contiguous run of file bytes inside a wire request.
///
/// Write vectors carry their payload; read vectors carry `None` and the
/// transport returns one buffer per vector on completion.
#[derive(Debug, Clone)]
pub struct IoVec {
    pub offset: ByteOffset,
    pub len: u32,
    pub data: Option<Vec<u8>>,
}

/// A single RPC-sized unit of work addressed to one I/O server.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub target: IosId,
    pub file: FileId,
    pub vecs: Vec<IoVec>,
}

impl WireRequest {
    /// Total byte span carried by the request.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.vecs.iter().map(|v| v.len as usize).sum()
    }
}

pub type WriteCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;
pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<Vec<u8>>>) + Send + 'static>;

/// Dispatch surface for the cache.
///
/// Implementations must invoke the completion exactly once, including
/// when `dispatch_*` itself returns `Ok`; an `Err` return means the
/// request was never accepted and the completion will not run.
pub trait Transport: Send + Sync {
    fn dispatch_write(&self, req: WireRequest, done: WriteCompletion) -> Result<()>;
    fn dispatch_read(&self, req: WireRequest, done: ReadCompletion) -> Result<()>;
}

#[derive(Default)]
struct MemFiles {
    bytes: HashMap<FileId, Vec<u8>>,
}

impl MemFiles {
    fn write(&mut self, file: FileId, off: u64, data: &[u8]) {
        let buf = self.bytes.entry(file).or_default();
        let end = off as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[off as usize..end].copy_from_slice(data);
    }

    fn read(&self, file: FileId, off: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if let Some(buf) = self.bytes.get(&file) {
            let off = off as usize;
            if off < buf.len() {
                let n = len.min(buf.len() - off);
                out[..n].copy_from_slice(&buf[off..off + n]);
            }
        }
        out
    }
}

/// In-memory transport used by the test suite and by embedders that
/// want the cache without a network.
///
/// Files are byte vectors extended on demand; reads past the written
/// extent return zeroes. Write failures can be injected ahead of time
/// and are consumed one per dispatched write RPC.
pub struct MemTransport {
    files: Mutex<MemFiles>,
    fail_writes: AtomicUsize,
    write_rpcs: AtomicUsize,
    read_rpcs: AtomicUsize,
    write_sizes: Mutex<Vec<usize>>,
}

impl MemTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(MemFiles::default()),
            fail_writes: AtomicUsize::new(0),
            write_rpcs: AtomicUsize::new(0),
            read_rpcs: AtomicUsize::new(0),
            write_sizes: Mutex::new(Vec::new()),
        })
    }

    /// Arrange for the next `n` write RPCs to complete with an error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn write_rpcs(&self) -> usize {
        self.write_rpcs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn read_rpcs(&self) -> usize {
        self.read_rpcs.load(Ordering::SeqCst)
    }

    /// Payload sizes of every dispatched write RPC, in dispatch order.
    #[must_use]
    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_sizes.lock().clone()
    }

    /// Raw file contents as currently persisted, zero-filled to `len`.
    #[must_use]
    pub fn file_bytes(&self, file: FileId, len: usize) -> Vec<u8> {
        self.files.lock().read(file, 0, len)
    }

    /// Seed file contents directly, bypassing the RPC path.
    pub fn seed_file(&self, file: FileId, off: u64, data: &[u8]) {
        self.files.lock().write(file, off, data);
    }

    fn take_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for MemTransport {
    fn dispatch_write(&self, req: WireRequest, done: WriteCompletion) -> Result<()> {
        self.write_rpcs.fetch_add(1, Ordering::SeqCst);
        self.write_sizes.lock().push(req.payload_len());
        debug!(
            target: "wfs::transport",
            file = req.file.0,
            vecs = req.vecs.len(),
            bytes = req.payload_len(),
            "write rpc"
        );
        if self.take_failure() {
            done(Err(WfsError::Transport("injected write failure".into())));
            return Ok(());
        }
        let mut files = self.files.lock();
        for vec in &req.vecs {
            let data = vec
                .data
                .as_deref()
                .ok_or_else(|| WfsError::Transport("write vector without payload".into()))?;
            files.write(req.file, vec.offset.0, data);
        }
        drop(files);
        done(Ok(()));
        Ok(())
    }

    fn dispatch_read(&self, req: WireRequest, done: ReadCompletion) -> Result<()> {
        self.read_rpcs.fetch_add(1, Ordering::SeqCst);
        debug!(
            target: "wfs::transport",
            file = req.file.0,
            vecs = req.vecs.len(),
            bytes = req.payload_len(),
            "read rpc"
        );
        let files = self.files.lock();
        let bufs = req
            .vecs
            .iter()
            .map(|v| files.read(req.file, v.offset.0, v.len as usize))
            .collect();
        drop(files);
        done(Ok(bufs));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_req(file: FileId, off: u64, data: &[u8]) -> WireRequest {
        WireRequest {
            target: IosId(1),
            file,
            vecs: vec![IoVec {
                offset: ByteOffset(off),
                len: data.len() as u32,
                data: Some(data.to_vec()),
            }],
        }
    }

    fn read_one(t: &MemTransport, file: FileId, off: u64, len: u32) -> Vec<u8> {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        t.dispatch_read(
            WireRequest {
                target: IosId(1),
                file,
                vecs: vec![IoVec { offset: ByteOffset(off), len, data: None }],
            },
            Box::new(move |r| {
                *sink.lock() = r.unwrap().remove(0);
            }),
        )
        .unwrap();
        let out = got.lock().clone();
        out
    }

    #[test]
    fn write_then_read_round_trips() {
        let t = MemTransport::new();
        let file = FileId(7);
        t.dispatch_write(write_req(file, 10, b"hello"), Box::new(|r| r.unwrap()))
            .unwrap();
        assert_eq!(read_one(&t, file, 10, 5), b"hello");
        assert_eq!(t.write_rpcs(), 1);
        assert_eq!(t.read_rpcs(), 1);
    }

    #[test]
    fn reads_past_extent_are_zero_filled() {
        let t = MemTransport::new();
        let file = FileId(3);
        t.seed_file(file, 0, b"ab");
        assert_eq!(read_one(&t, file, 0, 4), &[b'a', b'b', 0, 0]);
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let t = MemTransport::new();
        t.fail_next_writes(1);
        let file = FileId(9);

        let first = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&first);
        t.dispatch_write(write_req(file, 0, b"x"), Box::new(move |r| *sink.lock() = Some(r)))
            .unwrap();
        assert!(first.lock().take().unwrap().is_err());

        let second = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&second);
        t.dispatch_write(write_req(file, 0, b"y"), Box::new(move |r| *sink.lock() = Some(r)))
            .unwrap();
        assert!(second.lock().take().unwrap().is_ok());
        assert_eq!(t.file_bytes(file, 1), b"y");
    }
}
