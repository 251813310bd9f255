//! Buffered duplex byte channel over one file descriptor.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::executor::Handle;
use crate::net::connection::{self, PeerRef};
use crate::worker::WorkerCtx;

/// Bytes read per fill attempt.
const READ_CHUNK: usize = 8192;

/// Upper bound for a single zero-copy file transmission.
const FILE_WRITE_CHUNK: u64 = 1 << 20;

/// Max IoSlices gathered into one vectored write.
const MAX_IOVECS: usize = 16;

/// Streams an `EndPoint` can sit on: non-blocking, pollable duplex fds.
pub trait Duplex: Read + Write + AsRawFd + 'static {
    fn set_nodelay(&self, _enabled: bool) -> io::Result<()> {
        Ok(())
    }
}

impl Duplex for mio::net::TcpStream {
    fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        mio::net::TcpStream::set_nodelay(self, enabled)
    }
}

impl Duplex for mio::net::UnixStream {}

/// A contiguous region of an open file, transmitted without copying
/// through userspace where the platform allows.
pub struct FileView {
    fd: RawFd,
    /// Keeps the fd alive (and closes it when done) iff owned.
    owner: Option<std::fs::File>,
    offset: u64,
    remaining: u64,
}

impl FileView {
    /// A view that owns the file; the descriptor closes when the view
    /// is fully written or dropped.
    pub fn owned(file: std::fs::File, offset: u64, len: u64) -> FileView {
        FileView {
            fd: file.as_raw_fd(),
            owner: Some(file),
            offset,
            remaining: len,
        }
    }

    /// A borrowed view; the caller keeps the descriptor open for the
    /// lifetime of the transfer.
    pub fn borrowed(fd: RawFd, offset: u64, len: u64) -> FileView {
        FileView {
            fd,
            owner: None,
            offset,
            remaining: len,
        }
    }

    pub fn len(&self) -> u64 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Marks the view spent, e.g. after the backing file shrank.
    pub(crate) fn exhaust(&mut self) {
        self.remaining = 0;
    }

    /// Reads up to `max` bytes at the cursor into memory, advancing the
    /// view. Used when a filter chain needs the payload in userspace.
    pub(crate) fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        let want = self.remaining.min(max as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = pread(self.fd, &mut buf, self.offset)?;
        buf.truncate(n);
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for FileView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileView")
            .field("fd", &self.fd)
            .field("offset", &self.offset)
            .field("remaining", &self.remaining)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

/// One element of the pending write chain.
#[derive(Debug)]
pub enum Chunk {
    Data(Bytes),
    File(FileView),
}

impl Chunk {
    pub fn len(&self) -> u64 {
        match self {
            Chunk::Data(b) => b.len() as u64,
            Chunk::File(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Chunk {
        Chunk::Data(b)
    }
}

/// Result of draining the write chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Chain fully written.
    Done,
    /// Transport is full; re-arm a flush interest and try again.
    Blocked,
}

/// Byte-oriented duplex channel bound to one socket.
///
/// Filling appends to the read buffer; flushing drains the chunk chain.
/// At most one fill interest and one flush interest are live at a time,
/// and since the scheduler admits a single watcher per fd, the two are
/// mutually exclusive in practice: connections alternate direction.
pub struct EndPoint {
    io: Box<dyn Duplex>,
    fd: RawFd,
    read_buf: BytesMut,
    chain: VecDeque<Chunk>,
    read_timeout: Duration,
    write_timeout: Duration,
    fill_handle: Option<Handle>,
    flush_handle: Option<Handle>,
    eof: bool,
    closed: bool,
}

impl EndPoint {
    pub fn new(io: Box<dyn Duplex>) -> EndPoint {
        let fd = io.as_raw_fd();
        EndPoint {
            io,
            fd,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            chain: VecDeque::new(),
            read_timeout: Duration::from_secs(0),
            write_timeout: Duration::from_secs(0),
            fill_handle: None,
            flush_handle: None,
            eof: false,
            closed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        self.io.set_nodelay(enabled)
    }

    /// Linux `TCP_CORK`; a no-op error-free stub elsewhere.
    pub fn set_cork(&self, enabled: bool) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            let flag: libc::c_int = if enabled { 1 } else { 0 };
            let rc = unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_CORK,
                    &flag as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = enabled;
        Ok(())
    }

    /// Accumulated inbound bytes; parsers consume from here.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Peer signalled end-of-stream on a previous fill.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// One non-blocking read into the read buffer. Returns the byte
    /// count; 0 covers both `EAGAIN` and EOF ([`is_eof`](Self::is_eof)
    /// distinguishes them).
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut tmp = [0u8; READ_CHUNK];
        loop {
            match self.io.read(&mut tmp) {
                Ok(0) => {
                    tracing::trace!(fd = self.fd, "fill: eof");
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    tracing::trace!(fd = self.fd, n, "fill");
                    self.read_buf.extend_from_slice(&tmp[..n]);
                    return Ok(n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Queues a chunk on the pending write chain.
    pub fn write(&mut self, chunk: Chunk) {
        if !chunk.is_empty() {
            self.chain.push_back(chunk);
        }
    }

    pub fn write_bytes(&mut self, data: Bytes) {
        self.write(Chunk::Data(data));
    }

    pub fn write_file(&mut self, view: FileView) {
        self.write(Chunk::File(view));
    }

    /// Bytes still queued for transmission.
    pub fn pending(&self) -> u64 {
        self.chain.iter().map(Chunk::len).sum()
    }

    /// Writes the chain in order until done or the transport blocks.
    /// Returns the flush status and the number of bytes written.
    pub fn flush(&mut self) -> io::Result<(FlushStatus, u64)> {
        let mut written: u64 = 0;
        loop {
            match self.chain.front_mut() {
                None => return Ok((FlushStatus::Done, written)),
                Some(Chunk::Data(_)) => {
                    let n = match self.write_gathered() {
                        Ok(n) => n,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Ok((FlushStatus::Blocked, written));
                        }
                        Err(err) => return Err(err),
                    };
                    if n == 0 {
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                    written += n as u64;
                    self.advance_chain(n);
                }
                Some(Chunk::File(view)) => {
                    if view.is_empty() {
                        self.chain.pop_front();
                        continue;
                    }
                    let n = match send_file(self.fd, view) {
                        Ok(n) => n,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Ok((FlushStatus::Blocked, written));
                        }
                        Err(err) => return Err(err),
                    };
                    written += n as u64;
                    if view.is_empty() {
                        self.chain.pop_front();
                    }
                }
            }
        }
    }

    /// Vectored write over the leading run of byte chunks.
    fn write_gathered(&mut self) -> io::Result<usize> {
        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOVECS);
        for chunk in self.chain.iter() {
            match chunk {
                Chunk::Data(b) => slices.push(IoSlice::new(b)),
                Chunk::File(_) => break,
            }
            if slices.len() == MAX_IOVECS {
                break;
            }
        }
        debug_assert!(!slices.is_empty());
        loop {
            match self.io.write_vectored(&slices) {
                Ok(n) => {
                    tracing::trace!(fd = self.fd, n, "flush");
                    return Ok(n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Pops `n` written bytes off the front of the chain.
    fn advance_chain(&mut self, mut n: usize) {
        while n > 0 {
            let done = match self.chain.front_mut() {
                Some(Chunk::Data(b)) => {
                    if b.len() > n {
                        let _ = b.split_to(n);
                        n = 0;
                        false
                    } else {
                        n -= b.len();
                        true
                    }
                }
                _ => unreachable!("advance past non-data chunk"),
            };
            if done {
                self.chain.pop_front();
            }
        }
    }

    /// Arms the read interest; when the fd becomes readable the bound
    /// connection's `on_fillable` runs, on timeout `on_interest_failure`.
    /// No-op while a fill interest is already live. A live flush
    /// interest is displaced first: the scheduler admits one watcher
    /// per fd, so the two directions alternate.
    pub fn want_fill(&mut self, worker: &Rc<WorkerCtx>, peer: &PeerRef) -> Result<()> {
        if let Some(ref handle) = self.fill_handle {
            if handle.is_pending() {
                return Ok(());
            }
        }
        self.cancel_flush_interest(worker);
        let on_ready = {
            let worker = Rc::clone(worker);
            let peer = Rc::clone(peer);
            move || connection::fillable(&worker, &peer)
        };
        let on_timeout = {
            let worker = Rc::clone(worker);
            let peer = Rc::clone(peer);
            move || connection::interest_failure(&worker, &peer, Error::new_timeout())
        };
        let handle =
            worker
                .scheduler
                .execute_on_readable(self.fd, on_ready, self.read_timeout, on_timeout)?;
        self.fill_handle = Some(handle);
        Ok(())
    }

    /// Arms the write interest; readiness drives `on_flushable`. A live
    /// fill interest is displaced first.
    pub fn want_flush(&mut self, worker: &Rc<WorkerCtx>, peer: &PeerRef) -> Result<()> {
        if let Some(ref handle) = self.flush_handle {
            if handle.is_pending() {
                return Ok(());
            }
        }
        self.cancel_fill_interest(worker);
        let on_ready = {
            let worker = Rc::clone(worker);
            let peer = Rc::clone(peer);
            move || connection::flushable(&worker, &peer)
        };
        let on_timeout = {
            let worker = Rc::clone(worker);
            let peer = Rc::clone(peer);
            move || connection::interest_failure(&worker, &peer, Error::new_timeout())
        };
        let handle =
            worker
                .scheduler
                .execute_on_writable(self.fd, on_ready, self.write_timeout, on_timeout)?;
        self.flush_handle = Some(handle);
        Ok(())
    }

    /// Drops a live fill interest, freeing the fd's watcher slot.
    pub fn cancel_fill_interest(&mut self, worker: &Rc<WorkerCtx>) {
        if let Some(handle) = self.fill_handle.take() {
            if handle.is_pending() {
                handle.cancel();
                worker.scheduler.cancel_fd(self.fd);
            }
        }
    }

    /// Drops a live flush interest.
    pub fn cancel_flush_interest(&mut self, worker: &Rc<WorkerCtx>) {
        if let Some(handle) = self.flush_handle.take() {
            if handle.is_pending() {
                handle.cancel();
                worker.scheduler.cancel_fd(self.fd);
            }
        }
    }

    /// Cancels both interests and closes the fd exactly once.
    pub fn close(&mut self, worker: &Rc<WorkerCtx>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(handle) = self.fill_handle.take() {
            handle.cancel();
        }
        if let Some(handle) = self.flush_handle.take() {
            handle.cancel();
        }
        worker.scheduler.cancel_fd(self.fd);
        self.chain.clear();
        tracing::debug!(fd = self.fd, "endpoint closed");
        // dropping `io` closes the descriptor
    }
}

impl fmt::Debug for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndPoint")
            .field("fd", &self.fd)
            .field("read_buf", &self.read_buf.len())
            .field("pending", &self.pending())
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .finish()
    }
}

fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let rc = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Transmits part of `view` to `out_fd`, preferring `sendfile(2)`.
#[cfg(target_os = "linux")]
fn send_file(out_fd: RawFd, view: &mut FileView) -> io::Result<usize> {
    let mut offset = view.offset as libc::off_t;
    let count = view.remaining.min(FILE_WRITE_CHUNK) as usize;
    let rc = unsafe { libc::sendfile(out_fd, view.fd, &mut offset, count) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let n = rc as usize;
    view.offset += n as u64;
    view.remaining -= n as u64;
    Ok(n)
}

/// Fallback: bounded pread + write loop.
#[cfg(not(target_os = "linux"))]
fn send_file(out_fd: RawFd, view: &mut FileView) -> io::Result<usize> {
    let count = view.remaining.min(16 * 1024) as usize;
    let mut buf = vec![0u8; count];
    let n = pread(view.fd, &mut buf, view.offset)?;
    if n == 0 {
        view.remaining = 0;
        return Ok(0);
    }
    let rc = unsafe {
        libc::write(out_fd, buf.as_ptr() as *const libc::c_void, n)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = rc as usize;
    view.offset += written as u64;
    view.remaining -= written as u64;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// An in-memory duplex for chain mechanics; fd-based paths are
    /// covered by the integration tests.
    struct Sink {
        wrote: Vec<u8>,
        limit: Option<usize>,
    }

    impl Read for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.limit {
                Some(limit) => {
                    if limit == 0 {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    buf.len().min(limit)
                }
                None => buf.len(),
            };
            self.wrote.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for Sink {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl Duplex for Sink {}

    fn endpoint(limit: Option<usize>) -> EndPoint {
        EndPoint::new(Box::new(Sink {
            wrote: Vec::new(),
            limit,
        }))
    }

    #[test]
    fn flush_drains_chain_in_order() {
        let mut ep = endpoint(None);
        ep.write_bytes(Bytes::from_static(b"hello "));
        ep.write_bytes(Bytes::from_static(b"world"));
        let (status, n) = ep.flush().unwrap();
        assert_eq!(status, FlushStatus::Done);
        assert_eq!(n, 11);
        assert_eq!(ep.pending(), 0);
    }

    #[test]
    fn short_writes_retry_until_drained() {
        let mut ep = endpoint(Some(4));
        ep.write_bytes(Bytes::from_static(b"abcdefgh"));
        let (status, n) = ep.flush().unwrap();
        assert_eq!(status, FlushStatus::Done);
        assert_eq!(n, 8);
        assert_eq!(ep.pending(), 0);
    }

    #[test]
    fn blocked_transport_keeps_remaining_chain() {
        let mut ep = EndPoint::new(Box::new(Sink {
            wrote: Vec::new(),
            limit: Some(0),
        }));
        ep.write_bytes(Bytes::from_static(b"pending"));
        let (status, n) = ep.flush().unwrap();
        assert_eq!(status, FlushStatus::Blocked);
        assert_eq!(n, 0);
        assert_eq!(ep.pending(), 7);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let mut ep = endpoint(None);
        ep.write_bytes(Bytes::new());
        assert_eq!(ep.pending(), 0);
    }

    #[test]
    fn file_view_read_chunk_advances() {
        let mut tmp = tempfile();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();
        let mut view = FileView::owned(tmp, 2, 6);
        let first = view.read_chunk(4).unwrap();
        assert_eq!(&first[..], b"2345");
        let rest = view.read_chunk(100).unwrap();
        assert_eq!(&rest[..], b"67");
        assert!(view.is_empty());
    }

    fn tempfile() -> std::fs::File {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "strand-endpoint-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
