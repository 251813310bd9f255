//! The per-socket connection contract and its driver.
//!
//! A [`Connection`] is a protocol state machine attached to an
//! [`EndPoint`]; the scheduler's readiness callbacks are routed through
//! the free driver functions here, which split the borrow of the owning
//! [`Peer`] so the machine sees its endpoint mutably without cycles.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::net::endpoint::EndPoint;
use crate::worker::WorkerCtx;

/// Everything a connection callback may touch.
pub struct ConnectionCx<'a> {
    pub worker: &'a Rc<WorkerCtx>,
    pub endpoint: &'a mut EndPoint,
    /// Shared handle to the peer itself, for re-arming interests.
    pub peer: &'a PeerRef,
}

impl<'a> ConnectionCx<'a> {
    /// Arms the read interest on the underlying endpoint.
    pub fn want_fill(&mut self) -> crate::Result<()> {
        self.endpoint.want_fill(self.worker, self.peer)
    }

    /// Arms the write interest on the underlying endpoint.
    pub fn want_flush(&mut self) -> crate::Result<()> {
        self.endpoint.want_flush(self.worker, self.peer)
    }

    /// Schedules this peer for teardown on the next loop tick. Safe to
    /// call from inside any connection callback; the actual close runs
    /// once the peer borrow is released.
    pub fn defer_close(&mut self) {
        let worker = Rc::clone(self.worker);
        let peer = Rc::clone(self.peer);
        self.worker
            .scheduler
            .execute_local(move || close(&worker, &peer));
    }
}

/// Protocol-specific state machine driven by endpoint readiness.
pub trait Connection {
    /// The endpoint was accepted and bound; `data_ready` tells whether
    /// inbound bytes are already buffered.
    fn on_open(&mut self, cx: &mut ConnectionCx<'_>, data_ready: bool);

    /// The fd became readable.
    fn on_fillable(&mut self, cx: &mut ConnectionCx<'_>);

    /// The fd became writable.
    fn on_flushable(&mut self, cx: &mut ConnectionCx<'_>);

    /// A read/write interest failed (timeout or transport error).
    fn on_interest_failure(&mut self, cx: &mut ConnectionCx<'_>, error: Error);

    /// The connection is being torn down; last chance to emit protocol
    /// goodbyes (GOAWAY, EndRequest). The endpoint closes right after.
    fn on_close(&mut self, _cx: &mut ConnectionCx<'_>) {}
}

/// Builds protocol connections for a connector; registered by name.
pub trait ConnectionFactory: Send + Sync {
    /// Wire-format name, e.g. `"http/1.1"`, `"h2"` or `"fastcgi"`.
    fn protocol(&self) -> &'static str;

    fn create(&self, worker: &Rc<WorkerCtx>) -> Box<dyn Connection>;
}

/// An accepted socket: endpoint plus its protocol machine, pinned to
/// one worker for its entire lifetime.
pub struct Peer {
    pub endpoint: EndPoint,
    connection: Option<Box<dyn Connection>>,
    /// Worker slab key, for removal on close.
    key: usize,
    closed: bool,
}

pub type PeerRef = Rc<RefCell<Peer>>;

impl Peer {
    pub fn new(endpoint: EndPoint, connection: Box<dyn Connection>) -> Peer {
        Peer {
            endpoint,
            connection: Some(connection),
            key: usize::MAX,
            closed: false,
        }
    }

    pub(crate) fn set_key(&mut self, key: usize) {
        self.key = key;
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

macro_rules! drive {
    ($worker:expr, $peer:expr, |$conn:ident, $cx:ident| $body:expr) => {{
        let mut guard = $peer.borrow_mut();
        let inner = &mut *guard;
        if inner.closed {
            return;
        }
        if let Some($conn) = inner.connection.as_mut() {
            let mut $cx = ConnectionCx {
                worker: $worker,
                endpoint: &mut inner.endpoint,
                peer: $peer,
            };
            $body
        }
    }};
}

pub(crate) fn open(worker: &Rc<WorkerCtx>, peer: &PeerRef, data_ready: bool) {
    drive!(worker, peer, |conn, cx| conn.on_open(&mut cx, data_ready));
}

pub(crate) fn fillable(worker: &Rc<WorkerCtx>, peer: &PeerRef) {
    drive!(worker, peer, |conn, cx| conn.on_fillable(&mut cx));
}

pub(crate) fn flushable(worker: &Rc<WorkerCtx>, peer: &PeerRef) {
    drive!(worker, peer, |conn, cx| conn.on_flushable(&mut cx));
}

/// Re-drives a peer after out-of-band progress, e.g. a handler that
/// completed its channel from a deferred task.
pub fn resume(worker: &Rc<WorkerCtx>, peer: &PeerRef) {
    flushable(worker, peer);
}

pub(crate) fn interest_failure(worker: &Rc<WorkerCtx>, peer: &PeerRef, error: Error) {
    drive!(worker, peer, |conn, cx| conn
        .on_interest_failure(&mut cx, error));
}

/// Tears a peer down: notifies the machine, detaches it, closes the
/// endpoint exactly once and unlinks the peer from its worker.
pub(crate) fn close(worker: &Rc<WorkerCtx>, peer: &PeerRef) {
    let key = {
        let mut guard = peer.borrow_mut();
        let inner = &mut *guard;
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(mut conn) = inner.connection.take() {
            let mut cx = ConnectionCx {
                worker,
                endpoint: &mut inner.endpoint,
                peer,
            };
            conn.on_close(&mut cx);
        }
        inner.endpoint.close(worker);
        inner.key
    };
    worker.release_peer(key);
}
