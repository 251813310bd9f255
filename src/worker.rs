//! Worker: one OS thread owning one scheduler plus its connections.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use slab::Slab;

use crate::executor::{Scheduler, SchedulerHandle};
use crate::fileinfo::FileInfoCache;
use crate::net::connection::{self, Connection, Peer, PeerRef};
use crate::net::endpoint::EndPoint;
use crate::server::ServerShared;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Inactive,
    Running,
    Suspended,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<WorkerCtx>>> = RefCell::new(None);
}

/// Sliding-window event counter: per-minute buckets over 15 minutes.
struct SlidingCounter {
    buckets: [u64; Self::WINDOW_MINUTES],
    epoch: Instant,
    last_minute: u64,
}

impl SlidingCounter {
    const WINDOW_MINUTES: usize = 15;

    fn new() -> SlidingCounter {
        SlidingCounter {
            buckets: [0; Self::WINDOW_MINUTES],
            epoch: Instant::now(),
            last_minute: 0,
        }
    }

    fn minute(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_secs() / 60
    }

    /// Zeroes buckets the window rotated past since the last touch.
    fn rotate(&mut self, now: Instant) {
        let minute = self.minute(now);
        let stale = (minute - self.last_minute).min(Self::WINDOW_MINUTES as u64);
        for i in 0..stale {
            let idx = ((self.last_minute + 1 + i) as usize) % Self::WINDOW_MINUTES;
            self.buckets[idx] = 0;
        }
        self.last_minute = minute;
    }

    fn incr(&mut self, now: Instant) {
        self.rotate(now);
        self.buckets[(self.last_minute as usize) % Self::WINDOW_MINUTES] += 1;
    }

    fn sum(&mut self, now: Instant) -> u64 {
        self.rotate(now);
        self.buckets.iter().sum()
    }
}

/// Cross-thread worker data: counters and lifecycle control.
pub(crate) struct WorkerShared {
    pub(crate) id: usize,
    state: Mutex<WorkerState>,
    resumed: Condvar,
    suspend_requested: AtomicBool,
    stop_requested: AtomicBool,
    connection_load: AtomicUsize,
    request_count: AtomicU64,
    performance: Mutex<SlidingCounter>,
}

impl WorkerShared {
    fn new(id: usize) -> WorkerShared {
        WorkerShared {
            id,
            state: Mutex::new(WorkerState::Inactive),
            resumed: Condvar::new(),
            suspend_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            connection_load: AtomicUsize::new(0),
            request_count: AtomicU64::new(0),
            performance: Mutex::new(SlidingCounter::new()),
        }
    }
}

/// The thread-bound bundle every connection callback can reach: the
/// scheduler, the live peer set, per-worker caches and the server.
pub struct WorkerCtx {
    pub id: usize,
    pub scheduler: Scheduler,
    pub server: Arc<ServerShared>,
    peers: RefCell<Slab<PeerRef>>,
    pub fileinfo: RefCell<FileInfoCache>,
    shared: Arc<WorkerShared>,
}

impl WorkerCtx {
    /// The context of the worker running the current thread.
    ///
    /// # Panics
    ///
    /// Outside a worker thread.
    pub fn current() -> Rc<WorkerCtx> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(Rc::clone)
                .expect("not on a worker thread")
        })
    }

    /// Takes ownership of an accepted endpoint + machine, making it a
    /// live peer of this worker.
    pub fn adopt_peer(
        self: &Rc<WorkerCtx>,
        endpoint: EndPoint,
        machine: Box<dyn Connection>,
    ) -> PeerRef {
        let peer: PeerRef = Rc::new(RefCell::new(Peer::new(endpoint, machine)));
        let key = self.peers.borrow_mut().insert(Rc::clone(&peer));
        peer.borrow_mut().set_key(key);
        self.shared.connection_load.fetch_add(1, Ordering::Relaxed);
        self.server.hooks.connection_open();
        tracing::debug!(worker = self.id, key, "connection adopted");
        peer
    }

    pub(crate) fn release_peer(&self, key: usize) {
        let mut peers = self.peers.borrow_mut();
        if peers.contains(key) {
            peers.remove(key);
            self.shared.connection_load.fetch_sub(1, Ordering::Relaxed);
            self.server.hooks.connection_close();
            tracing::debug!(worker = self.id, key, "connection released");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.peers.borrow().len()
    }

    /// Counts one handled request into both counters.
    pub fn note_request(&self) {
        self.shared.request_count.fetch_add(1, Ordering::Relaxed);
        self.shared
            .performance
            .lock()
            .expect("perf lock")
            .incr(Instant::now());
    }

    /// Closes every live peer; used by forced shutdown.
    pub(crate) fn close_all_peers(self: &Rc<WorkerCtx>) {
        let peers: Vec<PeerRef> = self.peers.borrow().iter().map(|(_, p)| Rc::clone(p)).collect();
        for peer in peers {
            connection::close(self, &peer);
        }
    }

    /// Drops every cached file-metadata entry.
    pub fn cycle_caches(&self) {
        self.fileinfo.borrow_mut().invalidate_all();
    }
}

/// Cloneable cross-thread reference to a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    scheduler: SchedulerHandle,
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Posts a closure that runs on the worker thread with its context.
    pub fn post(&self, task: impl FnOnce(&Rc<WorkerCtx>) + Send + 'static) {
        self.scheduler.execute(move || {
            let ctx = WorkerCtx::current();
            task(&ctx);
        });
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock().expect("state lock")
    }

    pub fn connection_load(&self) -> usize {
        self.shared.connection_load.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.shared.request_count.load(Ordering::Relaxed)
    }

    /// Requests handled within the trailing 15-minute window.
    pub fn recent_request_count(&self) -> u64 {
        self.shared
            .performance
            .lock()
            .expect("perf lock")
            .sum(Instant::now())
    }

    /// Parks the worker at its next cooperative point until `resume`.
    pub fn suspend(&self) {
        self.shared.suspend_requested.store(true, Ordering::SeqCst);
        self.scheduler.execute({
            let shared = Arc::clone(&self.shared);
            move || {
                // runs on the worker thread: wait here, inside the loop
                let mut state = shared.state.lock().expect("state lock");
                *state = WorkerState::Suspended;
                while shared.suspend_requested.load(Ordering::SeqCst) {
                    state = shared.resumed.wait(state).expect("state lock");
                }
                *state = WorkerState::Running;
            }
        });
    }

    pub fn resume(&self) {
        self.shared.suspend_requested.store(false, Ordering::SeqCst);
        self.shared.resumed.notify_all();
    }

    /// Asks the loop to finish once its peer set drains.
    pub(crate) fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.scheduler.wakeup_loop();
    }
}

/// A spawned worker thread.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread and waits for its scheduler to come up.
    pub fn spawn(
        id: usize,
        server: Arc<ServerShared>,
        pin_cpu: Option<usize>,
    ) -> io::Result<Worker> {
        let shared = Arc::new(WorkerShared::new(id));
        let thread_shared = Arc::clone(&shared);
        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("strand-worker/{}", id))
            .spawn(move || {
                if let Some(cpu) = pin_cpu {
                    pin_to_cpu(cpu);
                }
                let scheduler = match Scheduler::new() {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::error!(worker = id, "scheduler setup failed: {}", err);
                        drop(tx);
                        return;
                    }
                };
                let ctx = Rc::new(WorkerCtx {
                    id,
                    server: Arc::clone(&server),
                    fileinfo: RefCell::new(server.new_fileinfo_cache()),
                    peers: RefCell::new(Slab::new()),
                    shared: Arc::clone(&thread_shared),
                    scheduler,
                });
                CURRENT.with(|current| *current.borrow_mut() = Some(Rc::clone(&ctx)));
                let _ = tx.send(ctx.scheduler.handle());

                *thread_shared.state.lock().expect("state lock") = WorkerState::Running;
                server.hooks.worker_spawn(id);
                tracing::debug!(worker = id, "running");

                loop {
                    ctx.scheduler.run_loop_once();
                    if thread_shared.stop_requested.load(Ordering::SeqCst)
                        && ctx.peers.borrow().is_empty()
                    {
                        break;
                    }
                }

                server.hooks.worker_unspawn(id);
                *thread_shared.state.lock().expect("state lock") = WorkerState::Inactive;
                CURRENT.with(|current| current.borrow_mut().take());
                tracing::debug!(worker = id, "stopped");
            })?;

        let scheduler = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "worker failed to start"))?;
        Ok(Worker {
            handle: WorkerHandle { scheduler, shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> usize {
        self.handle.id()
    }

    pub(crate) fn stop_and_join(&mut self) {
        self.handle.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(cpu, "sched_setaffinity failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sliding_counter_rotates_stale_buckets() {
        let mut counter = SlidingCounter::new();
        let t0 = counter.epoch;
        counter.incr(t0);
        counter.incr(t0 + Duration::from_secs(30));
        assert_eq!(counter.sum(t0 + Duration::from_secs(59)), 2);
        // five minutes later both events are still inside the window
        assert_eq!(counter.sum(t0 + Duration::from_secs(300)), 2);
        // sixteen minutes later the window rotated past them
        assert_eq!(counter.sum(t0 + Duration::from_secs(16 * 60)), 0);
    }

    #[test]
    fn sliding_counter_keeps_full_window() {
        let mut counter = SlidingCounter::new();
        let t0 = counter.epoch;
        for minute in 0..15 {
            counter.incr(t0 + Duration::from_secs(minute * 60));
        }
        assert_eq!(counter.sum(t0 + Duration::from_secs(14 * 60 + 30)), 15);
    }
}
