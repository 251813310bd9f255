//! The per-worker event loop.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::error::{Error, Result};

use super::{Handle, SendTask, Task, Wakeup};

/// Token reserved for the cross-thread waker.
const WAKE: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 1024;

/// I/O interest direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Readable,
    Writable,
}

struct Watcher {
    id: u64,
    fd: RawFd,
    on_ready: Option<Task>,
    on_timeout: Option<Task>,
    timeout_key: Option<(Instant, u64)>,
    handle: Handle,
}

struct TimerEntry {
    task: SendTask,
    handle: Handle,
}

struct Watchers {
    slots: Slab<Watcher>,
    by_fd: HashMap<RawFd, usize>,
    /// Timeout ordering index; makes sweeping k expired watchers O(k log n).
    by_timeout: BTreeMap<(Instant, u64), usize>,
}

struct Shared {
    tasks: Mutex<VecDeque<SendTask>>,
    timers: Mutex<BTreeMap<(Instant, u64), TimerEntry>>,
    /// Watcher slots whose handles were cancelled off-thread; the loop
    /// sweeps them on its next tick.
    cancelled_watchers: Mutex<Vec<(usize, u64)>>,
    waker: mio::Waker,
    /// Live references: pending tasks, timers and watchers. The loop
    /// runs until this reaches zero.
    refs: AtomicUsize,
    break_requested: AtomicBool,
    seq: AtomicU64,
    direct_post: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn ref_(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn unref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            tracing::warn!("scheduler waker failed: {}", err);
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_timer(self: &Arc<Self>, deadline: Instant, task: SendTask) -> Handle {
        let hook_shared = Arc::clone(self);
        let handle = Handle::new(Some(Box::new(move || {
            hook_shared.unref();
            hook_shared.wake();
        })));
        let key = (deadline, self.next_seq());
        self.ref_();
        self.timers.lock().expect("timers lock").insert(
            key,
            TimerEntry {
                task,
                handle: handle.clone(),
            },
        );
        self.wake();
        handle
    }

    fn post(self: &Arc<Self>, task: SendTask) {
        if self.direct_post.load(Ordering::Relaxed) {
            let owner = *self.owner.lock().expect("owner lock");
            if owner == Some(thread::current().id()) {
                // Short-circuit: run inline on the owning thread. Off by
                // default; it runs ahead of tasks already in the queue.
                task();
                return;
            }
        }
        self.ref_();
        self.tasks.lock().expect("tasks lock").push_back(task);
        self.wake();
    }
}

/// Cloneable, `Send` surface of a scheduler: the subset of operations
/// that may be called from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Appends `task` to the task queue; it runs in the next loop tick.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(task));
    }

    pub(crate) fn execute_boxed(&self, task: SendTask) {
        self.shared.post(task);
    }

    /// Runs `task` after `delay`. The returned handle cancels it.
    pub fn execute_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Handle {
        self.shared
            .insert_timer(Instant::now() + delay, Box::new(task))
    }

    /// Runs `task` at the wall-clock time `when` (converted to the
    /// monotonic clock at call time).
    pub fn execute_at(&self, when: SystemTime, task: impl FnOnce() + Send + 'static) -> Handle {
        let delay = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::from_secs(0));
        self.execute_after(delay, task)
    }

    /// Requests `run_loop` to return after the current tick.
    pub fn break_loop(&self) {
        self.shared.break_requested.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    /// Unblocks the multiplexer without queueing work.
    pub fn wakeup_loop(&self) {
        self.shared.wake();
    }

    /// Number of live references (pending tasks, timers, watchers).
    pub fn reference_count(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }
}

/// A single-threaded cooperative event loop.
///
/// All methods besides the ones mirrored on [`SchedulerHandle`] must be
/// called from the thread that runs the loop.
pub struct Scheduler {
    shared: Arc<Shared>,
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    watchers: RefCell<Watchers>,
    local_tasks: RefCell<VecDeque<Task>>,
    now: Cell<Instant>,
}

impl Scheduler {
    pub fn new() -> io::Result<Scheduler> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE)?;
        Ok(Scheduler {
            shared: Arc::new(Shared {
                tasks: Mutex::new(VecDeque::new()),
                timers: Mutex::new(BTreeMap::new()),
                cancelled_watchers: Mutex::new(Vec::new()),
                waker,
                refs: AtomicUsize::new(0),
                break_requested: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                direct_post: AtomicBool::new(false),
                owner: Mutex::new(Some(thread::current().id())),
            }),
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(EVENT_CAPACITY)),
            watchers: RefCell::new(Watchers {
                slots: Slab::new(),
                by_fd: HashMap::new(),
                by_timeout: BTreeMap::new(),
            }),
            local_tasks: RefCell::new(VecDeque::new()),
            now: Cell::new(Instant::now()),
        })
    }

    /// A cloneable cross-thread handle.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current cached monotonic time, refreshed each tick.
    pub fn now(&self) -> Instant {
        self.now.get()
    }

    /// Refreshes the cached monotonic time; call before registering
    /// deadline-relative work from outside a loop tick.
    pub fn update_time(&self) {
        self.now.set(Instant::now());
    }

    /// Enables the direct-call short-circuit for same-thread posts.
    /// Default off: it runs posted tasks ahead of already-queued ones.
    pub fn set_direct_post(&self, enabled: bool) {
        self.shared.direct_post.store(enabled, Ordering::Relaxed);
    }

    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(task));
    }

    /// Queues a loop-thread task. Unlike [`execute`](Self::execute) the
    /// closure need not be `Send`; it can hold connection state.
    pub fn execute_local(&self, task: impl FnOnce() + 'static) {
        self.shared.ref_();
        self.local_tasks.borrow_mut().push_back(Box::new(task));
    }

    pub fn execute_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Handle {
        self.handle().execute_after(delay, task)
    }

    pub fn execute_at(&self, when: SystemTime, task: impl FnOnce() + Send + 'static) -> Handle {
        self.handle().execute_at(when, task)
    }

    /// Registers interest in `fd` becoming readable. `timeout` of zero
    /// means no timeout. Fails with `AlreadyWatchingOnResource` when the
    /// fd is already being watched in either mode.
    pub fn execute_on_readable(
        &self,
        fd: RawFd,
        on_ready: impl FnOnce() + 'static,
        timeout: Duration,
        on_timeout: impl FnOnce() + 'static,
    ) -> Result<Handle> {
        self.setup_watcher(fd, Mode::Readable, Box::new(on_ready), timeout, Box::new(on_timeout))
    }

    /// Writable-interest counterpart of [`execute_on_readable`](Self::execute_on_readable).
    pub fn execute_on_writable(
        &self,
        fd: RawFd,
        on_ready: impl FnOnce() + 'static,
        timeout: Duration,
        on_timeout: impl FnOnce() + 'static,
    ) -> Result<Handle> {
        self.setup_watcher(fd, Mode::Writable, Box::new(on_ready), timeout, Box::new(on_timeout))
    }

    /// Runs `task` once `wakeup`'s generation advances past `generation`.
    pub fn execute_on_wakeup(
        &self,
        task: impl FnOnce() + Send + 'static,
        wakeup: &Wakeup,
        generation: u64,
    ) {
        wakeup.wait(generation, Box::new(task), self.handle());
    }

    /// Cancels all watchers for `fd` and forgets its registration.
    pub fn cancel_fd(&self, fd: RawFd) {
        let mut watchers = self.watchers.borrow_mut();
        if let Some(slot) = watchers.by_fd.remove(&fd) {
            let watcher = watchers.slots.remove(slot);
            if let Some(key) = watcher.timeout_key {
                watchers.by_timeout.remove(&key);
            }
            let _ = self
                .poll
                .borrow()
                .registry()
                .deregister(&mut SourceFd(&watcher.fd));
            if watcher.handle.cancel_silent() {
                self.shared.unref();
            }
        }
    }

    /// Whether a watcher is currently registered for `fd`.
    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.watchers.borrow().by_fd.contains_key(&fd)
    }

    pub fn reference_count(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }

    /// Runs the loop until no references remain or `break_loop` is
    /// called. A break requested before entry still takes effect.
    pub fn run_loop(&self) {
        *self.shared.owner.lock().expect("owner lock") = Some(thread::current().id());
        while self.shared.refs.load(Ordering::SeqCst) > 0
            && !self.shared.break_requested.swap(false, Ordering::SeqCst)
        {
            self.run_loop_once();
        }
    }

    /// One iteration: sleep until work is due, then run everything due.
    pub fn run_loop_once(&self) {
        self.sweep_cancelled_watchers();

        let timeout = self.next_poll_timeout();
        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::error!("poll failed: {}", err);
                    return;
                }
            }
        }
        self.now.set(Instant::now());

        // Ordering per tick: expired timers and watcher timeouts first,
        // then ready-fd tasks, then the drained task queue.
        let due_timers = self.collect_due_timers();
        let mut fired = self.collect_ready_watchers();
        let timed_out = self.collect_timed_out_watchers();

        for task in due_timers {
            task();
        }
        for task in timed_out {
            task();
        }
        for task in fired.drain(..) {
            task();
        }

        let remote: Vec<SendTask> = {
            let mut tasks = self.shared.tasks.lock().expect("tasks lock");
            tasks.drain(..).collect()
        };
        for task in remote {
            task();
            self.shared.unref();
        }
        let local: Vec<Task> = {
            let mut tasks = self.local_tasks.borrow_mut();
            tasks.drain(..).collect()
        };
        for task in local {
            task();
            self.shared.unref();
        }
    }

    fn setup_watcher(
        &self,
        fd: RawFd,
        mode: Mode,
        on_ready: Task,
        timeout: Duration,
        on_timeout: Task,
    ) -> Result<Handle> {
        let mut guard = self.watchers.borrow_mut();
        let watchers = &mut *guard;
        if watchers.by_fd.contains_key(&fd) {
            return Err(Error::new_already_watching());
        }

        let interest = match mode {
            Mode::Readable => Interest::READABLE,
            Mode::Writable => Interest::WRITABLE,
        };
        let entry = watchers.slots.vacant_entry();
        let slot = entry.key();
        self.poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), Token(slot), interest)
            .map_err(Error::new_io)?;

        let id = self.shared.next_seq();
        let hook_shared = Arc::clone(&self.shared);
        let handle = Handle::new(Some(Box::new(move || {
            hook_shared
                .cancelled_watchers
                .lock()
                .expect("cancel lock")
                .push((slot, id));
            hook_shared.unref();
            hook_shared.wake();
        })));

        let timeout_key = if timeout > Duration::from_secs(0) {
            let key = (Instant::now() + timeout, self.shared.next_seq());
            watchers.by_timeout.insert(key, slot);
            Some(key)
        } else {
            None
        };

        entry.insert(Watcher {
            id,
            fd,
            on_ready: Some(on_ready),
            on_timeout: Some(on_timeout),
            timeout_key,
            handle: handle.clone(),
        });
        watchers.by_fd.insert(fd, slot);
        self.shared.ref_();
        Ok(handle)
    }

    /// Removes a watcher slot and its index entries, deregistering the fd.
    fn remove_watcher(&self, watchers: &mut Watchers, slot: usize) -> Watcher {
        let watcher = watchers.slots.remove(slot);
        watchers.by_fd.remove(&watcher.fd);
        if let Some(key) = watcher.timeout_key {
            watchers.by_timeout.remove(&key);
        }
        let _ = self
            .poll
            .borrow()
            .registry()
            .deregister(&mut SourceFd(&watcher.fd));
        watcher
    }

    fn sweep_cancelled_watchers(&self) {
        let cancelled: Vec<(usize, u64)> = {
            let mut list = self
                .shared
                .cancelled_watchers
                .lock()
                .expect("cancel lock");
            list.drain(..).collect()
        };
        if cancelled.is_empty() {
            return;
        }
        let mut watchers = self.watchers.borrow_mut();
        for (slot, id) in cancelled {
            let matches = watchers
                .slots
                .get(slot)
                .map(|w| w.id == id)
                .unwrap_or(false);
            if matches {
                self.remove_watcher(&mut watchers, slot);
            }
        }
    }

    fn collect_ready_watchers(&self) -> Vec<Task> {
        let mut ready = Vec::new();
        let events = self.events.borrow();
        let mut watchers = self.watchers.borrow_mut();
        for event in events.iter() {
            let token = event.token();
            if token == WAKE {
                continue;
            }
            let slot = token.0;
            if !watchers.slots.contains(slot) {
                continue;
            }
            let fire = watchers.slots[slot].handle.try_fire();
            let mut watcher = self.remove_watcher(&mut watchers, slot);
            if fire {
                if let Some(task) = watcher.on_ready.take() {
                    ready.push(task);
                }
                self.shared.unref();
            }
        }
        ready
    }

    fn collect_timed_out_watchers(&self) -> Vec<Task> {
        let now = self.now.get();
        let mut timed_out = Vec::new();
        let mut watchers = self.watchers.borrow_mut();
        loop {
            let (key, slot) = match watchers.by_timeout.iter().next() {
                Some((key, slot)) if key.0 <= now => (*key, *slot),
                _ => break,
            };
            watchers.by_timeout.remove(&key);
            if !watchers.slots.contains(slot) {
                continue;
            }
            let fire = watchers.slots[slot].handle.try_fire();
            let mut watcher = self.remove_watcher(&mut watchers, slot);
            if fire {
                if let Some(task) = watcher.on_timeout.take() {
                    timed_out.push(task);
                }
                self.shared.unref();
            }
        }
        timed_out
    }

    fn collect_due_timers(&self) -> Vec<SendTask> {
        let now = self.now.get();
        let mut due = Vec::new();
        {
            let mut timers = self.shared.timers.lock().expect("timers lock");
            loop {
                let key = match timers.keys().next() {
                    Some(key) if key.0 <= now => *key,
                    _ => break,
                };
                let entry = timers.remove(&key).expect("timer entry");
                due.push(entry);
            }
        }
        let mut tasks = Vec::with_capacity(due.len());
        for entry in due {
            if entry.handle.try_fire() {
                tasks.push(entry.task);
                self.shared.unref();
            }
        }
        tasks
    }

    fn next_poll_timeout(&self) -> Option<Duration> {
        if !self.local_tasks.borrow().is_empty() {
            return Some(Duration::from_secs(0));
        }
        if !self.shared.tasks.lock().expect("tasks lock").is_empty() {
            return Some(Duration::from_secs(0));
        }
        let now = Instant::now();
        let timer_deadline = self
            .shared
            .timers
            .lock()
            .expect("timers lock")
            .keys()
            .next()
            .map(|key| key.0);
        let watcher_deadline = self
            .watchers
            .borrow()
            .by_timeout
            .keys()
            .next()
            .map(|key| key.0);
        let deadline = match (timer_deadline, watcher_deadline) {
            (Some(t), Some(w)) => Some(t.min(w)),
            (Some(t), None) => Some(t),
            (None, Some(w)) => Some(w),
            (None, None) => None,
        };
        deadline.map(|deadline| deadline.saturating_duration_since(now))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("refs", &self.reference_count())
            .field("watchers", &self.watchers.borrow().slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::mpsc;

    fn sched() -> Scheduler {
        Scheduler::new().expect("scheduler")
    }

    #[test]
    fn tasks_run_fifo() {
        let s = sched();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let order = Rc::clone(&order);
            s.execute_local(move || order.borrow_mut().push(i));
        }
        s.run_loop();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let s = sched();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        // scheduled in reverse deadline order
        s.execute_after(Duration::from_millis(40), move || {
            o1.lock().unwrap().push("late")
        });
        s.execute_after(Duration::from_millis(10), move || {
            o2.lock().unwrap().push("early")
        });
        s.run_loop();
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
        assert_eq!(s.reference_count(), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let s = sched();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            s.execute_after(Duration::from_millis(20), move || {
                order.lock().unwrap().push(i)
            });
        }
        s.run_loop();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancelled_timer_never_fires_and_releases_reference() {
        let s = sched();
        let before = s.reference_count();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = s.execute_after(Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst)
        });
        assert_eq!(s.reference_count(), before + 1);
        handle.cancel();
        assert_eq!(s.reference_count(), before);
        s.run_loop();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn duplicate_watcher_fails() {
        let s = sched();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        let _h = s
            .execute_on_readable(fd, || {}, Duration::from_secs(0), || {})
            .unwrap();
        let again = s.execute_on_readable(fd, || {}, Duration::from_secs(0), || {});
        assert!(again.unwrap_err().is_already_watching());
        let other_mode = s.execute_on_writable(fd, || {}, Duration::from_secs(0), || {});
        assert!(other_mode.unwrap_err().is_already_watching());
        s.cancel_fd(fd);
        assert_eq!(s.reference_count(), 0);
    }

    #[test]
    fn readable_watcher_fires_on_data() {
        let s = sched();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        s.execute_on_readable(
            fd,
            move || flag.set(true),
            Duration::from_secs(5),
            || panic!("unexpected timeout"),
        )
        .unwrap();
        use std::io::Write;
        b.write_all(b"x").unwrap();
        s.run_loop();
        assert!(fired.get());
        assert!(!s.is_watching(fd));
    }

    #[test]
    fn shorter_timeout_breaks_in_before_longer() {
        let s = sched();
        let (a, _keep_a) = UnixStream::pair().unwrap();
        let (b, _keep_b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let started = Instant::now();

        let o = Rc::clone(&order);
        s.execute_on_readable(
            a.as_raw_fd(),
            || panic!("a never readable"),
            Duration::from_millis(500),
            move || o.borrow_mut().push(("a", started.elapsed())),
        )
        .unwrap();
        let o = Rc::clone(&order);
        s.execute_on_readable(
            b.as_raw_fd(),
            || panic!("b never readable"),
            Duration::from_millis(100),
            move || o.borrow_mut().push(("b", started.elapsed())),
        )
        .unwrap();

        s.run_loop();
        let order = order.borrow();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].0, "b");
        assert_eq!(order[1].0, "a");
        assert!(order[0].1 >= Duration::from_millis(50), "b too early: {:?}", order[0].1);
        assert!(order[0].1 <= Duration::from_millis(250), "b too late: {:?}", order[0].1);
        assert!(order[1].1 >= Duration::from_millis(450), "a too early: {:?}", order[1].1);
        assert!(order[1].1 <= Duration::from_millis(650), "a too late: {:?}", order[1].1);
    }

    #[test]
    fn cross_thread_execute_wakes_loop() {
        let s = sched();
        let handle = s.handle();
        let (tx, rx) = mpsc::channel();
        // anchor keeps the loop alive until the cross-thread post lands
        let anchor = s.execute_after(Duration::from_secs(5), || {});
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let anchor = anchor;
            handle.execute(move || {
                tx.send(()).unwrap();
                anchor.cancel();
            });
        });
        s.run_loop();
        poster.join().unwrap();
        rx.try_recv().expect("task ran");
    }

    #[test]
    fn break_loop_stops_promptly() {
        let s = sched();
        let handle = s.handle();
        let _anchor = s.execute_after(Duration::from_secs(60), || {});
        let breaker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.break_loop();
        });
        let started = Instant::now();
        s.run_loop();
        breaker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wakeup_generation_gates_firing() {
        let s = sched();
        let wakeup = Arc::new(Wakeup::new());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let gen = wakeup.generation();
        s.execute_on_wakeup(move || flag.store(true, Ordering::SeqCst), &wakeup, gen);
        // not yet woken: nothing queued
        assert_eq!(s.reference_count(), 0);
        wakeup.wakeup();
        s.run_loop();
        assert!(fired.load(Ordering::SeqCst));
    }
}
