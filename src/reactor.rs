//! Readiness reactor: a mio `Poll` multiplexing socket readiness onto
//! registered handlers, plus a multi-consumer task queue and a timer heap.
//!
//! Several service threads may drive one reactor concurrently. Exactly one
//! thread polls at a time; the others serve the task queue. Readiness is
//! edge-triggered, so handlers retry their syscalls until `WouldBlock`
//! before parking again.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type TimerCallback = Box<dyn FnOnce(bool) + Send + 'static>;

const WAKER_TOKEN: Token = Token(0);
const FIRST_SOURCE_TOKEN: usize = 1;
const EVENTS_CAPACITY: usize = 1024;
/// Upper bound on a blocking poll so the stop flag is always observed.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// How long a non-polling worker parks on the task queue per round.
const PARKED_WORKER_TIMEOUT: Duration = Duration::from_millis(10);

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_REACTOR: Cell<Option<u64>> = const { Cell::new(None) };
}

/// A socket endpoint registered with a reactor. `on_ready` runs on a thread
/// currently driving the reactor.
pub(crate) trait IoSource: Send + Sync {
    fn on_ready(self: Arc<Self>, readable: bool, writable: bool);
}

#[derive(PartialEq, Eq)]
struct TimerSlot {
    deadline: Instant,
    id: u64,
}

impl Ord for TimerSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for TimerSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerState {
    heap: BinaryHeap<Reverse<TimerSlot>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,
}

/// A single event loop. Opaque outside the crate; construct one to share
/// it across services via [`Service::with_reactor`](crate::Service::with_reactor).
pub struct Reactor {
    id: u64,
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    task_tx: Sender<Task>,
    task_rx: Receiver<Task>,
    sources: Mutex<HashMap<Token, Weak<dyn IoSource>>>,
    next_token: AtomicUsize,
    timers: Mutex<TimerState>,
    stopped: AtomicBool,
}

impl Reactor {
    /// Create a standalone reactor.
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (task_tx, task_rx) = crossbeam_channel::unbounded();

        Ok(Arc::new(Reactor {
            id: NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
            poll: Mutex::new(poll),
            registry,
            waker,
            task_tx,
            task_rx,
            sources: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(FIRST_SOURCE_TOKEN),
            timers: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                callbacks: HashMap::new(),
                next_id: 1,
            }),
            stopped: AtomicBool::new(false),
        }))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the reactor: `run` returns once the current round completes.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Enqueue a task and wake the poller.
    pub(crate) fn post(&self, task: Task) {
        let _ = self.task_tx.send(task);
        let _ = self.waker.wake();
    }

    /// Run a task inline when the calling thread is currently driving this
    /// reactor, otherwise enqueue it.
    pub(crate) fn dispatch(&self, task: Task) {
        if CURRENT_REACTOR.get() == Some(self.id) {
            task();
        } else {
            self.post(task);
        }
    }

    /// Register a socket for readiness events.
    pub(crate) fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interests: Interest,
        handler: Weak<dyn IoSource>,
    ) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.registry.register(source, token, interests)?;
        self.sources.lock().unwrap().insert(token, handler);
        Ok(token)
    }

    /// Remove a socket from the reactor. Pending events for the token are
    /// dropped at dispatch.
    pub(crate) fn deregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.sources.lock().unwrap().remove(&token);
        self.registry.deregister(source)
    }

    /// Schedule a timer callback. The callback receives `false` on expiry
    /// and `true` when canceled.
    pub(crate) fn schedule_timer(&self, deadline: Instant, cb: TimerCallback) -> u64 {
        let id = {
            let mut timers = self.timers.lock().unwrap();
            let id = timers.next_id;
            timers.next_id += 1;
            timers.heap.push(Reverse(TimerSlot { deadline, id }));
            timers.callbacks.insert(id, cb);
            id
        };
        // Re-evaluate the poll timeout against the new deadline.
        let _ = self.waker.wake();
        id
    }

    /// Cancel a scheduled timer. The stored callback fires with
    /// `canceled = true` on the reactor. Returns false when the timer
    /// already fired or was already canceled.
    pub(crate) fn cancel_timer(&self, id: u64) -> bool {
        let cb = self.timers.lock().unwrap().callbacks.remove(&id);
        match cb {
            Some(cb) => {
                self.dispatch(Box::new(move || cb(true)));
                true
            }
            None => false,
        }
    }

    /// Drive the reactor until stopped.
    pub(crate) fn run(&self) -> io::Result<()> {
        let _guard = EnterGuard::new(self.id);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.is_stopped() {
            self.drain_tasks();
            if self.is_stopped() {
                break;
            }

            match self.poll.try_lock() {
                Ok(mut poll) => {
                    match poll.poll(&mut events, Some(self.poll_timeout())) {
                        Ok(()) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                    drop(poll);
                    self.dispatch_events(&events);
                    self.fire_due_timers();
                }
                Err(_) => {
                    // Another thread is polling; serve the task queue.
                    if let Ok(task) = self.task_rx.recv_timeout(PARKED_WORKER_TIMEOUT) {
                        task();
                    }
                }
            }
        }
        Ok(())
    }

    /// Single non-blocking pass: tasks, readiness, timers.
    pub(crate) fn poll_once(&self) -> io::Result<()> {
        let _guard = EnterGuard::new(self.id);
        self.drain_tasks();

        if let Ok(mut poll) = self.poll.try_lock() {
            let mut events = Events::with_capacity(EVENTS_CAPACITY);
            match poll.poll(&mut events, Some(Duration::ZERO)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(e),
            }
            drop(poll);
            self.dispatch_events(&events);
            self.fire_due_timers();
        }
        Ok(())
    }

    fn drain_tasks(&self) {
        while let Ok(task) = self.task_rx.try_recv() {
            task();
        }
    }

    fn poll_timeout(&self) -> Duration {
        let timers = self.timers.lock().unwrap();
        let now = Instant::now();
        match timers.heap.peek() {
            Some(Reverse(slot)) => slot
                .deadline
                .saturating_duration_since(now)
                .min(MAX_POLL_TIMEOUT),
            None => MAX_POLL_TIMEOUT,
        }
    }

    fn dispatch_events(&self, events: &Events) {
        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            let handler = {
                let mut sources = self.sources.lock().unwrap();
                match sources.get(&token) {
                    Some(weak) => match weak.upgrade() {
                        Some(handler) => Some(handler),
                        None => {
                            sources.remove(&token);
                            None
                        }
                    },
                    None => None,
                }
            };

            if let Some(handler) = handler {
                // Closed and error states are folded into readiness so the
                // endpoint discovers them from the syscall result.
                let broken = event.is_error() || event.is_read_closed() || event.is_write_closed();
                let readable = event.is_readable() || broken;
                let writable = event.is_writable() || broken;
                handler.on_ready(readable, writable);
            }
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        let mut due: Vec<TimerCallback> = Vec::new();
        {
            let mut timers = self.timers.lock().unwrap();
            while let Some(Reverse(slot)) = timers.heap.peek() {
                if slot.deadline > now {
                    break;
                }
                let id = slot.id;
                timers.heap.pop();
                if let Some(cb) = timers.callbacks.remove(&id) {
                    due.push(cb);
                }
            }
        }
        for cb in due {
            cb(false);
        }
    }
}

struct EnterGuard {
    prev: Option<u64>,
}

impl EnterGuard {
    fn new(id: u64) -> Self {
        let prev = CURRENT_REACTOR.get();
        CURRENT_REACTOR.set(Some(id));
        EnterGuard { prev }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT_REACTOR.set(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn posted_tasks_run_in_order() {
        let reactor = Reactor::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = Arc::clone(&log);
            reactor.post(Box::new(move || log.lock().unwrap().push(i)));
        }
        reactor.poll_once().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn dispatch_runs_inline_on_reactor_thread() {
        let reactor = Reactor::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let inner = Arc::clone(&reactor);
        let ran2 = Arc::clone(&ran);
        reactor.post(Box::new(move || {
            // We are on the reactor thread now; dispatch must run inline.
            let ran3 = Arc::clone(&ran2);
            inner.dispatch(Box::new(move || ran3.store(true, Ordering::SeqCst)));
            assert!(ran2.load(Ordering::SeqCst));
        }));
        reactor.poll_once().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn timer_fires_and_cancel_reports_canceled() {
        let reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let canceled = Arc::new(AtomicBool::new(false));

        let f = Arc::clone(&fired);
        reactor.schedule_timer(
            Instant::now(),
            Box::new(move |c| {
                assert!(!c);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let c = Arc::clone(&canceled);
        let id = reactor.schedule_timer(
            Instant::now() + Duration::from_secs(60),
            Box::new(move |was_canceled| c.store(was_canceled, Ordering::SeqCst)),
        );

        assert!(reactor.cancel_timer(id));
        assert!(!reactor.cancel_timer(id));

        reactor.poll_once().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(canceled.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_unblocks_run() {
        let reactor = Reactor::new().unwrap();
        let r = Arc::clone(&reactor);
        let handle = std::thread::spawn(move || r.run());
        std::thread::sleep(Duration::from_millis(20));
        reactor.stop();
        handle.join().unwrap().unwrap();
    }
}
