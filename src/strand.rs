//! Serialized execution context over a shared reactor.
//!
//! When several service threads drive one reactor, handlers routed through a
//! strand never run concurrently: the strand keeps a FIFO queue and at most
//! one drain job in flight on the reactor at a time.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::reactor::{Reactor, Task};

static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_STRAND: Cell<Option<u64>> = const { Cell::new(None) };
}

struct StrandState {
    queue: VecDeque<Task>,
    running: bool,
}

pub(crate) struct Strand {
    id: u64,
    reactor: Arc<Reactor>,
    state: Mutex<StrandState>,
}

impl Strand {
    pub(crate) fn new(reactor: Arc<Reactor>) -> Arc<Self> {
        Arc::new(Strand {
            id: NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed),
            reactor,
            state: Mutex::new(StrandState {
                queue: VecDeque::new(),
                running: false,
            }),
        })
    }

    /// Enqueue a task. Starts a drain job on the reactor when none is
    /// already in flight.
    pub(crate) fn post(self: &Arc<Self>, task: Task) {
        let start_drain = {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(task);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if start_drain {
            let strand = Arc::clone(self);
            self.reactor.post(Box::new(move || strand.drain()));
        }
    }

    /// Run inline when the calling thread is already executing this strand,
    /// otherwise enqueue.
    pub(crate) fn dispatch(self: &Arc<Self>, task: Task) {
        if CURRENT_STRAND.get() == Some(self.id) {
            task();
        } else {
            self.post(task);
        }
    }

    fn drain(self: &Arc<Self>) {
        let prev = CURRENT_STRAND.get();
        CURRENT_STRAND.set(Some(self.id));

        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running = false;
                        break;
                    }
                }
            };
            task();
        }

        CURRENT_STRAND.set(prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_post_order() {
        let reactor = Reactor::new().unwrap();
        let strand = Strand::new(Arc::clone(&reactor));

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            strand.post(Box::new(move || log.lock().unwrap().push(i)));
        }
        reactor.poll_once().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn never_two_tasks_at_once() {
        let reactor = Reactor::new().unwrap();
        let strand = Strand::new(Arc::clone(&reactor));

        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            strand.post(Box::new(move || {
                let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        // Drive the reactor from two threads at once.
        let r1 = Arc::clone(&reactor);
        let t1 = std::thread::spawn(move || {
            for _ in 0..50 {
                r1.poll_once().unwrap();
            }
        });
        let r2 = Arc::clone(&reactor);
        let t2 = std::thread::spawn(move || {
            for _ in 0..50 {
                r2.poll_once().unwrap();
            }
        });
        t1.join().unwrap();
        t2.join().unwrap();
        reactor.poll_once().unwrap();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_inside_strand_runs_inline() {
        let reactor = Reactor::new().unwrap();
        let strand = Strand::new(Arc::clone(&reactor));

        let ordered = Arc::new(Mutex::new(Vec::new()));
        let ordered2 = Arc::clone(&ordered);
        let inner = Arc::clone(&strand);
        strand.post(Box::new(move || {
            ordered2.lock().unwrap().push("outer");
            let ordered3 = Arc::clone(&ordered2);
            inner.dispatch(Box::new(move || ordered3.lock().unwrap().push("inline")));
            ordered2.lock().unwrap().push("after");
        }));

        reactor.poll_once().unwrap();
        assert_eq!(*ordered.lock().unwrap(), vec!["outer", "inline", "after"]);
    }
}
