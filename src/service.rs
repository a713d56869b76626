//! The I/O service: a pool of reactors driven by worker threads.
//!
//! Two threading models, chosen at construction:
//!
//! 1. One reactor per thread. Every endpoint is pinned to a single reactor
//!    (round-robin at construction), so its callbacks are naturally
//!    serialized.
//! 2. One shared reactor driven by all threads. Handlers are routed through
//!    a [`Strand`] so they never run concurrently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, trace};

use crate::counter;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::strand::Strand;

/// Service lifecycle and worker-thread callbacks. All methods have no-op
/// defaults except `on_idle`, which yields.
pub trait ServiceHandler: Send + Sync + 'static {
    /// A worker thread is starting. Set priority or affinity here.
    fn on_thread_init(&self) {}
    /// A worker thread is exiting.
    fn on_thread_cleanup(&self) {}
    /// The service observed the started state.
    fn on_started(&self) {}
    /// The service observed the stopped state.
    fn on_stopped(&self) {}
    /// Called after every poll pass in polling mode.
    fn on_idle(&self) {
        thread::yield_now();
    }
    /// A non-benign error escaped a worker loop.
    fn on_error(&self, _code: i32, _category: &str, _message: &str) {}
}

/// Default handler with every callback at its default.
pub struct DefaultServiceHandler;

impl ServiceHandler for DefaultServiceHandler {}

/// Multi-threaded I/O service owning one or more reactors.
pub struct Service {
    handler: Arc<dyn ServiceHandler>,
    reactors: Mutex<Vec<Arc<Reactor>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    strand: Mutex<Option<Arc<Strand>>>,
    strand_needed: bool,
    num_threads: usize,
    polling: AtomicBool,
    started: AtomicBool,
    rr_idx: AtomicUsize,
}

impl Service {
    /// Create a service with `num_threads` workers.
    ///
    /// With `own_io == false` each worker drives its own reactor; with
    /// `own_io == true` a single reactor is shared by every worker and a
    /// strand serializes handler execution. `num_threads == 0` yields one
    /// reactor and no workers; progress then depends on the caller driving
    /// the service (start/stop run their control tasks inline).
    pub fn new(
        handler: Arc<dyn ServiceHandler>,
        num_threads: usize,
        own_io: bool,
    ) -> Result<Arc<Self>, Error> {
        let reactor_count = if num_threads == 0 || own_io {
            1
        } else {
            num_threads
        };

        let mut reactors = Vec::with_capacity(reactor_count);
        for _ in 0..reactor_count {
            reactors.push(Reactor::new()?);
        }

        let strand_needed = num_threads >= 1 && own_io;
        let strand = if strand_needed {
            Some(Strand::new(Arc::clone(&reactors[0])))
        } else {
            None
        };

        Ok(Arc::new(Service {
            handler,
            reactors: Mutex::new(reactors),
            threads: Mutex::new(Vec::new()),
            strand: Mutex::new(strand),
            strand_needed,
            num_threads,
            polling: AtomicBool::new(false),
            started: AtomicBool::new(false),
            rr_idx: AtomicUsize::new(0),
        }))
    }

    /// Create a service over an externally owned reactor. `strands`
    /// requests handler serialization for callers that drive the reactor
    /// from several threads.
    pub fn with_reactor(
        handler: Arc<dyn ServiceHandler>,
        reactor: Arc<Reactor>,
        strands: bool,
    ) -> Arc<Self> {
        let strand = if strands {
            Some(Strand::new(Arc::clone(&reactor)))
        } else {
            None
        };
        Arc::new(Service {
            handler,
            reactors: Mutex::new(vec![reactor]),
            threads: Mutex::new(Vec::new()),
            strand: Mutex::new(strand),
            strand_needed: strands,
            num_threads: 0,
            polling: AtomicBool::new(false),
            started: AtomicBool::new(false),
            rr_idx: AtomicUsize::new(0),
        })
    }

    /// Number of worker threads this service launches.
    pub fn threads(&self) -> usize {
        self.num_threads
    }

    /// Whether handlers are serialized through a strand.
    pub fn strand_needed(&self) -> bool {
        self.strand_needed
    }

    /// Whether the service runs its workers in polling mode.
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// Whether the service is started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the service. Returns false when already started.
    pub fn start(self: &Arc<Self>, polling: bool) -> bool {
        if self.is_started() {
            return false;
        }

        if !self.refresh_stopped_reactors() {
            return false;
        }

        self.polling.store(polling, Ordering::Release);
        self.rr_idx.store(0, Ordering::Relaxed);

        let service = Arc::clone(self);
        self.post(move || {
            if service.is_started() {
                return;
            }
            service.started.store(true, Ordering::Release);
            service.handler.on_started();
        });

        let reactors = self.reactors.lock().unwrap().clone();
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.num_threads {
            let service = Arc::clone(self);
            let reactor = Arc::clone(&reactors[i % reactors.len()]);
            let handle = thread::Builder::new()
                .name(format!("netline-worker-{i}"))
                .spawn(move || service_thread(service, reactor, i))
                .expect("failed to spawn service worker");
            threads.push(handle);
        }
        drop(threads);

        if self.num_threads == 0 {
            // No workers: run the started task inline on the caller.
            let _ = reactors[0].poll_once();
        }

        while !self.is_started() {
            thread::yield_now();
        }

        debug!(threads = self.num_threads, polling, "service started");
        true
    }

    /// Stop the service and join every worker. Returns false when not
    /// started. Must not be called from a service callback.
    pub fn stop(self: &Arc<Self>) -> bool {
        if !self.is_started() {
            return false;
        }

        let service = Arc::clone(self);
        self.post(move || {
            if !service.is_started() {
                return;
            }
            for reactor in service.reactors.lock().unwrap().iter() {
                reactor.stop();
            }
            service.started.store(false, Ordering::Release);
            service.handler.on_stopped();
        });

        if self.num_threads == 0 {
            let reactor = Arc::clone(&self.reactors.lock().unwrap()[0]);
            let _ = reactor.poll_once();
        }

        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }

        self.polling.store(false, Ordering::Release);

        while self.is_started() {
            thread::yield_now();
        }

        debug!("service stopped");
        true
    }

    /// Stop, replace every reactor with a fresh one, and start again with
    /// the previous polling mode.
    pub fn restart(self: &Arc<Self>) -> bool {
        let polling = self.is_polling();

        if !self.stop() {
            return false;
        }

        if !self.replace_reactors() {
            return false;
        }

        self.start(polling)
    }

    /// Run a handler inline when possible, else defer it. Routed through
    /// the strand when one is required.
    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, handler: F) {
        let strand = self.strand.lock().unwrap().clone();
        match strand {
            Some(strand) => strand.dispatch(Box::new(handler)),
            None => {
                let reactor = Arc::clone(&self.reactors.lock().unwrap()[0]);
                reactor.dispatch(Box::new(handler));
            }
        }
    }

    /// Defer a handler onto the service.
    pub fn post<F: FnOnce() + Send + 'static>(&self, handler: F) {
        let strand = self.strand.lock().unwrap().clone();
        match strand {
            Some(strand) => strand.post(Box::new(handler)),
            None => {
                let reactor = Arc::clone(&self.reactors.lock().unwrap()[0]);
                reactor.post(Box::new(handler));
            }
        }
    }

    /// Round-robin reactor selection for new endpoints.
    pub fn next_reactor(&self) -> Arc<Reactor> {
        let reactors = self.reactors.lock().unwrap();
        let idx = self.rr_idx.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&reactors[idx % reactors.len()])
    }

    pub(crate) fn strand(&self) -> Option<Arc<Strand>> {
        self.strand.lock().unwrap().clone()
    }

    fn replace_reactors(&self) -> bool {
        let mut reactors = self.reactors.lock().unwrap();
        let mut fresh = Vec::with_capacity(reactors.len());
        for _ in 0..reactors.len() {
            match Reactor::new() {
                Ok(reactor) => fresh.push(reactor),
                Err(_) => return false,
            }
        }
        *reactors = fresh;

        let mut strand = self.strand.lock().unwrap();
        if self.strand_needed {
            *strand = Some(Strand::new(Arc::clone(&reactors[0])));
        }
        true
    }

    fn refresh_stopped_reactors(&self) -> bool {
        let stopped = self
            .reactors
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.is_stopped());
        if stopped {
            return self.replace_reactors();
        }
        true
    }
}

fn service_thread(service: Arc<Service>, reactor: Arc<Reactor>, index: usize) {
    counter::bind_worker_shard(index);
    service.handler.on_thread_init();
    trace!(index, "worker thread started");

    let result = catch_unwind(AssertUnwindSafe(|| {
        if service.is_polling() {
            while !reactor.is_stopped() {
                if let Err(e) = reactor.poll_once() {
                    return Err(e);
                }
                service.handler.on_idle();
            }
            Ok(())
        } else {
            reactor.run()
        }
    }));

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let (code, category, message) = crate::error::describe(&e);
            service.handler.on_error(code, category, &message);
        }
        Err(_) => {
            eprintln!("netline: fatal error in I/O worker thread {index}");
            std::process::abort();
        }
    }

    trace!(index, "worker thread exiting");
    service.handler.on_thread_cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        started: AtomicUsize,
        stopped: AtomicUsize,
        thread_init: AtomicUsize,
        thread_cleanup: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ServiceHandler for CountingHandler {
        fn on_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
        fn on_thread_init(&self) {
            self.thread_init.fetch_add(1, Ordering::SeqCst);
        }
        fn on_thread_cleanup(&self) {
            self.thread_cleanup.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _code: i32, _category: &str, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn start_is_idempotent_guarded() {
        let handler = Arc::new(CountingHandler::default());
        let service = Service::new(handler.clone(), 1, false).unwrap();

        assert!(service.start(false));
        assert!(!service.start(false));
        assert!(service.is_started());

        assert!(service.stop());
        assert!(!service.stop());
        assert!(!service.is_started());

        assert_eq!(handler.started.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn posted_handlers_execute() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
        assert!(service.start(false));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        service.post(move || flag.store(true, Ordering::SeqCst));

        while !ran.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        assert!(service.stop());
    }

    #[test]
    fn round_robin_cycles_reactors() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 3, false).unwrap();
        let a = service.next_reactor();
        let b = service.next_reactor();
        let c = service.next_reactor();
        let d = service.next_reactor();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn shared_reactor_requires_strand() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 4, true).unwrap();
        assert!(service.strand_needed());
        assert!(service.strand().is_some());

        let service = Service::new(Arc::new(DefaultServiceHandler), 4, false).unwrap();
        assert!(!service.strand_needed());
        assert!(service.strand().is_none());
    }

    #[test]
    fn restart_replaces_reactors_and_refires_callbacks() {
        let handler = Arc::new(CountingHandler::default());
        let service = Service::new(handler.clone(), 2, false).unwrap();

        assert!(service.start(false));
        let before = service.next_reactor();
        assert!(service.restart());
        let after = service.next_reactor();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(service.stop());

        assert_eq!(handler.started.load(Ordering::SeqCst), 2);
        assert_eq!(handler.stopped.load(Ordering::SeqCst), 2);
        assert!(handler.thread_init.load(Ordering::SeqCst) >= 4);
        assert_eq!(
            handler.thread_init.load(Ordering::SeqCst),
            handler.thread_cleanup.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn polling_mode_invokes_idle() {
        struct IdleHandler {
            idle: AtomicUsize,
        }
        impl ServiceHandler for IdleHandler {
            fn on_idle(&self) {
                self.idle.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
            }
        }

        let handler = Arc::new(IdleHandler {
            idle: AtomicUsize::new(0),
        });
        let service = Service::new(handler.clone(), 1, false).unwrap();
        assert!(service.start(true));
        assert!(service.is_polling());

        while handler.idle.load(Ordering::SeqCst) < 10 {
            thread::yield_now();
        }
        assert!(service.stop());
        assert!(!service.is_polling());
    }
}
