//! Deadline timer bound to a service reactor.
//!
//! The deadline is absolute or relative to construction time and may be
//! re-armed with the `setup_*` methods. The stored action receives a
//! `canceled` flag: `false` on expiry, `true` when [`Timer::cancel`] won
//! the race.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::reactor::Reactor;
use crate::service::Service;
use crate::strand::Strand;

type TimerAction = Arc<dyn Fn(bool) + Send + Sync>;

struct TimerInner {
    deadline: Instant,
    action: Option<TimerAction>,
    pending: Option<u64>,
    sync_epoch: u64,
}

/// A one-shot timer with async and sync wait.
pub struct Timer {
    reactor: Arc<Reactor>,
    strand: Option<Arc<Strand>>,
    inner: Mutex<TimerInner>,
    cv: Condvar,
}

impl Timer {
    /// Create a timer bound to one of the service's reactors, with the
    /// deadline set to now.
    pub fn new(service: &Arc<Service>) -> Arc<Self> {
        Self::with_deadline(service, Instant::now())
    }

    /// Create a timer expiring at an absolute deadline.
    pub fn with_deadline(service: &Arc<Service>, deadline: Instant) -> Arc<Self> {
        Arc::new(Timer {
            reactor: service.next_reactor(),
            strand: service.strand(),
            inner: Mutex::new(TimerInner {
                deadline,
                action: None,
                pending: None,
                sync_epoch: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Create a timer expiring after a relative timespan.
    pub fn with_timeout(service: &Arc<Service>, timeout: Duration) -> Arc<Self> {
        Self::with_deadline(service, Instant::now() + timeout)
    }

    /// Absolute expiry time.
    pub fn expiry_time(&self) -> Instant {
        self.inner.lock().unwrap().deadline
    }

    /// Remaining time until expiry (zero when already past).
    pub fn expiry_timespan(&self) -> Duration {
        self.expiry_time().saturating_duration_since(Instant::now())
    }

    /// Replace the stored action.
    pub fn setup_action<F: Fn(bool) + Send + Sync + 'static>(&self, action: F) {
        self.inner.lock().unwrap().action = Some(Arc::new(action));
    }

    /// Move the deadline to an absolute time.
    pub fn setup_deadline(&self, deadline: Instant) {
        self.inner.lock().unwrap().deadline = deadline;
    }

    /// Move the deadline to now plus a timespan.
    pub fn setup_timeout(&self, timeout: Duration) {
        self.setup_deadline(Instant::now() + timeout);
    }

    /// Arm an asynchronous wait. The action fires on the timer's reactor
    /// (through the strand when the service requires one) with
    /// `canceled = false` on expiry or `true` after [`Timer::cancel`].
    pub fn wait_async(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.deadline;
        let timer = Arc::clone(self);
        let id = self
            .reactor
            .schedule_timer(deadline, Box::new(move |canceled| timer.notify(canceled)));
        inner.pending = Some(id);
        true
    }

    /// Block the caller until expiry or cancellation. Returns true when the
    /// deadline was reached, false when the wait was canceled.
    pub fn wait_sync(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.deadline;
        let epoch = inner.sync_epoch;

        loop {
            let now = Instant::now();
            if inner.sync_epoch != epoch {
                drop(inner);
                self.notify(true);
                return false;
            }
            if now >= deadline {
                drop(inner);
                self.notify(false);
                return true;
            }
            let (next, _) = self
                .cv
                .wait_timeout(inner, deadline.saturating_duration_since(now))
                .unwrap();
            inner = next;
        }
    }

    /// Cancel pending waits. Async waiters observe `canceled = true`.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.sync_epoch += 1;
            inner.pending.take()
        };
        self.cv.notify_all();
        if let Some(id) = pending {
            self.reactor.cancel_timer(id);
        }
        true
    }

    fn notify(self: &Arc<Self>, canceled: bool) {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            if !canceled {
                inner.pending = None;
            }
            inner.action.clone()
        };
        let Some(action) = action else {
            return;
        };

        match &self.strand {
            Some(strand) => strand.dispatch(Box::new(move || action(canceled))),
            None => action(canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::DefaultServiceHandler;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::yield_now();
        }
    }

    #[test]
    fn async_wait_fires_action() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
        assert!(service.start(false));

        let fired = Arc::new(AtomicUsize::new(0));
        let was_canceled = Arc::new(AtomicBool::new(true));

        let timer = Timer::with_timeout(&service, Duration::from_millis(20));
        let f = Arc::clone(&fired);
        let c = Arc::clone(&was_canceled);
        timer.setup_action(move |canceled| {
            c.store(canceled, Ordering::SeqCst);
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.wait_async());

        wait_for(|| fired.load(Ordering::SeqCst) == 1);
        assert!(!was_canceled.load(Ordering::SeqCst));
        assert!(service.stop());
    }

    #[test]
    fn cancel_reports_canceled() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
        assert!(service.start(false));

        let fired = Arc::new(AtomicUsize::new(0));
        let was_canceled = Arc::new(AtomicBool::new(false));

        let timer = Timer::with_timeout(&service, Duration::from_secs(60));
        let f = Arc::clone(&fired);
        let c = Arc::clone(&was_canceled);
        timer.setup_action(move |canceled| {
            c.store(canceled, Ordering::SeqCst);
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.wait_async());
        assert!(timer.cancel());

        wait_for(|| fired.load(Ordering::SeqCst) == 1);
        assert!(was_canceled.load(Ordering::SeqCst));
        assert!(service.stop());
    }

    #[test]
    fn sync_wait_blocks_until_deadline() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
        assert!(service.start(false));

        let timer = Timer::with_timeout(&service, Duration::from_millis(30));
        let start = Instant::now();
        assert!(timer.wait_sync());
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(service.stop());
    }

    #[test]
    fn rearm_after_expiry() {
        let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
        assert!(service.start(false));

        let fired = Arc::new(AtomicUsize::new(0));
        let timer = Timer::with_timeout(&service, Duration::from_millis(10));
        let f = Arc::clone(&fired);
        timer.setup_action(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.wait_async());
        wait_for(|| fired.load(Ordering::SeqCst) == 1);

        timer.setup_timeout(Duration::from_millis(10));
        assert!(timer.wait_async());
        wait_for(|| fired.load(Ordering::SeqCst) == 2);

        assert!(service.stop());
    }
}
