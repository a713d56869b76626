//! Global runtime metrics, sharded per service worker.
//!
//! Each worker thread the [`Service`](crate::Service) launches is bound to
//! its own shard, so the byte pump can bump process-wide totals without
//! bouncing cache lines between reactors. Threads outside the service
//! (callers doing synchronous I/O) account into a shared external shard.
//! Reads sum every shard. [`Counter`] handles implement
//! [`metriken::Metric`] for exposition.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shards reserved for service workers; one extra shard catches threads
/// that never bound a worker index.
const WORKER_SHARDS: usize = 63;
const EXTERNAL_SHARD: usize = WORKER_SHARDS;

thread_local! {
    static WORKER_SHARD: Cell<usize> = const { Cell::new(EXTERNAL_SHARD) };
}

/// Bind the calling worker thread to a metrics shard. `Service::start`
/// calls this with the worker index before entering the event loop.
pub(crate) fn bind_worker_shard(index: usize) {
    WORKER_SHARD.set(index % WORKER_SHARDS);
}

/// The runtime totals netline tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMetric {
    /// Connections accepted by all servers in this process.
    ConnectionsAccepted,
    /// Connections torn down (sessions and clients).
    ConnectionsClosed,
    /// Payload bytes written to peers.
    BytesSent,
    /// Payload bytes received from peers.
    BytesReceived,
}

/// One shard's counters, padded out to its own pair of cache lines so
/// adjacent workers never share one.
#[repr(C, align(128))]
struct MetricShard {
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl MetricShard {
    const fn new() -> Self {
        MetricShard {
            connections_accepted: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    fn field(&self, metric: RuntimeMetric) -> &AtomicU64 {
        match metric {
            RuntimeMetric::ConnectionsAccepted => &self.connections_accepted,
            RuntimeMetric::ConnectionsClosed => &self.connections_closed,
            RuntimeMetric::BytesSent => &self.bytes_sent,
            RuntimeMetric::BytesReceived => &self.bytes_received,
        }
    }
}

struct RuntimeCounters {
    shards: [MetricShard; WORKER_SHARDS + 1],
}

impl RuntimeCounters {
    const fn new() -> Self {
        const SHARD: MetricShard = MetricShard::new();
        RuntimeCounters {
            shards: [SHARD; WORKER_SHARDS + 1],
        }
    }

    #[inline]
    fn add(&self, metric: RuntimeMetric, value: u64) {
        self.shards[WORKER_SHARD.get()]
            .field(metric)
            .fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, metric: RuntimeMetric) -> u64 {
        self.shards
            .iter()
            .map(|s| s.field(metric).load(Ordering::Relaxed))
            .sum()
    }
}

static COUNTERS: RuntimeCounters = RuntimeCounters::new();

/// Handle to one runtime metric.
pub struct Counter {
    metric: RuntimeMetric,
}

impl Counter {
    pub const fn new(metric: RuntimeMetric) -> Self {
        Counter { metric }
    }

    /// Which runtime total this handle reads and writes.
    pub fn metric(&self) -> RuntimeMetric {
        self.metric
    }

    /// Increment the calling thread's shard by 1.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add a value to the calling thread's shard.
    #[inline]
    pub fn add(&self, value: u64) {
        COUNTERS.add(self.metric, value);
    }

    /// Current total, summed across every shard.
    pub fn value(&self) -> u64 {
        COUNTERS.value(self.metric)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

/// Total connections accepted by all servers in this process.
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new(RuntimeMetric::ConnectionsAccepted);
/// Total connections torn down (sessions and clients).
pub static CONNECTIONS_CLOSED: Counter = Counter::new(RuntimeMetric::ConnectionsClosed);
/// Total payload bytes written to peers.
pub static BYTES_SENT: Counter = Counter::new(RuntimeMetric::BytesSent);
/// Total payload bytes received from peers.
pub static BYTES_RECEIVED: Counter = Counter::new(RuntimeMetric::BytesReceived);
