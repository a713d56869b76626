//! The byte pump shared by sessions and clients.
//!
//! Both roles carry the same machinery: an elastic receive buffer with a
//! configurable ceiling, a double-buffered send queue (producers append to
//! `main` under a mutex while the I/O side drains `flush`), four byte
//! counters, and synchronous send/receive with an optional deadline. The
//! role-specific parts (user hooks, server aggregation, teardown) come in
//! through [`PumpHost`].

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::{Interest, Token};
use tracing::trace;

use crate::arena::{ArenaBuf, HandlerArena};
use crate::counter;
use crate::error::{describe, is_benign, no_buffer_space, operation_aborted, timed_out};
use crate::reactor::{IoSource, Reactor};
use crate::stream::{HandshakeStatus, Transport};
use crate::strand::Strand;

/// Fallback when `SO_RCVBUF`/`SO_SNDBUF` cannot be read.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Producer-facing and I/O-facing halves of the outbound double buffer.
/// `main` is the only half producers touch; the swap is the sole operation
/// that moves bytes toward the socket and only happens when `flush` is empty.
pub(crate) struct SendBuffers {
    pub main: Vec<u8>,
    pub flush: Vec<u8>,
    pub flush_offset: usize,
}

/// Role-specific half of an endpoint. Implemented by sessions and clients.
pub(crate) trait PumpHost: Send + Sync + 'static {
    fn pump(&self) -> &Pump;
    fn fire_receive(self: &Arc<Self>, data: &[u8]);
    fn fire_send(self: &Arc<Self>, sent: usize, pending: usize);
    fn fire_empty(self: &Arc<Self>);
    fn fire_error(self: &Arc<Self>, code: i32, category: &str, message: &str);
    /// Server aggregate accounting; clients leave these at the default.
    fn aggregate_sent(&self, _n: u64) {}
    fn aggregate_received(&self, _n: u64) {}
    /// Synchronous teardown body for this role.
    fn disconnect_now(self: &Arc<Self>);
    /// The TLS handshake phase finished.
    fn handshake_complete(self: &Arc<Self>) {}
}

/// Connection state shared by both endpoint roles.
pub(crate) struct Pump {
    pub reactor: Arc<Reactor>,
    pub strand: Option<Arc<Strand>>,
    pub tls: bool,

    pub transport: Mutex<Option<Transport>>,
    pub token: Mutex<Option<Token>>,

    pub connecting: AtomicBool,
    pub connected: AtomicBool,
    pub handshaked: AtomicBool,
    pub receiving: AtomicBool,
    pub sending: AtomicBool,
    pub want_read: AtomicBool,
    pub want_write: AtomicBool,

    pub bytes_pending: AtomicU64,
    pub bytes_sending: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    pub recv_buf: Mutex<BytesMut>,
    pub recv_limit: AtomicUsize,
    pub send: Mutex<SendBuffers>,
    pub send_limit: AtomicUsize,

    pub keep_alive: AtomicBool,
    pub no_delay: AtomicBool,
    pub recv_buf_size_opt: AtomicUsize,
    pub send_buf_size_opt: AtomicUsize,

    pub recv_arena: Arc<HandlerArena>,
    pub send_arena: Arc<HandlerArena>,
    pub sync_recv: Mutex<Option<SyncOp>>,
    pub sync_send: Mutex<Option<SyncOp>>,
}

impl Pump {
    pub(crate) fn new(reactor: Arc<Reactor>, strand: Option<Arc<Strand>>, tls: bool) -> Self {
        Pump {
            reactor,
            strand,
            tls,
            transport: Mutex::new(None),
            token: Mutex::new(None),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            want_read: AtomicBool::new(false),
            want_write: AtomicBool::new(false),
            bytes_pending: AtomicU64::new(0),
            bytes_sending: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            recv_buf: Mutex::new(BytesMut::new()),
            recv_limit: AtomicUsize::new(0),
            send: Mutex::new(SendBuffers {
                main: Vec::new(),
                flush: Vec::new(),
                flush_offset: 0,
            }),
            send_limit: AtomicUsize::new(0),
            keep_alive: AtomicBool::new(false),
            no_delay: AtomicBool::new(false),
            recv_buf_size_opt: AtomicUsize::new(0),
            send_buf_size_opt: AtomicUsize::new(0),
            recv_arena: HandlerArena::new(),
            send_arena: HandlerArena::new(),
            sync_recv: Mutex::new(None),
            sync_send: Mutex::new(None),
        }
    }

    /// Ready state: connected, and for TLS also handshaked.
    pub(crate) fn ready(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && (!self.tls || self.handshaked.load(Ordering::Acquire))
    }

    pub(crate) fn dispatch<F: FnOnce() + Send + 'static>(&self, task: F) {
        match &self.strand {
            Some(strand) => strand.dispatch(Box::new(task)),
            None => self.reactor.dispatch(Box::new(task)),
        }
    }

    pub(crate) fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        match &self.strand {
            Some(strand) => strand.post(Box::new(task)),
            None => self.reactor.post(Box::new(task)),
        }
    }
}

// ── Connection setup / teardown ─────────────────────────────────────────

/// Apply socket options and size the buffers from the kernel's view of the
/// socket, then zero the byte counters. Runs once per connect or accept.
pub(crate) fn establish(pump: &Pump) -> io::Result<()> {
    let fd = {
        let guard = pump.transport.lock().unwrap();
        guard
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .socket()
            .as_raw_fd()
    };
    configure_socket(pump, fd)
}

/// The fd-level half of [`establish`]: options, buffer sizing, counter
/// reset. The client's blocking connect path runs this on the socket before
/// it turns non-blocking.
pub(crate) fn configure_socket(pump: &Pump, fd: std::os::fd::RawFd) -> io::Result<()> {
    crate::sockopt::set_keep_alive(fd, pump.keep_alive.load(Ordering::Relaxed))?;
    crate::sockopt::set_int(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        pump.no_delay.load(Ordering::Relaxed) as libc::c_int,
    )?;

    let rcv_opt = pump.recv_buf_size_opt.load(Ordering::Relaxed);
    if rcv_opt > 0 {
        crate::sockopt::set_recv_buffer_size(fd, rcv_opt)?;
    }
    let snd_opt = pump.send_buf_size_opt.load(Ordering::Relaxed);
    if snd_opt > 0 {
        crate::sockopt::set_send_buffer_size(fd, snd_opt)?;
    }

    let rcv_size = crate::sockopt::recv_buffer_size(fd)
        .unwrap_or(DEFAULT_BUFFER_SIZE)
        .max(1);
    let snd_size = crate::sockopt::send_buffer_size(fd).unwrap_or(DEFAULT_BUFFER_SIZE);

    {
        let mut buf = pump.recv_buf.lock().unwrap();
        buf.clear();
        buf.resize(rcv_size, 0);
    }
    {
        let mut sb = pump.send.lock().unwrap();
        sb.main.clear();
        sb.flush.clear();
        sb.flush_offset = 0;
        sb.main.reserve(snd_size);
        sb.flush.reserve(snd_size);
    }

    pump.bytes_pending.store(0, Ordering::Relaxed);
    pump.bytes_sending.store(0, Ordering::Relaxed);
    pump.bytes_sent.store(0, Ordering::Relaxed);
    pump.bytes_received.store(0, Ordering::Relaxed);
    Ok(())
}

/// Register the endpoint's socket with its reactor.
pub(crate) fn register_source<H>(host: &Arc<H>) -> io::Result<()>
where
    H: PumpHost + IoSource + 'static,
{
    let pump = host.pump();
    let as_source: Arc<dyn IoSource> = Arc::clone(host) as Arc<dyn IoSource>;
    let weak: Weak<dyn IoSource> = Arc::downgrade(&as_source);

    let mut guard = pump.transport.lock().unwrap();
    let transport = guard
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
    let token = pump.reactor.register(
        transport.socket_mut(),
        Interest::READABLE | Interest::WRITABLE,
        weak,
    )?;
    drop(guard);

    *pump.token.lock().unwrap() = Some(token);
    Ok(())
}

/// Close the transport and reset every pump flag and buffer. Pending
/// synchronous operations complete with an aborted status.
pub(crate) fn teardown(pump: &Pump) {
    let token = pump.token.lock().unwrap().take();
    let transport = pump.transport.lock().unwrap().take();
    if let Some(mut transport) = transport {
        transport.graceful_shutdown();
        if let Some(token) = token {
            let _ = pump.reactor.deregister(transport.socket_mut(), token);
        }
    }

    pump.connecting.store(false, Ordering::Release);
    pump.connected.store(false, Ordering::Release);
    pump.handshaked.store(false, Ordering::Release);
    pump.receiving.store(false, Ordering::Release);
    pump.sending.store(false, Ordering::Release);
    pump.want_read.store(false, Ordering::Release);
    pump.want_write.store(false, Ordering::Release);

    {
        let mut sb = pump.send.lock().unwrap();
        sb.main.clear();
        sb.flush.clear();
        sb.flush_offset = 0;
    }
    pump.bytes_pending.store(0, Ordering::Relaxed);
    pump.bytes_sending.store(0, Ordering::Relaxed);

    for slot in [&pump.sync_recv, &pump.sync_send] {
        let op = slot.lock().unwrap().take();
        if let Some(op) = op {
            if let Some(id) = op.timer {
                pump.reactor.cancel_timer(id);
            }
            op.arb.complete_io(Err(operation_aborted()), Some(op.buf));
        }
    }

    counter::CONNECTIONS_CLOSED.increment();
}

// ── Error funnel ────────────────────────────────────────────────────────

/// Route an error through the benign-teardown filter; survivors reach the
/// endpoint's `on_error` hook.
pub(crate) fn funnel<H: PumpHost>(host: &Arc<H>, err: &io::Error) {
    if is_benign(err) {
        trace!(%err, "benign teardown");
        return;
    }
    let (code, category, message) = describe(err);
    host.fire_error(code, category, &message);
}

// ── Readiness entry point ───────────────────────────────────────────────

/// Dispatch a readiness edge to the pump's activities.
pub(crate) fn on_ready<H: PumpHost>(host: &Arc<H>, readable: bool, writable: bool) {
    let pump = host.pump();

    if pump.tls && pump.connected.load(Ordering::Acquire) && !pump.handshaked.load(Ordering::Acquire)
    {
        drive_handshake(host);
        if !pump.handshaked.load(Ordering::Acquire) {
            return;
        }
    }

    if writable {
        // Leftover ciphertext from a short TLS write drains first.
        {
            let mut guard = pump.transport.lock().unwrap();
            if let Some(transport) = guard.as_mut() {
                if transport.wants_flush() {
                    let _ = transport.flush_pending();
                }
            }
        }

        if pump.sync_send.lock().unwrap().is_some() {
            pump_sync_send(host);
        }

        if pump.want_write.swap(false, Ordering::AcqRel) && pump.sending.swap(false, Ordering::AcqRel)
        {
            try_send(host);
        }
    }

    if readable {
        if pump.sync_recv.lock().unwrap().is_some() {
            pump_sync_recv(host);
        }

        if pump.want_read.swap(false, Ordering::AcqRel)
            && pump.receiving.swap(false, Ordering::AcqRel)
        {
            try_receive(host);
        }
    }
}

// ── Handshake phase (TLS) ───────────────────────────────────────────────

pub(crate) fn drive_handshake<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    if pump.handshaked.load(Ordering::Acquire) || !pump.connected.load(Ordering::Acquire) {
        return;
    }

    let result = {
        let mut guard = pump.transport.lock().unwrap();
        match guard.as_mut() {
            Some(transport) => transport.handshake_step(),
            None => return,
        }
    };

    match result {
        Ok(HandshakeStatus::Complete) => {
            if !pump.handshaked.swap(true, Ordering::AcqRel) {
                host.handshake_complete();
            }
        }
        Ok(HandshakeStatus::InProgress) => {}
        Err(e) => {
            funnel(host, &e);
            disconnect_async(host, true);
        }
    }
}

// ── Receive chain ───────────────────────────────────────────────────────

/// Arm the receive chain. No-op when a receive is already in flight or the
/// connection is not ready.
pub(crate) fn try_receive<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    if pump.receiving.swap(true, Ordering::AcqRel) {
        return;
    }
    if !pump.ready() {
        pump.receiving.store(false, Ordering::Release);
        return;
    }
    receive_loop(host);
}

fn receive_loop<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    loop {
        if !pump.ready() {
            pump.receiving.store(false, Ordering::Release);
            return;
        }

        let result = {
            let mut guard = pump.transport.lock().unwrap();
            let Some(transport) = guard.as_mut() else {
                pump.receiving.store(false, Ordering::Release);
                return;
            };
            let mut buf = pump.recv_buf.lock().unwrap();
            let window = buf.len();
            transport.read_some(&mut buf[..window])
        };

        match result {
            Ok(n) => {
                pump.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                host.aggregate_received(n as u64);
                counter::BYTES_RECEIVED.add(n as u64);

                let overflow = {
                    let mut buf = pump.recv_buf.lock().unwrap();
                    host.fire_receive(&buf[..n]);

                    // A completely filled buffer doubles, up to the ceiling.
                    if n == buf.len() {
                        let limit = pump.recv_limit.load(Ordering::Relaxed);
                        if limit > 0 && 2 * n > limit {
                            true
                        } else {
                            let doubled = 2 * n;
                            buf.resize(doubled, 0);
                            false
                        }
                    } else {
                        false
                    }
                };

                if overflow {
                    pump.receiving.store(false, Ordering::Release);
                    let err = no_buffer_space();
                    funnel(host, &err);
                    disconnect_async(host, true);
                    return;
                }

                if !pump.ready() {
                    pump.receiving.store(false, Ordering::Release);
                    return;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                pump.want_read.store(true, Ordering::Release);
                return;
            }
            Err(e) => {
                pump.receiving.store(false, Ordering::Release);
                funnel(host, &e);
                disconnect_async(host, true);
                return;
            }
        }
    }
}

// ── Send chain ──────────────────────────────────────────────────────────

/// Append bytes to the producer buffer and kick the flush chain when it is
/// not already covering the new bytes.
pub(crate) fn send_async<H: PumpHost>(host: &Arc<H>, data: &[u8]) -> bool {
    let pump = host.pump();
    if !pump.ready() {
        return false;
    }
    if data.is_empty() {
        return true;
    }

    let need_kick = {
        let mut sb = pump.send.lock().unwrap();

        let limit = pump.send_limit.load(Ordering::Relaxed);
        if limit > 0 && sb.main.len() + data.len() > limit {
            drop(sb);
            let err = no_buffer_space();
            funnel(host, &err);
            return false;
        }

        let need_kick = sb.main.is_empty() || sb.flush.is_empty();
        sb.main.extend_from_slice(data);
        pump.bytes_pending.store(sb.main.len() as u64, Ordering::Relaxed);
        need_kick
    };

    if need_kick {
        let host2 = Arc::clone(host);
        pump.dispatch(move || try_send(&host2));
    }
    true
}

/// Arm the flush chain. No-op when a flush is already in flight or the
/// connection is not ready.
pub(crate) fn try_send<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    if pump.sending.swap(true, Ordering::AcqRel) {
        return;
    }
    if !pump.ready() {
        pump.sending.store(false, Ordering::Release);
        return;
    }
    send_loop(host);
}

enum SendOutcome {
    Empty,
    Wrote(usize, usize),
    WouldBlock,
    Failed(io::Error),
}

fn send_loop<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    loop {
        if !pump.ready() {
            pump.sending.store(false, Ordering::Release);
            return;
        }

        let outcome = {
            let mut sb = pump.send.lock().unwrap();

            if sb.flush.is_empty() {
                let SendBuffers {
                    ref mut main,
                    ref mut flush,
                    ref mut flush_offset,
                } = *sb;
                mem::swap(main, flush);
                *flush_offset = 0;
                pump.bytes_pending.store(0, Ordering::Relaxed);
                pump.bytes_sending
                    .fetch_add(flush.len() as u64, Ordering::Relaxed);
            }

            if sb.flush.is_empty() {
                SendOutcome::Empty
            } else {
                let mut guard = pump.transport.lock().unwrap();
                match guard.as_mut() {
                    None => SendOutcome::Failed(operation_aborted()),
                    Some(transport) => {
                        let offset = sb.flush_offset;
                        match transport.write_some(&sb.flush[offset..]) {
                            Ok(n) => {
                                pump.bytes_sending.fetch_sub(n as u64, Ordering::Relaxed);
                                pump.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                                sb.flush_offset += n;
                                if sb.flush_offset == sb.flush.len() {
                                    sb.flush.clear();
                                    sb.flush_offset = 0;
                                }
                                let pending = pump.bytes_pending.load(Ordering::Relaxed);
                                SendOutcome::Wrote(n, pending as usize)
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                SendOutcome::WouldBlock
                            }
                            Err(e) => SendOutcome::Failed(e),
                        }
                    }
                }
            }
        };

        match outcome {
            SendOutcome::Empty => {
                pump.sending.store(false, Ordering::Release);
                host.fire_empty();
                return;
            }
            SendOutcome::Wrote(n, pending) => {
                host.aggregate_sent(n as u64);
                counter::BYTES_SENT.add(n as u64);
                host.fire_send(n, pending);
            }
            SendOutcome::WouldBlock => {
                pump.want_write.store(true, Ordering::Release);
                return;
            }
            SendOutcome::Failed(e) => {
                pump.sending.store(false, Ordering::Release);
                funnel(host, &e);
                disconnect_async(host, true);
                return;
            }
        }
    }
}

// ── Disconnect routing ──────────────────────────────────────────────────

/// Schedule the synchronous disconnect on the endpoint's execution context.
pub(crate) fn disconnect_async<H: PumpHost>(host: &Arc<H>, dispatch: bool) -> bool {
    let pump = host.pump();
    if !pump.connected.load(Ordering::Acquire) {
        return false;
    }
    let host = Arc::clone(host);
    let task = move || host.disconnect_now();
    if dispatch {
        pump.dispatch(task);
    } else {
        pump.post(task);
    }
    true
}

// ── Synchronous I/O with timeout ────────────────────────────────────────

struct SyncState {
    done: u32,
    err: Option<io::Error>,
    n: usize,
    data: Option<ArenaBuf>,
}

/// Two-completion arbiter for deadline-bounded synchronous I/O. The I/O
/// completion and the timer completion each count once; the first arrival
/// records the outcome and cancels its twin.
pub(crate) struct SyncArbiter {
    state: Mutex<SyncState>,
    cv: Condvar,
}

impl SyncArbiter {
    fn new() -> Arc<Self> {
        Arc::new(SyncArbiter {
            state: Mutex::new(SyncState {
                done: 0,
                err: None,
                n: 0,
                data: None,
            }),
            cv: Condvar::new(),
        })
    }

    fn complete_io(&self, result: io::Result<usize>, data: Option<ArenaBuf>) {
        let mut st = self.state.lock().unwrap();
        let first = st.done == 0;
        match result {
            Ok(n) => {
                st.n = n;
            }
            Err(e) => {
                if first {
                    st.err = Some(e);
                }
            }
        }
        if data.is_some() {
            st.data = data;
        }
        st.done += 1;
        self.cv.notify_all();
    }

    fn complete_timer(&self, expired: bool) {
        let mut st = self.state.lock().unwrap();
        if expired && st.done == 0 {
            st.err = Some(timed_out());
        }
        st.done += 1;
        self.cv.notify_all();
    }

    fn wait(&self, expected: u32) -> (Option<io::Error>, usize, Option<ArenaBuf>) {
        let mut st = self.state.lock().unwrap();
        while st.done < expected {
            st = self.cv.wait(st).unwrap();
        }
        (st.err.take(), st.n, st.data.take())
    }
}

/// A synchronous operation staged for the reactor: scratch buffer, request
/// bounds, the arbiter, and the deadline timer when one is armed.
pub(crate) struct SyncOp {
    buf: ArenaBuf,
    len: usize,
    off: usize,
    full: bool,
    arb: Arc<SyncArbiter>,
    timer: Option<u64>,
}

/// Blocking receive with an optional deadline. Returns the byte count;
/// zero on timeout. `timed_out` never reaches `on_error`.
pub(crate) fn sync_receive<H: PumpHost>(
    host: &Arc<H>,
    out: &mut [u8],
    timeout: Duration,
) -> usize {
    let pump = host.pump();
    if !pump.ready() || out.is_empty() {
        return 0;
    }

    let arb = SyncArbiter::new();
    let expected = if timeout.is_zero() { 1 } else { 2 };
    let timer = arm_sync_timer(host, &arb, SyncKind::Recv, timeout);

    {
        let mut slot = pump.sync_recv.lock().unwrap();
        if slot.is_some() {
            if let Some(id) = timer {
                pump.reactor.cancel_timer(id);
            }
            return 0;
        }
        *slot = Some(SyncOp {
            buf: pump.recv_arena.alloc(out.len()),
            len: out.len(),
            off: 0,
            full: false,
            arb: Arc::clone(&arb),
            timer,
        });
    }

    let kick = Arc::clone(host);
    pump.dispatch(move || pump_sync_recv(&kick));

    let (err, n, data) = arb.wait(expected);

    if n > 0 {
        if let Some(data) = data {
            out[..n].copy_from_slice(&data[..n]);
        }
        pump.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        host.aggregate_received(n as u64);
        counter::BYTES_RECEIVED.add(n as u64);
        host.fire_receive(&out[..n]);
    }

    if let Some(err) = err {
        if !crate::error::is_timed_out(&err) {
            funnel(host, &err);
            host.disconnect_now();
        }
    }
    n
}

/// Blocking send with an optional deadline. With no deadline the whole
/// buffer is written; with one, a single short write is attempted.
pub(crate) fn sync_send<H: PumpHost>(host: &Arc<H>, data: &[u8], timeout: Duration) -> usize {
    let pump = host.pump();
    if !pump.ready() || data.is_empty() {
        return 0;
    }

    let arb = SyncArbiter::new();
    let expected = if timeout.is_zero() { 1 } else { 2 };
    let timer = arm_sync_timer(host, &arb, SyncKind::Send, timeout);

    {
        let mut slot = pump.sync_send.lock().unwrap();
        if slot.is_some() {
            if let Some(id) = timer {
                pump.reactor.cancel_timer(id);
            }
            return 0;
        }
        let mut buf = pump.send_arena.alloc(data.len());
        buf[..data.len()].copy_from_slice(data);
        *slot = Some(SyncOp {
            buf,
            len: data.len(),
            off: 0,
            full: timeout.is_zero(),
            arb: Arc::clone(&arb),
            timer,
        });
    }

    let kick = Arc::clone(host);
    pump.dispatch(move || pump_sync_send(&kick));

    let (err, n, _) = arb.wait(expected);

    if n > 0 {
        pump.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        host.aggregate_sent(n as u64);
        counter::BYTES_SENT.add(n as u64);
        let pending = pump.bytes_pending.load(Ordering::Relaxed) as usize;
        host.fire_send(n, pending);
    }

    if let Some(err) = err {
        if !crate::error::is_timed_out(&err) {
            funnel(host, &err);
            host.disconnect_now();
        }
    }
    n
}

#[derive(Clone, Copy)]
enum SyncKind {
    Recv,
    Send,
}

fn sync_slot(pump: &Pump, kind: SyncKind) -> &Mutex<Option<SyncOp>> {
    match kind {
        SyncKind::Recv => &pump.sync_recv,
        SyncKind::Send => &pump.sync_send,
    }
}

/// Arm the deadline half of the arbiter. On expiry the staged operation is
/// withdrawn and its completion arrives as `operation_aborted`; on cancel
/// (the I/O side won) the timer completion merely counts.
fn arm_sync_timer<H: PumpHost>(
    host: &Arc<H>,
    arb: &Arc<SyncArbiter>,
    kind: SyncKind,
    timeout: Duration,
) -> Option<u64> {
    if timeout.is_zero() {
        return None;
    }
    let deadline = Instant::now() + timeout;
    let reactor = Arc::clone(&host.pump().reactor);
    let host = Arc::clone(host);
    let arb = Arc::clone(arb);
    Some(reactor.schedule_timer(
        deadline,
        Box::new(move |canceled| {
            if canceled {
                arb.complete_timer(false);
                return;
            }
            let op = sync_slot(host.pump(), kind).lock().unwrap().take();
            arb.complete_timer(true);
            if let Some(op) = op {
                op.arb.complete_io(Err(operation_aborted()), Some(op.buf));
            }
        }),
    ))
}

fn pump_sync_recv<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    let mut slot = pump.sync_recv.lock().unwrap();
    let Some(op) = slot.as_mut() else { return };

    let result = {
        let mut guard = pump.transport.lock().unwrap();
        match guard.as_mut() {
            None => Err(operation_aborted()),
            Some(transport) => {
                let len = op.len;
                transport.read_some(&mut op.buf[..len])
            }
        }
    };

    match result {
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        result => {
            let op = slot.take().unwrap();
            drop(slot);
            if let Some(id) = op.timer {
                pump.reactor.cancel_timer(id);
            }
            op.arb.complete_io(result, Some(op.buf));
        }
    }
}

fn pump_sync_send<H: PumpHost>(host: &Arc<H>) {
    let pump = host.pump();
    let mut slot = pump.sync_send.lock().unwrap();

    loop {
        let (result, finished) = {
            let Some(op) = slot.as_mut() else { return };
            let result = {
                let mut guard = pump.transport.lock().unwrap();
                match guard.as_mut() {
                    None => Err(operation_aborted()),
                    Some(transport) => {
                        let (off, len) = (op.off, op.len);
                        transport.write_some(&op.buf[off..len])
                    }
                }
            };
            match result {
                Ok(n) => {
                    op.off += n;
                    (Ok(op.off), !op.full || op.off == op.len)
                }
                Err(e) => (Err(e), true),
            }
        };

        match result {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            result => {
                if !finished {
                    continue;
                }
                let op = slot.take().unwrap();
                drop(slot);
                if let Some(id) = op.timer {
                    pump.reactor.cancel_timer(id);
                }
                op.arb.complete_io(result, None);
                return;
            }
        }
    }
}
