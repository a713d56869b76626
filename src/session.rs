//! Server-side connection: one session per accepted socket.

use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;
use uuid::Uuid;

use crate::pump::{self, Pump, PumpHost};
use crate::reactor::IoSource;
use crate::server::TcpServer;

/// Per-session user hooks. All methods have no-op defaults.
pub trait SessionHandler: Send + Sync + 'static {
    /// The session is connected (TLS sessions are not yet handshaked).
    fn on_connect(&self, _session: &Arc<TcpSession>) {}
    /// The session is torn down.
    fn on_disconnect(&self, _session: &Arc<TcpSession>) {}
    /// TLS only: the handshake completed and the session is ready.
    fn on_handshaked(&self, _session: &Arc<TcpSession>) {}
    /// Payload bytes arrived.
    fn on_receive(&self, _session: &Arc<TcpSession>, _data: &[u8]) {}
    /// Payload bytes were written; `pending` is what producers have queued.
    fn on_send(&self, _session: &Arc<TcpSession>, _sent: usize, _pending: usize) {}
    /// The outbound queue drained completely.
    fn on_empty(&self, _session: &Arc<TcpSession>) {}
    fn on_error(&self, _code: i32, _category: &str, _message: &str) {}
}

/// Handler with every hook at its default.
pub struct DefaultSessionHandler;

impl SessionHandler for DefaultSessionHandler {}

/// A server-side connection.
pub struct TcpSession {
    id: Uuid,
    server: Mutex<Option<Arc<TcpServer>>>,
    handler: Arc<dyn SessionHandler>,
    pump: Pump,
}

impl TcpSession {
    pub(crate) fn new(server: &Arc<TcpServer>, handler: Arc<dyn SessionHandler>) -> Arc<Self> {
        let pump = Pump::new(
            server.service().next_reactor(),
            server.service().strand(),
            server.is_tls(),
        );

        // Accepted sockets inherit the server's defaults.
        pump.keep_alive
            .store(server.keep_alive(), Ordering::Relaxed);
        pump.no_delay.store(server.no_delay(), Ordering::Relaxed);
        pump.recv_limit
            .store(server.receive_buff_limit(), Ordering::Relaxed);
        pump.send_limit
            .store(server.send_buff_limit(), Ordering::Relaxed);

        Arc::new(TcpSession {
            id: Uuid::new_v4(),
            server: Mutex::new(Some(Arc::clone(server))),
            handler,
            pump,
        })
    }

    /// Unique session identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The owning server, while the session is alive.
    pub fn server(&self) -> Option<Arc<TcpServer>> {
        self.server.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.pump.connected.load(Ordering::Acquire)
    }

    pub fn is_handshaked(&self) -> bool {
        self.pump.handshaked.load(Ordering::Acquire)
    }

    /// Ready to pump bytes: connected, and handshaked when TLS.
    pub fn is_ready(&self) -> bool {
        self.pump.ready()
    }

    pub fn bytes_pending(&self) -> u64 {
        self.pump.bytes_pending.load(Ordering::Relaxed)
    }

    pub fn bytes_sending(&self) -> u64 {
        self.pump.bytes_sending.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.pump.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.pump.bytes_received.load(Ordering::Relaxed)
    }

    /// Elastic receive ceiling; 0 is unlimited.
    pub fn set_receive_buff_limit(&self, limit: usize) {
        self.pump.recv_limit.store(limit, Ordering::Relaxed);
    }

    pub fn receive_buff_limit(&self) -> usize {
        self.pump.recv_limit.load(Ordering::Relaxed)
    }

    /// Outbound queue ceiling; 0 is unlimited.
    pub fn set_send_buff_limit(&self, limit: usize) {
        self.pump.send_limit.store(limit, Ordering::Relaxed);
    }

    pub fn send_buff_limit(&self) -> usize {
        self.pump.send_limit.load(Ordering::Relaxed)
    }

    /// `SO_RCVBUF` of the session's socket; 0 when the socket is gone.
    pub fn receive_buff_size(&self) -> usize {
        let guard = self.pump.transport.lock().unwrap();
        match guard.as_ref() {
            Some(t) => crate::sockopt::recv_buffer_size(t.socket().as_raw_fd()).unwrap_or(0),
            None => 0,
        }
    }

    pub fn set_receive_buff_size(&self, size: usize) {
        self.pump.recv_buf_size_opt.store(size, Ordering::Relaxed);
        let guard = self.pump.transport.lock().unwrap();
        if let Some(t) = guard.as_ref() {
            let _ = crate::sockopt::set_recv_buffer_size(t.socket().as_raw_fd(), size);
        }
    }

    /// `SO_SNDBUF` of the session's socket; 0 when the socket is gone.
    pub fn send_buff_size(&self) -> usize {
        let guard = self.pump.transport.lock().unwrap();
        match guard.as_ref() {
            Some(t) => crate::sockopt::send_buffer_size(t.socket().as_raw_fd()).unwrap_or(0),
            None => 0,
        }
    }

    pub fn set_send_buff_size(&self, size: usize) {
        self.pump.send_buf_size_opt.store(size, Ordering::Relaxed);
        let guard = self.pump.transport.lock().unwrap();
        if let Some(t) = guard.as_ref() {
            let _ = crate::sockopt::set_send_buffer_size(t.socket().as_raw_fd(), size);
        }
    }

    /// Append bytes to the outbound queue. Delivery is in append order.
    pub fn send_async(self: &Arc<Self>, data: &[u8]) -> bool {
        pump::send_async(self, data)
    }

    /// Blocking send. A zero timeout writes the whole buffer; otherwise a
    /// single write is bounded by the deadline and may return 0 on timeout.
    pub fn send(self: &Arc<Self>, data: &[u8], timeout: Duration) -> usize {
        pump::sync_send(self, data, timeout)
    }

    /// Blocking receive into `out`. Returns 0 on timeout.
    pub fn receive(self: &Arc<Self>, out: &mut [u8], timeout: Duration) -> usize {
        pump::sync_receive(self, out, timeout)
    }

    /// Arm the asynchronous receive chain.
    pub fn receive_async(self: &Arc<Self>) {
        pump::try_receive(self);
    }

    /// Schedule teardown on the session's execution context.
    pub fn disconnect(self: &Arc<Self>) -> bool {
        pump::disconnect_async(self, false)
    }

    /// As [`disconnect`](Self::disconnect), but runs inline when the caller
    /// is already on the session's context.
    pub fn disconnect_dispatch(self: &Arc<Self>) -> bool {
        pump::disconnect_async(self, true)
    }

    /// Accept-side connect routine, run by the server after `accept`.
    pub(crate) fn connect_accepted(self: &Arc<Self>) {
        if let Err(e) = pump::establish(&self.pump) {
            pump::funnel(self, &e);
            return;
        }
        if let Err(e) = pump::register_source(self) {
            pump::funnel(self, &e);
            return;
        }

        self.pump.connected.store(true, Ordering::Release);
        trace!(id = %self.id, "session connected");

        pump::try_receive(self);
        self.handler.on_connect(self);
        if let Some(server) = self.server() {
            server.notify_connect(self);
        }

        if self.pump.tls {
            pump::drive_handshake(self);
        } else if self.pump.send.lock().unwrap().main.is_empty() {
            self.handler.on_empty(self);
        }
    }

    pub(crate) fn pump_ref(&self) -> &Pump {
        &self.pump
    }
}

impl PumpHost for TcpSession {
    fn pump(&self) -> &Pump {
        &self.pump
    }

    fn fire_receive(self: &Arc<Self>, data: &[u8]) {
        self.handler.on_receive(self, data);
    }

    fn fire_send(self: &Arc<Self>, sent: usize, pending: usize) {
        self.handler.on_send(self, sent, pending);
    }

    fn fire_empty(self: &Arc<Self>) {
        self.handler.on_empty(self);
    }

    fn fire_error(self: &Arc<Self>, code: i32, category: &str, message: &str) {
        self.handler.on_error(code, category, message);
    }

    fn aggregate_sent(&self, n: u64) {
        if let Some(server) = self.server() {
            server.add_bytes_sent(n);
        }
    }

    fn aggregate_received(&self, n: u64) {
        if let Some(server) = self.server() {
            server.add_bytes_received(n);
        }
    }

    fn disconnect_now(self: &Arc<Self>) {
        if !self.pump.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        pump::teardown(&self.pump);
        trace!(id = %self.id, "session disconnected");

        self.handler.on_disconnect(self);

        // Take the back-pointer out so the server/session cycle breaks as
        // soon as the map entry goes away.
        let server = self.server.lock().unwrap().take();
        if let Some(server) = server {
            server.notify_disconnect(self);
            let id = self.id;
            let owner = Arc::clone(&server);
            server.dispatch_control(move || owner.unregister_session(&id));
        }
    }

    fn handshake_complete(self: &Arc<Self>) {
        trace!(id = %self.id, "session handshaked");
        pump::try_receive(self);
        self.handler.on_handshaked(self);
        if let Some(server) = self.server() {
            server.notify_handshaked(self);
        }
        if self.pump.send.lock().unwrap().main.is_empty() {
            self.handler.on_empty(self);
        }
    }
}

impl IoSource for TcpSession {
    fn on_ready(self: Arc<Self>, readable: bool, writable: bool) {
        pump::on_ready(&self, readable, writable);
    }
}
