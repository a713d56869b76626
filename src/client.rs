//! Outbound connection: owner-driven connect/disconnect cycles over the
//! same byte pump the server sessions use.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;
use uuid::Uuid;

use crate::error::Error;
use crate::pump::{self, Pump, PumpHost};
use crate::reactor::IoSource;
use crate::service::Service;
use crate::stream::Transport;
use crate::tls::{TlsContext, TlsRole};

/// Per-client user hooks. All methods have no-op defaults.
pub trait ClientHandler: Send + Sync + 'static {
    /// The TCP connection is established (TLS clients are not yet
    /// handshaked).
    fn on_connect(&self, _client: &Arc<TcpClient>) {}
    /// The connection is torn down, or a connect attempt failed.
    fn on_disconnect(&self, _client: &Arc<TcpClient>) {}
    /// TLS only: the handshake completed and the client is ready.
    fn on_handshaked(&self, _client: &Arc<TcpClient>) {}
    /// Payload bytes arrived.
    fn on_receive(&self, _client: &Arc<TcpClient>, _data: &[u8]) {}
    /// Payload bytes were written; `pending` is what producers have queued.
    fn on_send(&self, _client: &Arc<TcpClient>, _sent: usize, _pending: usize) {}
    /// The outbound queue drained completely.
    fn on_empty(&self, _client: &Arc<TcpClient>) {}
    fn on_error(&self, _code: i32, _category: &str, _message: &str) {}
}

/// Handler with every hook at its default.
pub struct DefaultClientHandler;

impl ClientHandler for DefaultClientHandler {}

/// An outbound TCP or TLS connection.
pub struct TcpClient {
    id: Uuid,
    handler: Arc<dyn ClientHandler>,
    tls_context: Option<Arc<TlsContext>>,
    address: String,
    port: u16,
    server_name: Mutex<String>,
    pump: Pump,
}

impl TcpClient {
    /// Client targeting an address/port pair. The address is resolved at
    /// connect time and must be a literal IP.
    pub fn new(
        service: &Arc<Service>,
        handler: Arc<dyn ClientHandler>,
        address: &str,
        port: u16,
    ) -> Arc<Self> {
        Self::build(service, handler, None, address.to_string(), port)
    }

    /// Client targeting a pre-built endpoint.
    pub fn with_endpoint(
        service: &Arc<Service>,
        handler: Arc<dyn ClientHandler>,
        endpoint: SocketAddr,
    ) -> Arc<Self> {
        Self::build(
            service,
            handler,
            None,
            endpoint.ip().to_string(),
            endpoint.port(),
        )
    }

    /// TLS client. The context must carry a client config; the address
    /// doubles as the TLS server name unless overridden.
    pub fn new_tls(
        service: &Arc<Service>,
        handler: Arc<dyn ClientHandler>,
        context: Arc<TlsContext>,
        address: &str,
        port: u16,
    ) -> Result<Arc<Self>, Error> {
        if context.role() != TlsRole::Client {
            return Err(Error::InvalidArgument("server TLS context on a client"));
        }
        Ok(Self::build(
            service,
            handler,
            Some(context),
            address.to_string(),
            port,
        ))
    }

    fn build(
        service: &Arc<Service>,
        handler: Arc<dyn ClientHandler>,
        tls_context: Option<Arc<TlsContext>>,
        address: String,
        port: u16,
    ) -> Arc<Self> {
        let tls = tls_context.is_some();
        Arc::new(TcpClient {
            id: Uuid::new_v4(),
            handler,
            tls_context,
            server_name: Mutex::new(address.clone()),
            address,
            port,
            pump: Pump::new(service.next_reactor(), service.strand(), tls),
        })
    }

    /// Unique client identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Override the TLS server name presented during the handshake.
    pub fn set_server_name(&self, name: &str) {
        *self.server_name.lock().unwrap() = name.to_string();
    }

    pub fn is_connecting(&self) -> bool {
        self.pump.connecting.load(Ordering::Acquire)
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

    // ── Socket option surface ───────────────────────────────────────────

    pub fn keep_alive(&self) -> bool {
        self.pump.keep_alive.load(Ordering::Relaxed)
    }

    pub fn set_keep_alive(&self, enable: bool) {
        self.pump.keep_alive.store(enable, Ordering::Relaxed);
    }

    pub fn no_delay(&self) -> bool {
        self.pump.no_delay.load(Ordering::Relaxed)
    }

    pub fn set_no_delay(&self, enable: bool) {
        self.pump.no_delay.store(enable, Ordering::Relaxed);
    }

    pub fn receive_buff_limit(&self) -> usize {
        self.pump.recv_limit.load(Ordering::Relaxed)
    }

    pub fn set_receive_buff_limit(&self, limit: usize) {
        self.pump.recv_limit.store(limit, Ordering::Relaxed);
    }

    pub fn send_buff_limit(&self) -> usize {
        self.pump.send_limit.load(Ordering::Relaxed)
    }

    pub fn set_send_buff_limit(&self, limit: usize) {
        self.pump.send_limit.store(limit, Ordering::Relaxed);
    }

    /// `SO_RCVBUF`: the live socket when connected, else the recorded
    /// value applied at the next connect (0 when never set).
    pub fn receive_buff_size(&self) -> usize {
        let guard = self.pump.transport.lock().unwrap();
        match guard.as_ref() {
            Some(t) => crate::sockopt::recv_buffer_size(t.socket().as_raw_fd())
                .unwrap_or_else(|_| self.pump.recv_buf_size_opt.load(Ordering::Relaxed)),
            None => self.pump.recv_buf_size_opt.load(Ordering::Relaxed),
        }
    }

    pub fn set_receive_buff_size(&self, size: usize) {
        self.pump.recv_buf_size_opt.store(size, Ordering::Relaxed);
        let guard = self.pump.transport.lock().unwrap();
        if let Some(t) = guard.as_ref() {
            let _ = crate::sockopt::set_recv_buffer_size(t.socket().as_raw_fd(), size);
        }
    }

    /// `SO_SNDBUF`: the live socket when connected, else the recorded
    /// value applied at the next connect (0 when never set).
    pub fn send_buff_size(&self) -> usize {
        let guard = self.pump.transport.lock().unwrap();
        match guard.as_ref() {
            Some(t) => crate::sockopt::send_buffer_size(t.socket().as_raw_fd())
                .unwrap_or_else(|_| self.pump.send_buf_size_opt.load(Ordering::Relaxed)),
            None => self.pump.send_buf_size_opt.load(Ordering::Relaxed),
        }
    }

    pub fn set_send_buff_size(&self, size: usize) {
        self.pump.send_buf_size_opt.store(size, Ordering::Relaxed);
        let guard = self.pump.transport.lock().unwrap();
        if let Some(t) = guard.as_ref() {
            let _ = crate::sockopt::set_send_buffer_size(t.socket().as_raw_fd(), size);
        }
    }

    // ── Connect / disconnect ────────────────────────────────────────────

    /// Blocking connect (and, for TLS, blocking handshake). Returns false
    /// when already connected or when the attempt fails; a failed attempt
    /// fires `on_disconnect` after the error funnel.
    pub fn connect(self: &Arc<Self>) -> bool {
        // Claim the connecting flag so a racing connect from another
        // thread cannot build a second socket into this client.
        if self.is_connected() || self.pump.connecting.swap(true, Ordering::AcqRel) {
            return false;
        }

        let addr = match self.resolve() {
            Ok(addr) => addr,
            Err(e) => {
                pump::funnel(self, &e);
                return self.connect_failed();
            }
        };

        let mut std_stream = match std::net::TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                pump::funnel(self, &e);
                return self.connect_failed();
            }
        };

        if let Err(e) = pump::configure_socket(&self.pump, std_stream.as_raw_fd()) {
            pump::funnel(self, &e);
            return self.connect_failed();
        }

        // TLS: drive the handshake while the socket is still blocking.
        let conn = match &self.tls_context {
            None => None,
            Some(context) => {
                let name = self.server_name.lock().unwrap().clone();
                let mut conn = match context.new_client_conn(&name) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let message = e.to_string();
                        self.handler.on_error(0, "tls", &message);
                        return self.connect_failed();
                    }
                };
                if let Err(e) = conn.complete_handshake(&mut std_stream) {
                    pump::funnel(self, &e);
                    return self.connect_failed();
                }
                Some(conn)
            }
        };

        if let Err(e) = std_stream.set_nonblocking(true) {
            pump::funnel(self, &e);
            return self.connect_failed();
        }
        let sock = mio::net::TcpStream::from_std(std_stream);
        let transport = match conn {
            None => Transport::Plain(sock),
            Some(conn) => Transport::Tls { sock, conn },
        };
        *self.pump.transport.lock().unwrap() = Some(transport);

        if let Err(e) = pump::register_source(self) {
            pump::funnel(self, &e);
            return self.fail_connect();
        }

        self.pump.connected.store(true, Ordering::Release);
        self.pump.connecting.store(false, Ordering::Release);
        trace!(id = %self.id, %addr, "client connected");
        self.handler.on_connect(self);

        if self.pump.tls {
            self.pump.handshaked.store(true, Ordering::Release);
            self.handler.on_handshaked(self);
        }

        if self.pump.send.lock().unwrap().main.is_empty() {
            self.handler.on_empty(self);
        }
        true
    }

    /// Non-blocking connect scheduled on the client's execution context.
    /// Completion fires `on_connect` exactly once, then (for TLS) the
    /// handshake phase, then the receive chain.
    pub fn connect_async(self: &Arc<Self>) -> bool {
        if self.is_connected() || self.is_connecting() {
            return false;
        }
        let client = Arc::clone(self);
        self.pump.post(move || client.do_connect_async());
        true
    }

    /// Synchronous disconnect.
    pub fn disconnect(self: &Arc<Self>) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.disconnect_now();
        true
    }

    /// Disconnect scheduled on the client's execution context.
    pub fn disconnect_async(self: &Arc<Self>) -> bool {
        pump::disconnect_async(self, false)
    }

    /// As [`disconnect_async`](Self::disconnect_async) but dispatched
    /// inline when already on the client's context.
    pub fn disconnect_async_dispatch(self: &Arc<Self>) -> bool {
        pump::disconnect_async(self, true)
    }

    /// Synchronous disconnect followed by a synchronous connect.
    pub fn reconnect(self: &Arc<Self>) -> bool {
        if !self.disconnect() {
            return false;
        }
        self.connect()
    }

    /// Asynchronous disconnect, wait for it to land, then an asynchronous
    /// connect.
    pub fn reconnect_async(self: &Arc<Self>) -> bool {
        if !self.disconnect_async() {
            return false;
        }
        while self.is_connected() {
            std::thread::yield_now();
        }
        self.connect_async()
    }

    // ── Byte pump surface ───────────────────────────────────────────────

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

    // ── Internals ───────────────────────────────────────────────────────

    fn resolve(&self) -> io::Result<SocketAddr> {
        let ip: IpAddr = self.address.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid client address")
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Unwind a failed blocking connect before any socket was kept:
    /// release the connecting claim and report the disconnect.
    fn connect_failed(self: &Arc<Self>) -> bool {
        self.pump.connecting.store(false, Ordering::Release);
        self.handler.on_disconnect(self);
        false
    }

    fn fail_connect(self: &Arc<Self>) -> bool {
        self.pump.connecting.store(false, Ordering::Release);
        self.pump.connected.store(false, Ordering::Release);
        self.pump.handshaked.store(false, Ordering::Release);
        *self.pump.transport.lock().unwrap() = None;
        self.handler.on_disconnect(self);
        false
    }

    fn do_connect_async(self: &Arc<Self>) {
        if self.is_connected() || self.pump.connecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let addr = match self.resolve() {
            Ok(addr) => addr,
            Err(e) => {
                self.pump.connecting.store(false, Ordering::Release);
                pump::funnel(self, &e);
                self.handler.on_disconnect(self);
                return;
            }
        };

        let sock = match mio::net::TcpStream::connect(addr) {
            Ok(sock) => sock,
            Err(e) => {
                self.pump.connecting.store(false, Ordering::Release);
                pump::funnel(self, &e);
                self.handler.on_disconnect(self);
                return;
            }
        };

        // A fresh TLS session for every attempt; reusing a closed one
        // would resume a dead state machine.
        let transport = match &self.tls_context {
            None => Transport::Plain(sock),
            Some(context) => {
                let name = self.server_name.lock().unwrap().clone();
                match context.new_client_conn(&name) {
                    Ok(conn) => Transport::Tls { sock, conn },
                    Err(e) => {
                        self.pump.connecting.store(false, Ordering::Release);
                        let message = e.to_string();
                        self.handler.on_error(0, "tls", &message);
                        self.handler.on_disconnect(self);
                        return;
                    }
                }
            }
        };

        *self.pump.transport.lock().unwrap() = Some(transport);
        if let Err(e) = pump::register_source(self) {
            self.pump.connecting.store(false, Ordering::Release);
            *self.pump.transport.lock().unwrap() = None;
            pump::funnel(self, &e);
            self.handler.on_disconnect(self);
        }
        // Completion arrives as a writable edge in `finish_connect`.
    }

    fn finish_connect(self: &Arc<Self>) {
        if self.is_connected() || !self.is_connecting() {
            return;
        }

        let status = {
            let guard = self.pump.transport.lock().unwrap();
            match guard.as_ref() {
                None => return,
                Some(t) => t.socket().take_error(),
            }
        };

        let failure = match status {
            Ok(None) => None,
            Ok(Some(e)) => Some(e),
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            self.pump.connecting.store(false, Ordering::Release);
            self.abandon_socket();
            pump::funnel(self, &e);
            self.handler.on_disconnect(self);
            return;
        }

        if let Err(e) = pump::establish(&self.pump) {
            self.pump.connecting.store(false, Ordering::Release);
            self.abandon_socket();
            pump::funnel(self, &e);
            self.handler.on_disconnect(self);
            return;
        }

        self.pump.connecting.store(false, Ordering::Release);
        self.pump.connected.store(true, Ordering::Release);
        trace!(id = %self.id, "client connected");
        self.handler.on_connect(self);

        if self.pump.tls {
            pump::drive_handshake(self);
        } else {
            pump::try_receive(self);
            if self.pump.send.lock().unwrap().main.is_empty() {
                self.handler.on_empty(self);
            }
        }
    }

    fn abandon_socket(&self) {
        let token = self.pump.token.lock().unwrap().take();
        let transport = self.pump.transport.lock().unwrap().take();
        if let (Some(mut transport), Some(token)) = (transport, token) {
            let _ = self.pump.reactor.deregister(transport.socket_mut(), token);
        }
    }
}

impl PumpHost for TcpClient {
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

    fn disconnect_now(self: &Arc<Self>) {
        if !self.pump.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        pump::teardown(&self.pump);
        trace!(id = %self.id, "client disconnected");
        self.handler.on_disconnect(self);
    }

    fn handshake_complete(self: &Arc<Self>) {
        trace!(id = %self.id, "client handshaked");
        self.handler.on_handshaked(self);
        pump::try_receive(self);
        if self.pump.send.lock().unwrap().main.is_empty() {
            self.handler.on_empty(self);
        }
    }
}

impl IoSource for TcpClient {
    fn on_ready(self: Arc<Self>, readable: bool, writable: bool) {
        if self.is_connecting() {
            if writable {
                self.finish_connect();
            }
            if self.is_connecting() {
                return;
            }
            if !self.is_connected() {
                return;
            }
        }
        pump::on_ready(&self, readable, writable);
    }
}
