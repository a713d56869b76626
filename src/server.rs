//! TCP/TLS server: accepts inbound connections, spawns per-connection
//! sessions, and multicasts to them.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mio::net::TcpListener;
use mio::{Interest, Token};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::counter;
use crate::error::{describe, is_benign, Error};
use crate::reactor::{IoSource, Reactor};
use crate::service::Service;
use crate::session::{DefaultSessionHandler, SessionHandler, TcpSession};
use crate::strand::Strand;
use crate::stream::Transport;
use crate::tls::{TlsContext, TlsRole};

const LISTEN_BACKLOG: libc::c_int = 1024;

/// Address family for the port-only constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    V4,
    V6,
}

/// Server lifecycle hooks plus the per-session handler factory.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_start(&self) {}
    fn on_stop(&self) {}
    /// A session connected (for TLS servers, before its handshake).
    fn on_connect(&self, _session: &Arc<TcpSession>) {}
    /// A session was torn down.
    fn on_disconnect(&self, _session: &Arc<TcpSession>) {}
    /// TLS only: a session completed its handshake.
    fn on_handshaked(&self, _session: &Arc<TcpSession>) {}
    fn on_error(&self, _code: i32, _category: &str, _message: &str) {}
    /// Factory for the handler attached to each accepted session.
    fn session_handler(&self) -> Arc<dyn SessionHandler> {
        Arc::new(DefaultSessionHandler)
    }
}

/// Handler with every hook at its default.
pub struct DefaultServerHandler;

impl ServerHandler for DefaultServerHandler {}

/// A TCP or TLS server bound to one endpoint.
pub struct TcpServer {
    id: Uuid,
    service: Arc<Service>,
    reactor: Arc<Reactor>,
    strand: Option<Arc<Strand>>,
    handler: Arc<dyn ServerHandler>,
    tls: Option<Arc<TlsContext>>,
    endpoint: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    listener_token: Mutex<Option<Token>>,
    sessions: RwLock<HashMap<Uuid, Arc<TcpSession>>>,
    started: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    keep_alive: AtomicBool,
    no_delay: AtomicBool,
    reuse_address: AtomicBool,
    reuse_port: AtomicBool,
    recv_limit: AtomicUsize,
    send_limit: AtomicUsize,
}

impl TcpServer {
    /// Bind to a port on the wildcard address of the given family.
    pub fn new(
        service: &Arc<Service>,
        handler: Arc<dyn ServerHandler>,
        port: u16,
        protocol: IpProtocol,
    ) -> Arc<Self> {
        let endpoint = match protocol {
            IpProtocol::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            IpProtocol::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        };
        Self::build(service, handler, None, endpoint)
    }

    /// Bind to an address/port pair. The address must be a literal IP.
    pub fn with_address(
        service: &Arc<Service>,
        handler: Arc<dyn ServerHandler>,
        address: &str,
        port: u16,
    ) -> Result<Arc<Self>, Error> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| Error::InvalidArgument("invalid bind address"))?;
        Ok(Self::build(service, handler, None, SocketAddr::new(ip, port)))
    }

    /// Bind to a pre-built endpoint.
    pub fn with_endpoint(
        service: &Arc<Service>,
        handler: Arc<dyn ServerHandler>,
        endpoint: SocketAddr,
    ) -> Arc<Self> {
        Self::build(service, handler, None, endpoint)
    }

    /// TLS server on a port. Accepted sessions run the server-side
    /// handshake with the given context.
    pub fn new_tls(
        service: &Arc<Service>,
        handler: Arc<dyn ServerHandler>,
        context: Arc<TlsContext>,
        port: u16,
        protocol: IpProtocol,
    ) -> Result<Arc<Self>, Error> {
        check_server_role(&context)?;
        let endpoint = match protocol {
            IpProtocol::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            IpProtocol::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        };
        Ok(Self::build(service, handler, Some(context), endpoint))
    }

    /// TLS server on an address/port pair.
    pub fn with_address_tls(
        service: &Arc<Service>,
        handler: Arc<dyn ServerHandler>,
        context: Arc<TlsContext>,
        address: &str,
        port: u16,
    ) -> Result<Arc<Self>, Error> {
        check_server_role(&context)?;
        let ip: IpAddr = address
            .parse()
            .map_err(|_| Error::InvalidArgument("invalid bind address"))?;
        Ok(Self::build(
            service,
            handler,
            Some(context),
            SocketAddr::new(ip, port),
        ))
    }

    fn build(
        service: &Arc<Service>,
        handler: Arc<dyn ServerHandler>,
        tls: Option<Arc<TlsContext>>,
        endpoint: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(TcpServer {
            id: Uuid::new_v4(),
            service: Arc::clone(service),
            reactor: service.next_reactor(),
            strand: service.strand(),
            handler,
            tls,
            endpoint,
            listener: Mutex::new(None),
            listener_token: Mutex::new(None),
            sessions: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            keep_alive: AtomicBool::new(false),
            no_delay: AtomicBool::new(false),
            reuse_address: AtomicBool::new(false),
            reuse_port: AtomicBool::new(false),
            recv_limit: AtomicUsize::new(0),
            send_limit: AtomicUsize::new(0),
        })
    }

    /// Unique server identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub(crate) fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Outbound bytes queued across all sessions.
    pub fn bytes_pending(&self) -> u64 {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|s| s.bytes_pending())
            .sum()
    }

    pub fn connected_sessions(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    // ── Socket option defaults inherited by accepted sessions ──────────

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Relaxed)
    }

    pub fn set_keep_alive(&self, enable: bool) {
        self.keep_alive.store(enable, Ordering::Relaxed);
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay.load(Ordering::Relaxed)
    }

    pub fn set_no_delay(&self, enable: bool) {
        self.no_delay.store(enable, Ordering::Relaxed);
    }

    pub fn reuse_address(&self) -> bool {
        self.reuse_address.load(Ordering::Relaxed)
    }

    pub fn set_reuse_address(&self, enable: bool) {
        self.reuse_address.store(enable, Ordering::Relaxed);
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port.load(Ordering::Relaxed)
    }

    pub fn set_reuse_port(&self, enable: bool) {
        self.reuse_port.store(enable, Ordering::Relaxed);
    }

    pub fn receive_buff_limit(&self) -> usize {
        self.recv_limit.load(Ordering::Relaxed)
    }

    pub fn set_receive_buff_limit(&self, limit: usize) {
        self.recv_limit.store(limit, Ordering::Relaxed);
    }

    pub fn send_buff_limit(&self) -> usize {
        self.send_limit.load(Ordering::Relaxed)
    }

    pub fn set_send_buff_limit(&self, limit: usize) {
        self.send_limit.store(limit, Ordering::Relaxed);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start accepting. Returns false when already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.is_started() {
            return false;
        }
        let server = Arc::clone(self);
        self.post_control(move || server.do_start());
        true
    }

    /// Stop accepting and disconnect every session. Returns false when not
    /// started.
    pub fn stop(self: &Arc<Self>) -> bool {
        if !self.is_started() {
            return false;
        }
        let server = Arc::clone(self);
        self.post_control(move || server.do_stop());
        true
    }

    /// Stop, wait for the stop to land, and start again.
    pub fn restart(self: &Arc<Self>) -> bool {
        if !self.stop() {
            return false;
        }
        while self.is_started() {
            std::thread::yield_now();
        }
        self.start()
    }

    /// Best-effort broadcast to every connected session.
    pub fn multicast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        for session in self.sessions.read().unwrap().values() {
            session.send_async(data);
        }
        true
    }

    /// Look up a session by its identity.
    pub fn find_session(&self, id: &Uuid) -> Option<Arc<TcpSession>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// Schedule a disconnect for every session.
    pub fn disconnect_all(self: &Arc<Self>) -> bool {
        if !self.is_started() {
            return false;
        }
        let server = Arc::clone(self);
        self.dispatch_control(move || {
            if !server.is_started() {
                return;
            }
            let sessions: Vec<_> = server.sessions.read().unwrap().values().cloned().collect();
            for session in sessions {
                session.disconnect();
            }
        });
        true
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn do_start(self: &Arc<Self>) {
        if self.is_started() {
            return;
        }

        let listener = match self.open_listener() {
            Ok(listener) => listener,
            Err(e) => {
                self.funnel(&e);
                return;
            }
        };

        let mut listener = TcpListener::from_std(listener);
        let as_source: Arc<dyn IoSource> = Arc::clone(self) as Arc<dyn IoSource>;
        let token = match self.reactor.register(
            &mut listener,
            Interest::READABLE,
            Arc::downgrade(&as_source),
        ) {
            Ok(token) => token,
            Err(e) => {
                self.funnel(&e);
                return;
            }
        };

        *self.listener.lock().unwrap() = Some(listener);
        *self.listener_token.lock().unwrap() = Some(token);

        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.started.store(true, Ordering::Release);

        debug!(endpoint = %self.endpoint, tls = self.is_tls(), "server started");
        self.handler.on_start();

        self.accept_loop();
    }

    fn do_stop(self: &Arc<Self>) {
        if !self.is_started() {
            return;
        }

        let token = self.listener_token.lock().unwrap().take();
        let listener = self.listener.lock().unwrap().take();
        if let (Some(mut listener), Some(token)) = (listener, token) {
            let _ = self.reactor.deregister(&mut listener, token);
        }

        let sessions: Vec<_> = self.sessions.read().unwrap().values().cloned().collect();
        for session in sessions {
            session.disconnect();
        }

        self.started.store(false, Ordering::Release);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);

        debug!(endpoint = %self.endpoint, "server stopped");
        self.handler.on_stop();
    }

    /// Build the listening socket: family from the endpoint, optional
    /// `SO_REUSEADDR`/`SO_REUSEPORT`, bind, listen, non-blocking.
    fn open_listener(&self) -> io::Result<std::net::TcpListener> {
        let domain = if self.endpoint.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };

        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        if self.reuse_address.load(Ordering::Relaxed) {
            crate::sockopt::set_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        }
        if self.reuse_port.load(Ordering::Relaxed) {
            crate::sockopt::set_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(self.endpoint, &mut storage);
        let ret =
            unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(std::net::TcpListener::from(owned))
    }

    fn accept_loop(self: &Arc<Self>) {
        loop {
            if !self.is_started() {
                return;
            }

            let accepted = {
                let mut guard = self.listener.lock().unwrap();
                let Some(listener) = guard.as_mut() else {
                    return;
                };
                listener.accept()
            };

            match accepted {
                Ok((stream, peer)) => {
                    counter::CONNECTIONS_ACCEPTED.increment();
                    trace!(%peer, "accepted connection");
                    self.setup_session(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_benign(e) => continue,
                Err(e) => {
                    self.funnel(&e);
                    return;
                }
            }
        }
    }

    fn setup_session(self: &Arc<Self>, stream: mio::net::TcpStream) {
        let transport = match &self.tls {
            None => Transport::Plain(stream),
            Some(context) => match context.new_server_conn() {
                Ok(conn) => Transport::Tls { sock: stream, conn },
                Err(e) => {
                    let message = e.to_string();
                    self.handler.on_error(0, "tls", &message);
                    return;
                }
            },
        };

        let session = TcpSession::new(self, self.handler.session_handler());
        *session.pump_ref().transport.lock().unwrap() = Some(transport);

        self.register_session(&session);
        session.connect_accepted();
    }

    fn register_session(&self, session: &Arc<TcpSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id(), Arc::clone(session));
    }

    pub(crate) fn unregister_session(&self, id: &Uuid) {
        self.sessions.write().unwrap().remove(id);
    }

    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn notify_connect(&self, session: &Arc<TcpSession>) {
        self.handler.on_connect(session);
    }

    pub(crate) fn notify_disconnect(&self, session: &Arc<TcpSession>) {
        self.handler.on_disconnect(session);
    }

    pub(crate) fn notify_handshaked(&self, session: &Arc<TcpSession>) {
        self.handler.on_handshaked(session);
    }

    pub(crate) fn post_control<F: FnOnce() + Send + 'static>(&self, task: F) {
        match &self.strand {
            Some(strand) => strand.post(Box::new(task)),
            None => self.reactor.post(Box::new(task)),
        }
    }

    pub(crate) fn dispatch_control<F: FnOnce() + Send + 'static>(&self, task: F) {
        match &self.strand {
            Some(strand) => strand.dispatch(Box::new(task)),
            None => self.reactor.dispatch(Box::new(task)),
        }
    }

    fn funnel(&self, err: &io::Error) {
        if is_benign(err) {
            trace!(%err, "benign accept error");
            return;
        }
        let (code, category, message) = describe(err);
        self.handler.on_error(code, category, &message);
    }
}

impl IoSource for TcpServer {
    fn on_ready(self: Arc<Self>, readable: bool, _writable: bool) {
        if readable {
            self.accept_loop();
        }
    }
}

fn check_server_role(context: &Arc<TlsContext>) -> Result<(), Error> {
    if context.role() != TlsRole::Server {
        return Err(Error::InvalidArgument("client TLS context on a server"));
    }
    Ok(())
}

fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}
