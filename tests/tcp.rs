//! Integration tests: real TCP connections between netline servers and
//! clients on 127.0.0.1 ephemeral ports.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netline::{
    ClientHandler, DefaultServiceHandler, ServerHandler, Service, ServiceHandler, SessionHandler,
    TcpClient, TcpServer, TcpSession,
};

// ── Helpers ─────────────────────────────────────────────────────────────

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::yield_now();
    }
}

#[derive(Default)]
struct ServerState {
    started: AtomicBool,
    stopped: AtomicBool,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    errors: AtomicUsize,
}

struct EchoServerHandler {
    state: Arc<ServerState>,
    echo: bool,
}

impl ServerHandler for EchoServerHandler {
    fn on_start(&self) {
        self.state.started.store(true, Ordering::SeqCst);
    }
    fn on_stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
    }
    fn on_connect(&self, _session: &Arc<TcpSession>) {
        self.state.connected.fetch_add(1, Ordering::SeqCst);
    }
    fn on_disconnect(&self, _session: &Arc<TcpSession>) {
        self.state.disconnected.fetch_add(1, Ordering::SeqCst);
    }
    fn on_error(&self, _code: i32, _category: &str, _message: &str) {
        self.state.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn session_handler(&self) -> Arc<dyn SessionHandler> {
        if self.echo {
            Arc::new(EchoSessionHandler)
        } else {
            Arc::new(netline::DefaultSessionHandler)
        }
    }
}

struct EchoSessionHandler;

impl SessionHandler for EchoSessionHandler {
    fn on_receive(&self, session: &Arc<TcpSession>, data: &[u8]) {
        session.send_async(data);
    }
}

#[derive(Default)]
struct ClientState {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    empties: AtomicUsize,
    errors: AtomicUsize,
    last_error: AtomicI32,
}

struct TestClientHandler {
    state: Arc<ClientState>,
}

impl ClientHandler for TestClientHandler {
    fn on_connect(&self, _client: &Arc<TcpClient>) {
        self.state.connected.fetch_add(1, Ordering::SeqCst);
    }
    fn on_disconnect(&self, _client: &Arc<TcpClient>) {
        self.state.disconnected.fetch_add(1, Ordering::SeqCst);
    }
    fn on_empty(&self, _client: &Arc<TcpClient>) {
        self.state.empties.fetch_add(1, Ordering::SeqCst);
    }
    fn on_error(&self, code: i32, _category: &str, _message: &str) {
        self.state.errors.fetch_add(1, Ordering::SeqCst);
        self.state.last_error.store(code, Ordering::SeqCst);
    }
}

struct EchoRig {
    service: Arc<Service>,
    server: Arc<TcpServer>,
    server_state: Arc<ServerState>,
    port: u16,
}

fn start_echo_rig(threads: usize, echo: bool) -> EchoRig {
    let service = Service::new(Arc::new(DefaultServiceHandler), threads, false).unwrap();
    assert!(service.start(false));

    let port = free_port();
    let server_state = Arc::new(ServerState::default());
    let server = TcpServer::with_address(
        &service,
        Arc::new(EchoServerHandler {
            state: Arc::clone(&server_state),
            echo,
        }),
        "127.0.0.1",
        port,
    )
    .unwrap();
    assert!(server.start());
    wait_until("server started", || server.is_started());

    EchoRig {
        service,
        server,
        server_state,
        port,
    }
}

fn shutdown_rig(rig: EchoRig) {
    assert!(rig.server.stop());
    wait_until("server stopped", || !rig.server.is_started());
    assert!(rig.service.stop());
}

// ── Echo round-trip ─────────────────────────────────────────────────────

#[test]
fn echo_round_trip() {
    let rig = start_echo_rig(1, true);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );

    assert!(client.connect_async());
    wait_until("client ready", || client.is_ready());
    wait_until("session registered", || {
        rig.server.connected_sessions() == 1
    });

    assert!(client.send_async(b"test"));
    wait_until("echo received", || client.bytes_received() == 4);

    assert_eq!(client.bytes_sent(), 4);
    wait_until("server counters", || {
        rig.server.bytes_received() == 4 && rig.server.bytes_sent() == 4
    });

    assert!(client.disconnect_async());
    wait_until("client disconnected", || !client.is_connected());
    wait_until("session unregistered", || {
        rig.server.connected_sessions() == 0
    });

    assert_eq!(client_state.connected.load(Ordering::SeqCst), 1);
    assert_eq!(client_state.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(client_state.errors.load(Ordering::SeqCst), 0);

    assert_eq!(rig.server_state.connected.load(Ordering::SeqCst), 1);
    wait_until("server saw disconnect", || {
        rig.server_state.disconnected.load(Ordering::SeqCst) == 1
    });
    assert_eq!(rig.server_state.errors.load(Ordering::SeqCst), 0);

    shutdown_rig(rig);
}

// ── Multicast fan-out ───────────────────────────────────────────────────

#[test]
fn multicast_fan_out() {
    let rig = start_echo_rig(1, false);

    let mut clients: Vec<(Arc<TcpClient>, Arc<ClientState>)> = Vec::new();

    // Three clients join one at a time; after each join the server
    // multicasts 4 bytes to everyone currently connected.
    for round in 0..3usize {
        let state = Arc::new(ClientState::default());
        let client = TcpClient::new(
            &rig.service,
            Arc::new(TestClientHandler {
                state: Arc::clone(&state),
            }),
            "127.0.0.1",
            rig.port,
        );
        assert!(client.connect_async());
        clients.push((client, state));

        wait_until("client ready", || clients[round].0.is_ready());
        wait_until("all sessions registered", || {
            rig.server.connected_sessions() == round + 1
        });

        assert!(rig.server.multicast(b"test"));

        for (idx, (client, _)) in clients.iter().enumerate() {
            let expected = 4 * (round - idx + 1) as u64;
            wait_until("client received multicast", || {
                client.bytes_received() == expected
            });
        }
    }

    // Peel the clients off one at a time, multicasting after each leave.
    for leave in 0..3usize {
        assert!(clients[leave].0.disconnect_async());
        wait_until("client left", || !clients[leave].0.is_connected());
        wait_until("session count dropped", || {
            rig.server.connected_sessions() == 2 - leave
        });

        assert!(rig.server.multicast(b"test"));

        for (idx, (client, _)) in clients.iter().enumerate().skip(leave + 1) {
            let expected = 4 * (4 - idx + leave) as u64;
            wait_until("survivor received multicast", || {
                client.bytes_received() == expected
            });
        }
    }

    wait_until("server sent all multicast bytes", || {
        rig.server.bytes_sent() == 36
    });
    assert_eq!(rig.server.bytes_received(), 0);
    for (_, state) in &clients {
        assert_eq!(state.errors.load(Ordering::SeqCst), 0);
    }
    for (client, _) in &clients {
        assert_eq!(client.bytes_received(), 12);
        assert_eq!(client.bytes_sent(), 0);
    }

    shutdown_rig(rig);
}

// ── Backpressure ceiling ────────────────────────────────────────────────

#[test]
fn send_buff_limit_rejects_oversized_append() {
    let rig = start_echo_rig(1, false);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );
    client.set_send_buff_limit(16);

    assert!(client.connect_async());
    wait_until("client ready", || client.is_ready());

    let payload = [0u8; 20];
    assert!(!client.send_async(&payload));

    assert_eq!(client.bytes_sent(), 0);
    assert_eq!(client.bytes_pending(), 0);
    assert_eq!(client_state.errors.load(Ordering::SeqCst), 1);
    assert_eq!(
        client_state.last_error.load(Ordering::SeqCst),
        libc::ENOBUFS
    );

    // Within the ceiling still goes through.
    assert!(client.send_async(&payload[..8]));
    wait_until("small send flushed", || client.bytes_sent() == 8);

    assert!(client.disconnect_async());
    wait_until("client disconnected", || !client.is_connected());
    shutdown_rig(rig);
}

// ── Zero-size and boundary sends ────────────────────────────────────────

#[test]
fn zero_size_send_is_a_no_op() {
    let rig = start_echo_rig(1, true);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );

    // Not connected yet: append refused.
    assert!(!client.send_async(b"x"));

    assert!(client.connect_async());
    wait_until("client ready", || client.is_ready());

    assert!(client.send_async(&[]));
    assert_eq!(client.bytes_pending(), 0);
    assert_eq!(client.bytes_sent(), 0);

    let mut out = [0u8; 4];
    assert_eq!(client.receive(&mut out[..0], Duration::ZERO), 0);

    assert!(client.disconnect_async());
    wait_until("client disconnected", || !client.is_connected());
    shutdown_rig(rig);
}

// ── Synchronous send/receive ────────────────────────────────────────────

#[test]
fn sync_send_and_receive_round_trip() {
    let rig = start_echo_rig(1, true);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );

    // Sync connect does not arm the receive chain, so the echo stays in
    // the kernel buffer for the sync receive below.
    assert!(client.connect(), "sync connect failed");
    assert!(client.is_ready());

    assert_eq!(client.send(b"test", Duration::ZERO), 4);
    assert_eq!(client.bytes_sent(), 4);

    let mut out = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        let n = client.receive(&mut out[got..], Duration::from_secs(5));
        assert!(n > 0, "echo did not arrive");
        got += n;
    }
    assert_eq!(&out, b"test");
    assert_eq!(client.bytes_received(), 4);
    assert_eq!(client_state.errors.load(Ordering::SeqCst), 0);

    assert!(client.disconnect());
    assert_eq!(client_state.disconnected.load(Ordering::SeqCst), 1);
    shutdown_rig(rig);
}

#[test]
fn receive_timeout_returns_zero_without_error() {
    // Server sessions stay silent: nothing will ever arrive.
    let rig = start_echo_rig(1, false);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );
    assert!(client.connect(), "sync connect failed");

    let mut out = [0u8; 16];
    let start = Instant::now();
    let n = client.receive(&mut out, Duration::from_millis(10));
    let elapsed = start.elapsed();

    assert_eq!(n, 0);
    assert!(
        elapsed < Duration::from_secs(2),
        "timeout took {elapsed:?}"
    );
    assert_eq!(client_state.errors.load(Ordering::SeqCst), 0);
    assert!(client.is_connected());

    assert!(client.disconnect());
    shutdown_rig(rig);
}

// ── Send ordering ───────────────────────────────────────────────────────

#[test]
fn appended_sends_arrive_in_order() {
    let rig = start_echo_rig(1, true);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );
    assert!(client.connect(), "sync connect failed");

    let mut expected = Vec::new();
    for i in 0..32u8 {
        let chunk = [i; 64];
        assert!(client.send_async(&chunk));
        expected.extend_from_slice(&chunk);
    }

    let mut echoed = vec![0u8; expected.len()];
    let mut got = 0;
    while got < echoed.len() {
        let n = client.receive(&mut echoed[got..], Duration::from_secs(5));
        assert!(n > 0, "echo stalled at {got} bytes");
        got += n;
    }
    assert_eq!(echoed, expected);

    // At quiescence the counters account for every accepted byte.
    assert_eq!(client.bytes_pending() + client.bytes_sending() + client.bytes_sent(), 32 * 64);

    assert!(client.disconnect());
    shutdown_rig(rig);
}

// ── Reconnect ───────────────────────────────────────────────────────────

#[test]
fn reconnect_cycles() {
    let rig = start_echo_rig(1, true);

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &rig.service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        rig.port,
    );

    assert!(client.connect(), "sync connect failed");
    assert!(client.reconnect(), "reconnect failed");
    assert!(client.is_connected());

    assert_eq!(client_state.connected.load(Ordering::SeqCst), 2);
    assert_eq!(client_state.disconnected.load(Ordering::SeqCst), 1);

    assert!(client.disconnect());
    assert_eq!(
        client_state.connected.load(Ordering::SeqCst),
        client_state.disconnected.load(Ordering::SeqCst)
    );
    shutdown_rig(rig);
}

// ── Connection refused ──────────────────────────────────────────────────

#[test]
fn connect_to_dead_port_reports_disconnect_without_error() {
    let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
    assert!(service.start(false));

    // Bind then drop so nothing is listening.
    let dead_port = free_port();

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        dead_port,
    );

    assert!(!client.connect());
    assert!(!client.is_connected());
    // connection_refused is benign teardown: no on_error, but the
    // disconnect hook fires.
    assert_eq!(client_state.errors.load(Ordering::SeqCst), 0);
    assert_eq!(client_state.disconnected.load(Ordering::SeqCst), 1);

    assert!(client.connect_async());
    wait_until("async attempt settled", || {
        client_state.disconnected.load(Ordering::SeqCst) == 2
    });
    assert!(!client.is_connected());
    assert_eq!(client_state.errors.load(Ordering::SeqCst), 0);

    assert!(service.stop());
}

// ── disconnect_all / find_session ───────────────────────────────────────

#[test]
fn disconnect_all_clears_sessions() {
    let rig = start_echo_rig(2, true);

    let mut clients = Vec::new();
    for _ in 0..3 {
        let state = Arc::new(ClientState::default());
        let client = TcpClient::new(
            &rig.service,
            Arc::new(TestClientHandler {
                state: Arc::clone(&state),
            }),
            "127.0.0.1",
            rig.port,
        );
        assert!(client.connect_async());
        clients.push((client, state));
    }
    for (client, _) in &clients {
        wait_until("client ready", || client.is_ready());
    }
    wait_until("sessions registered", || rig.server.connected_sessions() == 3);

    assert!(rig.server.disconnect_all());
    wait_until("all sessions disconnected", || {
        rig.server.connected_sessions() == 0
    });
    for (client, _) in &clients {
        wait_until("client observed disconnect", || !client.is_connected());
    }

    shutdown_rig(rig);
}

// ── Service restart scenario ────────────────────────────────────────────

#[derive(Default)]
struct ServiceState {
    thread_init: AtomicUsize,
    thread_cleanup: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    errors: AtomicUsize,
}

struct CountingServiceHandler {
    state: Arc<ServiceState>,
}

impl ServiceHandler for CountingServiceHandler {
    fn on_thread_init(&self) {
        self.state.thread_init.fetch_add(1, Ordering::SeqCst);
    }
    fn on_thread_cleanup(&self) {
        self.state.thread_cleanup.fetch_add(1, Ordering::SeqCst);
    }
    fn on_started(&self) {
        self.state.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_stopped(&self) {
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
    }
    fn on_error(&self, _code: i32, _category: &str, _message: &str) {
        self.state.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn service_restart_with_per_thread_reactors() {
    let state = Arc::new(ServiceState::default());
    let service = Service::new(
        Arc::new(CountingServiceHandler {
            state: Arc::clone(&state),
        }),
        4,
        false,
    )
    .unwrap();

    assert!(service.start(false));
    assert!(service.restart());
    assert!(service.stop());

    assert!(state.thread_init.load(Ordering::SeqCst) >= 4);
    assert!(state.thread_cleanup.load(Ordering::SeqCst) >= 4);
    assert_eq!(state.started.load(Ordering::SeqCst), 2);
    assert_eq!(state.stopped.load(Ordering::SeqCst), 2);
    assert_eq!(state.errors.load(Ordering::SeqCst), 0);
}

// ── Shared-reactor (strand) mode end to end ─────────────────────────────

#[test]
fn echo_with_shared_reactor_and_strand() {
    let service = Service::new(Arc::new(DefaultServiceHandler), 4, true).unwrap();
    assert!(service.strand_needed());
    assert!(service.start(false));

    let port = free_port();
    let server_state = Arc::new(ServerState::default());
    let server = TcpServer::with_address(
        &service,
        Arc::new(EchoServerHandler {
            state: Arc::clone(&server_state),
            echo: true,
        }),
        "127.0.0.1",
        port,
    )
    .unwrap();
    assert!(server.start());
    wait_until("server started", || server.is_started());

    let client_state = Arc::new(ClientState::default());
    let client = TcpClient::new(
        &service,
        Arc::new(TestClientHandler {
            state: Arc::clone(&client_state),
        }),
        "127.0.0.1",
        port,
    );
    assert!(client.connect_async());
    wait_until("client ready", || client.is_ready());

    assert!(client.send_async(b"strand"));
    wait_until("echo received", || client.bytes_received() == 6);

    assert!(client.disconnect_async());
    wait_until("client disconnected", || !client.is_connected());

    assert!(server.stop());
    wait_until("server stopped", || !server.is_started());
    assert!(service.stop());

    assert_eq!(client_state.errors.load(Ordering::SeqCst), 0);
    assert_eq!(server_state.errors.load(Ordering::SeqCst), 0);
}
