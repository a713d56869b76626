//! netline — reactor-based asynchronous TCP/TLS networking runtime.
//!
//! A multi-threaded I/O [`Service`] drives a pool of event reactors. On top
//! of it sit a symmetric pair of connection abstractions: a [`TcpServer`]
//! that accepts inbound connections, spawns a [`TcpSession`] per socket and
//! multicasts to them, and a [`TcpClient`] that connects outbound. Both
//! sides share one byte pump: an elastic receive buffer with a configurable
//! ceiling, a backpressure-aware double-buffered send queue, per-connection
//! byte counters, and synchronous send/receive with optional deadlines. An
//! optional TLS layer (rustls) wraps the byte stream transparently behind a
//! handshake phase.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netline::{
//!     DefaultServiceHandler, Service, ServerHandler, SessionHandler,
//!     TcpServer, TcpSession, IpProtocol,
//! };
//!
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn on_receive(&self, session: &Arc<TcpSession>, data: &[u8]) {
//!         session.send_async(data);
//!     }
//! }
//!
//! struct EchoServer;
//!
//! impl ServerHandler for EchoServer {
//!     fn session_handler(&self) -> Arc<dyn SessionHandler> {
//!         Arc::new(Echo)
//!     }
//! }
//!
//! let service = Service::new(Arc::new(DefaultServiceHandler), 1, false).unwrap();
//! service.start(false);
//! let server = TcpServer::new(&service, Arc::new(EchoServer), 7878, IpProtocol::V4);
//! server.start();
//! # server.stop();
//! # service.stop();
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod arena;
pub(crate) mod pump;
pub(crate) mod sockopt;
pub(crate) mod strand;
pub(crate) mod stream;

// ── Public modules ──────────────────────────────────────────────────────
pub mod client;
pub mod counter;
pub mod error;
pub mod reactor;
pub mod server;
pub mod service;
pub mod session;
pub mod timer;
pub mod tls;

// ── Re-exports: service ─────────────────────────────────────────────────

/// Service handler with every callback at its default.
pub use service::DefaultServiceHandler;
/// Multi-threaded I/O service owning one or more reactors.
pub use service::Service;
/// Service lifecycle and worker-thread callbacks.
pub use service::ServiceHandler;

/// A single event loop, shareable across services.
pub use reactor::Reactor;

// ── Re-exports: server side ─────────────────────────────────────────────

/// Server handler with every hook at its default.
pub use server::DefaultServerHandler;
/// Address family for the port-only server constructor.
pub use server::IpProtocol;
/// Server lifecycle hooks plus the per-session handler factory.
pub use server::ServerHandler;
/// A TCP or TLS server bound to one endpoint.
pub use server::TcpServer;

/// Session handler with every hook at its default.
pub use session::DefaultSessionHandler;
/// Per-session user hooks.
pub use session::SessionHandler;
/// A server-side connection.
pub use session::TcpSession;

// ── Re-exports: client side ─────────────────────────────────────────────

/// Client handler with every hook at its default.
pub use client::DefaultClientHandler;
/// Per-client user hooks.
pub use client::ClientHandler;
/// An outbound TCP or TLS connection.
pub use client::TcpClient;

// ── Re-exports: shared types ────────────────────────────────────────────

/// Runtime errors.
pub use error::Error;
/// A one-shot timer with async and sync wait.
pub use timer::Timer;
/// A TLS configuration bound to a role.
pub use tls::TlsContext;
/// Which side of the handshake a TLS context drives.
pub use tls::TlsRole;

/// Handle to one sharded runtime metric.
pub use counter::Counter;
/// The runtime totals netline tracks.
pub use counter::RuntimeMetric;
