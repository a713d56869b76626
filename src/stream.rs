//! Transport: the byte-pump verbs over a plain or TLS socket.
//!
//! Endpoints are polymorphic over `{read_some, write_some, handshake_step,
//! graceful_shutdown}`; the TLS variant routes bytes through rustls while
//! the plain variant hits the socket directly. Verbs return `WouldBlock`
//! when the caller must park on readiness.

use std::io::{self, Read, Write};

use mio::net::TcpStream;

use crate::error::tls_to_io;
use crate::tls::TlsConnKind;

/// Largest plaintext chunk pushed into rustls per `write_some` call. Bounds
/// the ciphertext buffered when the socket stops accepting writes.
const MAX_TLS_WRITE: usize = 16 * 1024;

pub(crate) enum HandshakeStatus {
    InProgress,
    Complete,
}

pub(crate) enum Transport {
    Plain(TcpStream),
    Tls { sock: TcpStream, conn: TlsConnKind },
}

impl Transport {
    pub(crate) fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls { sock, .. } => sock,
        }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls { sock, .. } => sock,
        }
    }

    /// Read at most `buf.len()` payload bytes. End of stream surfaces as
    /// `UnexpectedEof` so the caller funnels it through the benign filter.
    pub(crate) fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => loop {
                match sock.read(buf) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => return Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
            Transport::Tls { sock, conn } => loop {
                match conn.reader().read(buf) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => return Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }

                match conn.read_tls(sock) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {
                        let state = match conn.process_new_packets() {
                            Ok(state) => state,
                            Err(e) => {
                                // Push the alert out before reporting.
                                let _ = flush_tls(sock, conn);
                                return Err(tls_to_io(e));
                            }
                        };
                        if conn.wants_write() {
                            let _ = flush_tls(sock, conn);
                        }
                        if state.peer_has_closed() && state.plaintext_bytes_to_read() == 0 {
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Write at most `data.len()` payload bytes, returning how many were
    /// accepted.
    pub(crate) fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => loop {
                match sock.write(data) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => return Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
            Transport::Tls { sock, conn } => {
                // Ciphertext from a previous round must drain before more
                // plaintext is buffered.
                if conn.wants_write() {
                    flush_tls(sock, conn)?;
                }

                let chunk = &data[..data.len().min(MAX_TLS_WRITE)];
                let n = conn.writer().write(chunk).map_err(io::Error::other)?;

                match flush_tls(sock, conn) {
                    Ok(()) => {}
                    // The plaintext is committed; remaining ciphertext goes
                    // out on the next writable edge.
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                Ok(n)
            }
        }
    }

    /// Whether buffered ciphertext is waiting for a writable socket.
    pub(crate) fn wants_flush(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls { conn, .. } => conn.wants_write(),
        }
    }

    /// Push buffered ciphertext to the socket, best effort.
    pub(crate) fn flush_pending(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            Transport::Tls { sock, conn } => match flush_tls(sock, conn) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                other => other,
            },
        }
    }

    /// Advance the handshake phase. Plain transports are born complete.
    pub(crate) fn handshake_step(&mut self) -> io::Result<HandshakeStatus> {
        match self {
            Transport::Plain(_) => Ok(HandshakeStatus::Complete),
            Transport::Tls { sock, conn } => loop {
                if !conn.is_handshaking() {
                    if conn.wants_write() {
                        let _ = flush_tls(sock, conn);
                    }
                    return Ok(HandshakeStatus::Complete);
                }

                if conn.wants_write() {
                    match flush_tls(sock, conn) {
                        Ok(()) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(HandshakeStatus::InProgress)
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }

                match conn.read_tls(sock) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {
                        if let Err(e) = conn.process_new_packets() {
                            let _ = flush_tls(sock, conn);
                            return Err(tls_to_io(e));
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::InProgress)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Announce teardown to the peer. TLS queues a close_notify and flushes
    /// it best effort; errors are ignored because the socket close that
    /// follows is the authoritative teardown.
    pub(crate) fn graceful_shutdown(&mut self) {
        if let Transport::Tls { sock, conn } = self {
            conn.send_close_notify();
            let _ = flush_tls(sock, conn);
        }
    }
}

fn flush_tls(sock: &mut TcpStream, conn: &mut TlsConnKind) -> io::Result<()> {
    while conn.wants_write() {
        match conn.write_tls(sock) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
