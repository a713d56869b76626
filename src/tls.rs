//! TLS context and connection dispatch.
//!
//! A [`TlsContext`] carries a pre-built rustls config for one role; the
//! caller loads certificates and keys and configures verification, or uses
//! the PEM-file convenience constructors. Endpoints build a fresh rustls
//! connection from the context on every connect or accept.

use std::io;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConnection, RootCertStore, ServerConnection};

use crate::error::Error;

/// Which side of the handshake a context drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

/// A TLS configuration bound to a role.
pub struct TlsContext {
    server: Option<Arc<rustls::ServerConfig>>,
    client: Option<Arc<rustls::ClientConfig>>,
}

impl TlsContext {
    /// Wrap a pre-built server config.
    pub fn server(config: Arc<rustls::ServerConfig>) -> Arc<Self> {
        Arc::new(TlsContext {
            server: Some(config),
            client: None,
        })
    }

    /// Wrap a pre-built client config.
    pub fn client(config: Arc<rustls::ClientConfig>) -> Arc<Self> {
        Arc::new(TlsContext {
            server: None,
            client: Some(config),
        })
    }

    /// Build a server context from a PEM certificate chain and private key.
    pub fn server_from_pem(cert_path: &str, key_path: &str) -> Result<Arc<Self>, Error> {
        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
            .map_err(|e| Error::Setup(format!("{cert_path}: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Setup(format!("{cert_path}: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Setup(format!("{cert_path}: no certificates")));
        }
        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|e| Error::Setup(format!("{key_path}: {e}")))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self::server(Arc::new(config)))
    }

    /// Build a client context trusting the roots in a PEM file.
    pub fn client_from_pem(root_path: &str) -> Result<Arc<Self>, Error> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(root_path)
            .map_err(|e| Error::Setup(format!("{root_path}: {e}")))?
        {
            let cert = cert.map_err(|e| Error::Setup(format!("{root_path}: {e}")))?;
            roots.add(cert)?;
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::client(Arc::new(config)))
    }

    /// The role this context can drive.
    pub fn role(&self) -> TlsRole {
        if self.server.is_some() {
            TlsRole::Server
        } else {
            TlsRole::Client
        }
    }

    pub(crate) fn new_server_conn(&self) -> Result<TlsConnKind, Error> {
        let config = self
            .server
            .as_ref()
            .ok_or(Error::InvalidArgument("client TLS context on a server"))?;
        Ok(TlsConnKind::Server(ServerConnection::new(Arc::clone(
            config,
        ))?))
    }

    pub(crate) fn new_client_conn(&self, server_name: &str) -> Result<TlsConnKind, Error> {
        let config = self
            .client
            .as_ref()
            .ok_or(Error::InvalidArgument("server TLS context on a client"))?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::InvalidArgument("invalid TLS server name"))?;
        Ok(TlsConnKind::Client(ClientConnection::new(
            Arc::clone(config),
            name,
        )?))
    }
}

/// TLS connection dispatch: server (inbound) or client (outbound).
pub(crate) enum TlsConnKind {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsConnKind {
    pub fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsConnKind::Server(c) => c.read_tls(rd),
            TlsConnKind::Client(c) => c.read_tls(rd),
        }
    }

    pub fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsConnKind::Server(c) => c.write_tls(wr),
            TlsConnKind::Client(c) => c.write_tls(wr),
        }
    }

    pub fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnKind::Server(c) => c.process_new_packets(),
            TlsConnKind::Client(c) => c.process_new_packets(),
        }
    }

    pub fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnKind::Server(c) => c.reader(),
            TlsConnKind::Client(c) => c.reader(),
        }
    }

    pub fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnKind::Server(c) => c.writer(),
            TlsConnKind::Client(c) => c.writer(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsConnKind::Server(c) => c.wants_write(),
            TlsConnKind::Client(c) => c.wants_write(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsConnKind::Server(c) => c.is_handshaking(),
            TlsConnKind::Client(c) => c.is_handshaking(),
        }
    }

    pub fn send_close_notify(&mut self) {
        match self {
            TlsConnKind::Server(c) => c.send_close_notify(),
            TlsConnKind::Client(c) => c.send_close_notify(),
        }
    }

    /// Drive a blocking handshake over a blocking socket.
    pub fn complete_handshake<T: io::Read + io::Write>(&mut self, sock: &mut T) -> io::Result<()> {
        while self.is_handshaking() {
            match self {
                TlsConnKind::Server(c) => c.complete_io(sock)?,
                TlsConnKind::Client(c) => c.complete_io(sock)?,
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/cert.pem");
    const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/key.pem");

    #[test]
    fn server_context_from_pem() {
        let context = TlsContext::server_from_pem(CERT, KEY).unwrap();
        assert_eq!(context.role(), TlsRole::Server);
        assert!(context.new_server_conn().is_ok());
        assert!(matches!(
            context.new_client_conn("localhost"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn client_context_from_pem() {
        let context = TlsContext::client_from_pem(CERT).unwrap();
        assert_eq!(context.role(), TlsRole::Client);
        assert!(context.new_client_conn("localhost").is_ok());
        assert!(matches!(
            context.new_server_conn(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_files_fail_setup() {
        assert!(matches!(
            TlsContext::server_from_pem("/nonexistent/cert.pem", "/nonexistent/key.pem"),
            Err(Error::Setup(_))
        ));
    }
}
