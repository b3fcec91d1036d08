//! The two transports a server can run on.
//!
//! Everything above the transport (parsing, routing, timeouts, keep-alive)
//! is shared; a transport only decides how an accepted TCP stream becomes
//! the byte stream requests are read from.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use super::tls::{self, TlsError};

/// Turns an accepted TCP stream into a request stream.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Scheme name, used in logs.
    const SCHEME: &'static str;

    /// Runs whatever handshake the transport needs. Bounded by the request
    /// timeout.
    fn handshake(&self, tcp: TcpStream) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain HTTP over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTransport;

impl Transport for PlainTransport {
    type Stream = TcpStream;

    const SCHEME: &'static str = "http";

    async fn handshake(&self, tcp: TcpStream) -> io::Result<TcpStream> {
        Ok(tcp)
    }
}

/// HTTP over TLS.
#[derive(Clone)]
pub struct TlsTransport {
    acceptor: TlsAcceptor,
}

impl TlsTransport {
    /// Loads the certificate chain and private key, and optionally the roots
    /// client certificates must chain to.
    pub fn from_files(
        cert_file: impl AsRef<Path>,
        private_key_file: impl AsRef<Path>,
        verify_file: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let config = tls::server_config(cert_file.as_ref(), private_key_file.as_ref(), verify_file)?;
        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport").finish_non_exhaustive()
    }
}

impl Transport for TlsTransport {
    type Stream = TlsStream<TcpStream>;

    const SCHEME: &'static str = "https";

    async fn handshake(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        self.acceptor.accept(tcp).await
    }
}
