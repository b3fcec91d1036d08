//! Error types for the server lifecycle and for individual exchanges.

use std::io;

use thiserror::Error;

use super::session::Stage;
use super::tls::TlsError;
use crate::http::codec::ProtocolError;

/// Errors returned by the server lifecycle (`bind`, `start`, TLS setup).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid bind address {addr:?}")]
    Address { addr: String },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build the worker runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("server is not bound; call bind() first")]
    NotBound,

    #[error("server has been stopped")]
    Stopped,

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Coarse classification of a [`ServeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MessageTooLarge,
    ProtocolError,
    Timeout,
    HandlerFault,
    TransportError,
}

/// Why the pipeline abandoned an exchange.
///
/// Delivered to the error callback registered with
/// [`Server::on_error`](super::Server::on_error). None of these escape the
/// connection they happened on.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The request outgrew the configured buffer cap. A 413 was sent.
    #[error("request exceeds the maximum buffer size of {limit} bytes")]
    MessageTooLarge { limit: usize },

    /// Malformed request line, header block, content length or chunk size.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A stage deadline expired and the connection was closed.
    #[error("{stage} timed out")]
    Timeout { stage: Stage },

    /// The route handler panicked; the operation was canceled.
    #[error("operation canceled: handler panicked: {message}")]
    HandlerFault { message: String },

    /// The underlying stream failed during accept, handshake, read or write.
    #[error("transport error during {stage}: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    /// The connection was closed deliberately (server stop). Never reported.
    #[error("operation aborted")]
    Aborted,
}

impl ServeError {
    pub(crate) fn transport(stage: Stage, source: io::Error) -> Self {
        Self::Transport { stage, source }
    }

    /// The taxonomy bucket, or `None` for the deliberate-shutdown signal.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::MessageTooLarge { .. } => Some(ErrorKind::MessageTooLarge),
            Self::Protocol(_) => Some(ErrorKind::ProtocolError),
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::HandlerFault { .. } => Some(ErrorKind::HandlerFault),
            Self::Transport { .. } => Some(ErrorKind::TransportError),
            Self::Aborted => None,
        }
    }

    /// Returns `true` for errors that are swallowed instead of reported.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
