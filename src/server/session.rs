//! Per-exchange state.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use super::registry::ConnectionHandle;
use crate::http::Request;

/// Where an exchange is in the pipeline. Carried by timeout and transport
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Accepting,
    Handshaking,
    AwaitingHeader,
    AwaitingFixedBody,
    AwaitingChunkSize,
    AwaitingChunkData,
    Routing,
    Handling,
    Sending,
    Closing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Accepting => "accepting",
            Stage::Handshaking => "handshake",
            Stage::AwaitingHeader => "awaiting header",
            Stage::AwaitingFixedBody => "awaiting fixed-length body",
            Stage::AwaitingChunkSize => "awaiting chunk size",
            Stage::AwaitingChunkData => "awaiting chunk data",
            Stage::Routing => "routing",
            Stage::Handling => "handling",
            Stage::Sending => "sending response",
            Stage::Closing => "closing",
        })
    }
}

/// One request/response exchange on a connection. A keep-alive connection
/// creates a fresh session per request.
#[derive(Debug)]
pub struct Session {
    connection: Arc<ConnectionHandle>,
    request: Option<Request>,
    stage: Stage,
    started: Instant,
}

impl Session {
    pub fn new(connection: Arc<ConnectionHandle>) -> Self {
        Self {
            connection,
            request: None,
            stage: Stage::AwaitingHeader,
            started: Instant::now(),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, stage: Stage) {
        trace!(
            connection = self.connection.id(),
            from = %self.stage,
            to = %stage,
            elapsed = ?self.started.elapsed(),
            "session stage"
        );
        self.stage = stage;
    }

    /// Stores the parsed request and returns it for further filling in.
    pub fn set_request(&mut self, request: Request) -> &mut Request {
        self.request.insert(request)
    }

    /// The request, once its header block has been parsed.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut Request> {
        self.request.as_mut()
    }

    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::ConnectionRegistry;

    #[test]
    fn stage_names() {
        assert_eq!(Stage::AwaitingHeader.to_string(), "awaiting header");
        assert_eq!(Stage::AwaitingChunkData.to_string(), "awaiting chunk data");
        assert_eq!(Stage::Sending.to_string(), "sending response");
    }

    #[test]
    fn session_tracks_stage_and_request() {
        let registry = ConnectionRegistry::new();
        let registration = registry.register(None);
        let mut session = Session::new(Arc::clone(registration.handle()));
        assert_eq!(session.stage(), Stage::AwaitingHeader);
        assert!(session.request().is_none());

        let request = Request::parse(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        session.set_request(request).set_body("x".into());
        session.advance(Stage::Routing);
        assert_eq!(session.stage(), Stage::Routing);
        assert_eq!(session.request().map(|r| r.path()), Some("/a"));
        assert!(session.take_request().is_some());
        assert!(session.request().is_none());
        assert_eq!(session.connection().id(), registration.handle().id());
    }
}
