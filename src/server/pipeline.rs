//! The per-connection request pipeline.
//!
//! One task per connection runs [`serve`]: handshake, then a loop of
//! exchanges, each of which reads a header block, reads the body it
//! announces, routes, runs the handler and sends the response. The
//! connection stays open for another exchange when keep-alive applies.
//!
//! Bytes read past the end of a request are kept for the next one, so
//! pipelined requests are served in order.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::Shared;
use super::connection::{self, Connection};
use super::error::ServeError;
use super::registry::Registration;
use super::session::{Session, Stage};
use super::transport::Transport;
use crate::http::codec::{self, ChunkDecoder, ChunkState, HEADER_TERMINATOR};
use crate::http::{Headers, Request, Response, StatusCode, Version};

const INITIAL_BUF_SIZE: usize = 4096;

/// Upper bounds on discarding input after a 413.
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);
const LINGER_MAX_BYTES: usize = 1 << 20;

/// Runs the handshake and then the pipeline for one accepted connection.
pub(crate) async fn serve<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    tcp: TcpStream,
    registration: Registration,
) {
    let deadline = connection::deadline_after(shared.config.timeout_request);
    let handshake = connection::guarded(
        registration.handle(),
        &shared.gate,
        deadline,
        Stage::Handshaking,
        transport.handshake(tcp),
    )
    .await;

    match handshake {
        Ok(stream) => {
            let conn = Connection::new(stream, registration, Arc::clone(&shared.gate));
            Pipeline::new(shared, conn).run().await;
        }
        Err(err) => {
            debug!(scheme = T::SCHEME, error = %err, "handshake failed");
            shared.report(None, &err);
        }
    }
}

/// How the body of a request is delimited.
#[derive(Debug, Clone, Copy)]
enum Framing {
    Length(usize),
    Chunked,
    Empty,
}

impl Framing {
    // Content-Length wins over Transfer-Encoding when both are present.
    fn of(headers: &Headers) -> Result<Self, ServeError> {
        if let Some(value) = headers.get("content-length") {
            return Ok(Self::Length(codec::parse_content_length(value)?));
        }
        if headers.contains_value("transfer-encoding", "chunked") {
            return Ok(Self::Chunked);
        }
        Ok(Self::Empty)
    }
}

/// What the synchronous routing step decided.
enum Dispatch {
    Respond { bytes: Bytes, keep_alive: bool },
    Upgrade,
    NoRoute,
}

/// How an exchange ended.
enum Outcome {
    KeepAlive,
    Close,
    Upgrade(Request),
}

pub(crate) struct Pipeline<S> {
    shared: Arc<Shared>,
    conn: Connection<S>,
    buf: BytesMut,
}

impl<S> Pipeline<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(shared: Arc<Shared>, conn: Connection<S>) -> Self {
        Self {
            shared,
            conn,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        }
    }

    fn limit(&self) -> usize {
        self.shared.config.max_request_size
    }

    pub(crate) async fn run(mut self) {
        let connection = self.conn.handle().id();
        debug!(connection, peer = ?self.conn.remote(), "serving connection");

        loop {
            let mut session = Session::new(Arc::clone(self.conn.handle()));
            match self.exchange(&mut session).await {
                Ok(Outcome::KeepAlive) => {
                    let Some(_token) = self.shared.gate.enter() else {
                        return;
                    };
                    if self.conn.is_closed() {
                        break;
                    }
                    trace!(connection, "keeping connection alive");
                }
                Ok(Outcome::Close) => break,
                Ok(Outcome::Upgrade(request)) => {
                    self.hand_over(request);
                    return;
                }
                Err(err) => {
                    self.shared.report(session.request(), &err);
                    break;
                }
            }
        }

        debug!(connection, "closing connection");
        self.conn.finish(self.shared.config.timeout_content).await;
    }

    fn hand_over(self, request: Request) {
        let Some(hook) = self.shared.router.upgrade_hook().cloned() else {
            return;
        };
        let Some(_token) = self.shared.gate.enter() else {
            return;
        };
        debug!(connection = self.conn.handle().id(), path = request.path(), "upgrading connection");
        let stream = self.conn.into_upgraded();
        hook(Box::pin(stream), request);
    }

    async fn exchange(&mut self, session: &mut Session) -> Result<Outcome, ServeError> {
        match self.receive(session).await {
            Ok(true) => {}
            Ok(false) => return Ok(Outcome::Close),
            Err(err @ ServeError::MessageTooLarge { .. }) => {
                self.reject_too_large().await;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        match self.dispatch(session)? {
            Dispatch::Upgrade => match session.take_request() {
                Some(request) => Ok(Outcome::Upgrade(request)),
                None => Ok(Outcome::Close),
            },
            Dispatch::NoRoute => Ok(Outcome::Close),
            Dispatch::Respond { bytes, keep_alive } => {
                session.advance(Stage::Sending);
                self.conn.set_timeout(self.shared.config.timeout_content);
                let sent = self.conn.write_all(&bytes, Stage::Sending).await;
                self.conn.cancel_timeout();
                sent?;
                Ok(if keep_alive {
                    Outcome::KeepAlive
                } else {
                    Outcome::Close
                })
            }
        }
    }

    /// Reads one complete request into the session. Returns `false` if the
    /// peer closed the connection cleanly before sending anything.
    async fn receive(&mut self, session: &mut Session) -> Result<bool, ServeError> {
        session.advance(Stage::AwaitingHeader);
        self.conn.set_timeout(self.shared.config.timeout_request);
        let header_len = self.read_header().await;
        self.conn.cancel_timeout();
        let Some(header_len) = header_len? else {
            return Ok(false);
        };

        let header_read_time = SystemTime::now();
        let raw_head = self.buf.split_to(header_len);
        let (head, _) = codec::parse_request_head(&raw_head)?;
        let request = session.set_request(Request::new(head, self.conn.remote(), header_read_time));
        trace!(method = %request.method(), path = request.path(), "header received");

        let body = match Framing::of(request.headers())? {
            Framing::Length(length) => {
                session.advance(Stage::AwaitingFixedBody);
                self.read_fixed_body(header_len, length).await?
            }
            Framing::Chunked => self.read_chunked_body(session).await?,
            Framing::Empty => Bytes::new(),
        };
        if let Some(request) = session.request_mut() {
            request.set_body(body);
        }
        Ok(true)
    }

    /// Reads until the buffer holds a complete header block and returns its
    /// length, terminator included.
    async fn read_header(&mut self) -> Result<Option<usize>, ServeError> {
        let limit = self.limit();
        let mut scanned = 0;
        loop {
            // Blank lines before a request line are ignored.
            while self.buf.starts_with(codec::CRLF) {
                self.buf.advance(codec::CRLF.len());
                scanned = 0;
            }
            if let Some(at) = codec::find(&self.buf, HEADER_TERMINATOR, scanned) {
                return Ok(Some(at + HEADER_TERMINATOR.len()));
            }
            scanned = self.buf.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
            if self.buf.len() >= limit {
                return Err(ServeError::MessageTooLarge { limit });
            }

            let room = limit - self.buf.len();
            let read = self
                .conn
                .read_into(&mut self.buf, room, Stage::AwaitingHeader)
                .await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(unexpected_eof(Stage::AwaitingHeader));
            }
        }
    }

    async fn read_fixed_body(&mut self, header_len: usize, length: usize) -> Result<Bytes, ServeError> {
        let limit = self.limit();
        if header_len.saturating_add(length) > limit {
            return Err(ServeError::MessageTooLarge { limit });
        }

        if self.buf.len() < length {
            self.conn.set_timeout(self.shared.config.timeout_content);
            while self.buf.len() < length {
                let room = length - self.buf.len();
                let read = self
                    .conn
                    .read_into(&mut self.buf, room, Stage::AwaitingFixedBody)
                    .await?;
                if read == 0 {
                    return Err(unexpected_eof(Stage::AwaitingFixedBody));
                }
            }
            self.conn.cancel_timeout();
        }
        Ok(self.buf.split_to(length).freeze())
    }

    async fn read_chunked_body(&mut self, session: &mut Session) -> Result<Bytes, ServeError> {
        let body = self.read_chunks(session).await;
        self.conn.cancel_timeout();
        body
    }

    /// Every chunk-size line and every chunk's data is one stage with its
    /// own content deadline, armed when the stage is entered.
    async fn read_chunks(&mut self, session: &mut Session) -> Result<Bytes, ServeError> {
        let limit = self.limit();
        let mut decoder = ChunkDecoder::new();
        // Chunks are never empty, so the decoded length tells consecutive
        // stages apart even when their states are equal.
        let mut armed = None;
        loop {
            if decoder.decode(&mut self.buf)? {
                return Ok(decoder.finish());
            }
            let (stage, pending) = match decoder.state() {
                ChunkState::Data { len } => (Stage::AwaitingChunkData, len),
                _ => (Stage::AwaitingChunkSize, 0),
            };
            let position = (decoder.state(), decoder.decoded_len());
            if armed != Some(position) {
                session.advance(stage);
                self.conn.set_timeout(self.shared.config.timeout_content);
                armed = Some(position);
            }

            if decoder.decoded_len().saturating_add(pending) > limit {
                return Err(ServeError::MessageTooLarge { limit });
            }
            if self.buf.len() >= limit {
                return Err(ServeError::MessageTooLarge { limit });
            }

            let room = limit - self.buf.len();
            if self.conn.read_into(&mut self.buf, room, stage).await? == 0 {
                return Err(unexpected_eof(stage));
            }
        }
    }

    /// Routing and handling. Runs without awaiting, under a gate token.
    fn dispatch(&self, session: &mut Session) -> Result<Dispatch, ServeError> {
        let Some(_token) = self.shared.gate.enter() else {
            return Err(ServeError::Aborted);
        };
        session.advance(Stage::Routing);
        let Some(request) = session.request_mut() else {
            return Ok(Dispatch::NoRoute);
        };

        let router = &self.shared.router;
        if router.upgrade_hook().is_some() && request.is_upgrade() {
            return Ok(Dispatch::Upgrade);
        }
        let Some(selected) = router.select(request.method(), request.path()) else {
            debug!(method = %request.method(), path = request.path(), "no route; closing");
            return Ok(Dispatch::NoRoute);
        };
        request.set_path_match(selected.path_match);

        session.advance(Stage::Handling);
        let Some(request) = session.request_mut() else {
            return Ok(Dispatch::NoRoute);
        };
        let mut response = Response::new();
        let handler = selected.handler;
        panic::catch_unwind(AssertUnwindSafe(|| handler(request, &mut response))).map_err(|payload| {
            ServeError::HandlerFault {
                message: panic_message(payload.as_ref()),
            }
        })?;

        debug!(
            method = %request.method(),
            path = request.path(),
            status = ?response.status(),
            "request handled"
        );
        let keep_alive = keep_alive(request, &response);
        Ok(Dispatch::Respond {
            bytes: response.into_bytes(),
            keep_alive,
        })
    }

    /// Best-effort 413 with an empty body. The connection closes afterwards
    /// regardless of the outcome.
    async fn reject_too_large(&mut self) {
        let mut response = Response::new();
        response.write_status(StatusCode::PayloadTooLarge, &Headers::new());
        self.conn.set_timeout(self.shared.config.timeout_content);
        match self.conn.write_all(&response.into_bytes(), Stage::Sending).await {
            Ok(()) => self.linger().await,
            Err(err) => debug!(error = %err, "failed to send 413"),
        }
        self.conn.cancel_timeout();
    }

    /// Half-closes and discards what the client is still sending, so that
    /// closing with unread input does not reset the connection before the
    /// client has read the response.
    async fn linger(&mut self) {
        if self.conn.shutdown(Stage::Closing).await.is_err() {
            return;
        }
        let linger = match self.shared.config.timeout_content {
            timeout if timeout.is_zero() => LINGER_TIMEOUT,
            timeout => timeout.min(LINGER_TIMEOUT),
        };
        self.conn.set_timeout(linger);
        self.buf.clear();
        let mut drained = 0usize;
        while drained < LINGER_MAX_BYTES {
            let room = (LINGER_MAX_BYTES - drained).min(INITIAL_BUF_SIZE);
            match self.conn.read_into(&mut self.buf, room, Stage::Closing).await {
                Ok(0) | Err(_) => break,
                Ok(read) => drained += read,
            }
            self.buf.clear();
        }
        trace!(drained, "discarded unread input");
    }
}

/// Decides whether the connection survives this exchange.
fn keep_alive(request: &Request, response: &Response) -> bool {
    if response.close_connection_after_response() {
        return false;
    }
    match request.headers().get("connection").map(str::trim) {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => request.version() >= Version::Http11,
    }
}

fn unexpected_eof(stage: Stage) -> ServeError {
    ServeError::transport(
        stage,
        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-request"),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
