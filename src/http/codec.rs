//! Wire-level HTTP/1.1 codec built on [`httparse`].
//!
//! - [`parse_request_head`] tokenizes a request line plus header block.
//! - [`parse_response_head`] does the same for a status line.
//! - [`ChunkDecoder`] incrementally decodes `Transfer-Encoding: chunked`.
//! - [`encode_chunk`] / [`encode_last_chunk`] produce chunked framing.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method, Version};

/// Blank line ending a header block.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

pub const CRLF: &[u8] = b"\r\n";

/// Maximum number of header fields accepted in one message.
const MAX_HEADERS: usize = 64;

/// Malformed input on the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message head is incomplete")]
    Incomplete,

    #[error("malformed message head: {0}")]
    Head(#[from] httparse::Error),

    #[error("missing {0} in request line")]
    MissingField(&'static str),

    #[error("unsupported HTTP version")]
    Version,

    #[error("invalid Content-Length value {0:?}")]
    ContentLength(String),

    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("chunk data is not followed by CRLF")]
    ChunkTerminator,
}

/// Returns the offset of the first occurrence of `needle` at or after `from`.
pub fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// The first line of a request: `<method> <path>[?<query>] HTTP/<version>`.
///
/// Formatting a parsed line reproduces it byte for byte:
///
/// ```
/// use wicket::http::codec::RequestLine;
///
/// let line: RequestLine = "GET /hello?x=1 HTTP/1.1".parse().unwrap();
/// assert_eq!(line.path, "/hello");
/// assert_eq!(line.query.as_deref(), Some("x=1"));
/// assert_eq!(line.to_string(), "GET /hello?x=1 HTTP/1.1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub path: String,
    /// Everything after the first `?`, without it. `Some("")` for a bare `?`.
    pub query: Option<String>,
    pub version: Version,
}

impl RequestLine {
    fn from_parts(method: &str, target: &str, minor: u8) -> Result<Self, ProtocolError> {
        let version = Version::from_minor(minor).ok_or(ProtocolError::Version)?;
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        Ok(Self {
            method: Method::from(method),
            path,
            query,
            version,
        })
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        write!(f, " {}", self.version)
    }
}

impl FromStr for RequestLine {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut raw = Vec::with_capacity(line.len() + HEADER_TERMINATOR.len());
        raw.extend_from_slice(line.as_bytes());
        raw.extend_from_slice(HEADER_TERMINATOR);
        parse_request_head(&raw).map(|(head, _)| head.line)
    }
}

/// A parsed request line together with its header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: Headers,
}

/// Parses a request line and header block.
///
/// Returns the head and the number of bytes it occupied, terminator
/// included. Header values that are not valid UTF-8 are decoded lossily.
pub fn parse_request_head(buf: &[u8]) -> Result<(RequestHead, usize), ProtocolError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Request::new(&mut slots);

    let consumed = match raw.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(ProtocolError::Incomplete),
    };

    let method = raw.method.ok_or(ProtocolError::MissingField("method"))?;
    let target = raw.path.ok_or(ProtocolError::MissingField("path"))?;
    let minor = raw.version.ok_or(ProtocolError::MissingField("version"))?;
    let line = RequestLine::from_parts(method, target, minor)?;

    Ok((
        RequestHead {
            line,
            headers: collect_headers(raw.headers),
        },
        consumed,
    ))
}

/// The first line of a response: `HTTP/<version> <code> <reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: Version,
    pub code: u16,
    pub reason: String,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.version, self.code, self.reason)
    }
}

impl FromStr for StatusLine {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut raw = Vec::with_capacity(line.len() + HEADER_TERMINATOR.len());
        raw.extend_from_slice(line.as_bytes());
        raw.extend_from_slice(HEADER_TERMINATOR);
        parse_response_head(&raw).map(|(line, _, _)| line)
    }
}

/// Parses a status line and header block, returning the bytes consumed.
pub fn parse_response_head(buf: &[u8]) -> Result<(StatusLine, Headers, usize), ProtocolError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut slots);

    let consumed = match raw.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(ProtocolError::Incomplete),
    };

    let minor = raw.version.ok_or(ProtocolError::MissingField("version"))?;
    let line = StatusLine {
        version: Version::from_minor(minor).ok_or(ProtocolError::Version)?,
        code: raw.code.ok_or(ProtocolError::MissingField("status code"))?,
        reason: raw.reason.unwrap_or_default().to_owned(),
    };
    Ok((line, collect_headers(raw.headers), consumed))
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::with_capacity(raw.len());
    for header in raw {
        headers.insert(header.name, String::from_utf8_lossy(header.value));
    }
    headers
}

/// Parses a `Content-Length` value.
pub fn parse_content_length(value: &str) -> Result<usize, ProtocolError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::ContentLength(value.to_owned()))
}

/// Position of a [`ChunkDecoder`] within the chunk sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Waiting for a `<hex-size>[;ext]\r\n` line.
    Size,
    /// Waiting for `len` data bytes plus their CRLF.
    Data { len: usize },
    /// The zero-size chunk has been consumed.
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// Feed it the connection buffer with [`decode`](Self::decode); consumed
/// framing is removed from the buffer and the payload accumulates inside
/// the decoder until [`finish`](Self::finish).
#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
    decoded: BytesMut,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            decoded: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Number of payload bytes decoded so far.
    pub fn decoded_len(&self) -> usize {
        self.decoded.len()
    }

    /// Consumes as many complete chunks from `buf` as possible.
    ///
    /// Returns `Ok(true)` once the terminating zero-size chunk has been
    /// consumed, `Ok(false)` when more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<bool, ProtocolError> {
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        let len = usize::try_from(size).map_err(|_| ProtocolError::ChunkSize)?;
                        buf.advance(consumed);
                        self.state = ChunkState::Data { len };
                    }
                    Ok(httparse::Status::Partial) => return Ok(false),
                    Err(_) => return Err(ProtocolError::ChunkSize),
                },
                ChunkState::Data { len } => {
                    let framed = len.checked_add(CRLF.len()).ok_or(ProtocolError::ChunkSize)?;
                    if buf.len() < framed {
                        return Ok(false);
                    }
                    if &buf[len..framed] != CRLF {
                        return Err(ProtocolError::ChunkTerminator);
                    }
                    self.decoded.extend_from_slice(&buf[..len]);
                    buf.advance(framed);
                    self.state = if len == 0 {
                        ChunkState::Done
                    } else {
                        ChunkState::Size
                    };
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }

    /// Returns the decoded payload.
    pub fn finish(self) -> Bytes {
        self.decoded.freeze()
    }
}

/// Appends `data` to `out` as one chunk. Empty input writes nothing, since
/// a zero-size chunk would end the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(CRLF);
}

/// Appends the terminating zero-size chunk.
pub fn encode_last_chunk(out: &mut BytesMut) {
    out.put_slice(b"0\r\n\r\n");
}
