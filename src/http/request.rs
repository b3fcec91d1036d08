//! The request half of an exchange.

use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;

use super::codec::RequestHead;
use super::{Headers, Method, Version, query};

/// A fully received HTTP/1.1 request.
///
/// Built by the pipeline once the header block and body have been read.
/// Everything except the body is read-only for handlers; the body is a
/// one-shot stream consumed through [`content`](Self::content).
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    body: Bytes,
    path_match: Vec<Option<String>>,
    remote: Option<SocketAddr>,
    header_read_time: SystemTime,
}

impl Request {
    pub(crate) fn new(head: RequestHead, remote: Option<SocketAddr>, header_read_time: SystemTime) -> Self {
        let RequestHead { line, headers } = head;
        Self {
            method: line.method,
            path: line.path,
            query: line.query,
            version: line.version,
            headers,
            body: Bytes::new(),
            path_match: Vec::new(),
            remote,
            header_read_time,
        }
    }

    /// Parses a complete request held in memory. Whatever follows the
    /// header block becomes the body, unframed.
    ///
    /// ```
    /// use wicket::http::Request;
    ///
    /// let req = Request::parse(b"GET /hello?x=1 HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
    /// assert_eq!(req.path(), "/hello");
    /// assert_eq!(req.query_string(), Some("x=1"));
    /// assert_eq!(req.parse_query_string().get("x"), Some("1"));
    /// ```
    pub fn parse(raw: &[u8]) -> Result<Self, super::codec::ProtocolError> {
        let (head, consumed) = super::codec::parse_request_head(raw)?;
        let mut request = Self::new(head, None, SystemTime::now());
        request.set_body(Bytes::copy_from_slice(&raw[consumed..]));
        Ok(request)
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn set_path_match(&mut self, groups: Vec<Option<String>>) {
        self.path_match = groups;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string without the leading `?`, if one was present.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Parses the query string into a multimap with percent-decoded values.
    pub fn parse_query_string(&self) -> Headers {
        self.query.as_deref().map(query::parse).unwrap_or_default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Capture group `index` of the route pattern that matched this request.
    /// Group 0 is the whole path.
    pub fn path_match(&self, index: usize) -> Option<&str> {
        self.path_match.get(index)?.as_deref()
    }

    /// Number of capture slots recorded by the matching route, group 0 included.
    pub fn path_match_len(&self) -> usize {
        self.path_match.len()
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn remote_endpoint_address(&self) -> Option<String> {
        self.remote.map(|addr| addr.ip().to_string())
    }

    pub fn remote_endpoint_port(&self) -> Option<u16> {
        self.remote.map(|addr| addr.port())
    }

    /// When the header block was fully received.
    pub fn header_read_time(&self) -> SystemTime {
        self.header_read_time
    }

    /// The body stream. Reading through it consumes the bytes.
    pub fn content(&mut self) -> Content<'_> {
        Content { body: &mut self.body }
    }

    /// Returns `true` if the peer asked to upgrade the protocol.
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains("upgrade")
    }
}

/// Borrowed view of a request body that hands out its bytes once.
#[derive(Debug)]
pub struct Content<'a> {
    body: &'a mut Bytes,
}

impl Content<'_> {
    /// Bytes not yet consumed.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Takes the remaining bytes.
    pub fn bytes(self) -> Bytes {
        std::mem::take(self.body)
    }

    /// Takes the remaining bytes as a string, replacing invalid UTF-8.
    pub fn string(self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = Request::parse(b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n").unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), Version::Http10);
        assert_eq!(req.headers().get("HOST"), Some("localhost"));
        assert_eq!(req.query_string(), None);
        assert!(req.parse_query_string().is_empty());
    }

    #[test]
    fn body_is_consumed_once() {
        let mut req = Request::parse(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(req.content().size(), 5);
        assert_eq!(req.content().string(), "hello");
        assert_eq!(req.content().size(), 0);
        assert_eq!(req.content().string(), "");
    }

    #[test]
    fn path_match_groups() {
        let mut req = Request::parse(b"GET /users/42 HTTP/1.1\r\n\r\n").unwrap();
        req.set_path_match(vec![Some("/users/42".into()), Some("42".into()), None]);
        assert_eq!(req.path_match(0), Some("/users/42"));
        assert_eq!(req.path_match(1), Some("42"));
        assert_eq!(req.path_match(2), None);
        assert_eq!(req.path_match(3), None);
        assert_eq!(req.path_match_len(), 3);
    }

    #[test]
    fn remote_endpoint_accessors() {
        let (head, _) = crate::http::codec::parse_request_head(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let req = Request::new(head, Some("10.1.2.3:4567".parse().unwrap()), SystemTime::now());
        assert_eq!(req.remote_endpoint_address().as_deref(), Some("10.1.2.3"));
        assert_eq!(req.remote_endpoint_port(), Some(4567));
    }

    #[test]
    fn upgrade_detection() {
        let req = Request::parse(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").unwrap();
        assert!(req.is_upgrade());
    }
}
