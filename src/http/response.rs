//! The response half of an exchange.
//!
//! A [`Response`] is an output buffer that handlers fill through the
//! `write*` family. The pipeline sends whatever the buffer holds once the
//! handler returns.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response being assembled by a route handler.
///
/// # Examples
///
/// ```
/// use wicket::http::{Headers, Response, StatusCode};
///
/// let mut response = Response::new();
/// response.write(StatusCode::Ok, "hello", &Headers::new().with("Content-Type", "text/plain"));
///
/// let text = String::from_utf8(response.buffer().to_vec()).unwrap();
/// assert_eq!(
///     text,
///     "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello"
/// );
/// ```
#[derive(Debug, Default)]
pub struct Response {
    status: Option<StatusCode>,
    headers: Headers,
    buf: BytesMut,
    close_connection_after_response: bool,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a status line and header block with an empty body.
    pub fn write_status(&mut self, status: StatusCode, headers: &Headers) {
        self.write(status, b"", headers);
    }

    /// Writes a status line, header block and body.
    ///
    /// `Content-Length` is added when `headers` declares neither a length
    /// nor `Transfer-Encoding: chunked` and the connection is not closed
    /// after this response.
    pub fn write(&mut self, status: StatusCode, body: impl AsRef<[u8]>, headers: &Headers) {
        let body = body.as_ref();
        self.buf.put(format!("HTTP/1.1 {status}\r\n").as_bytes());
        self.write_header(headers, body.len());
        self.buf.put_slice(body);
        self.status = Some(status);
    }

    /// `200 OK` with a body.
    pub fn write_ok(&mut self, body: impl AsRef<[u8]>, headers: &Headers) {
        self.write(StatusCode::Ok, body, headers);
    }

    /// `200 OK` with headers only.
    pub fn write_ok_headers(&mut self, headers: &Headers) {
        self.write(StatusCode::Ok, b"", headers);
    }

    /// Appends bytes verbatim, for handlers that frame the body themselves.
    pub fn write_raw(&mut self, bytes: impl AsRef<[u8]>) {
        self.buf.put_slice(bytes.as_ref());
    }

    fn write_header(&mut self, headers: &Headers, size: usize) {
        let mut length_written = false;
        let mut chunked = false;

        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                length_written = true;
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value.trim().eq_ignore_ascii_case("chunked")
            {
                chunked = true;
            }
            self.buf.put(format!("{name}: {value}\r\n").as_bytes());
            self.headers.insert(name, value);
        }

        if !length_written && !chunked && !self.close_connection_after_response {
            self.buf.put(format!("Content-Length: {size}\r\n").as_bytes());
            self.headers.insert("Content-Length", size.to_string());
        }
        self.buf.put_slice(b"\r\n");
    }

    /// Forces the connection to close once this response is sent. Set it
    /// before writing to send a body delimited by connection close.
    pub fn set_close_connection_after_response(&mut self, close: bool) {
        self.close_connection_after_response = close;
    }

    pub fn close_connection_after_response(&self) -> bool {
        self.close_connection_after_response
    }

    /// The status of the last written status line.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Header fields written so far, synthesised ones included.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Number of bytes waiting to be sent.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::codec::{encode_chunk, encode_last_chunk, parse_response_head};

    fn text(r: &Response) -> String {
        String::from_utf8(r.buffer().to_vec()).unwrap()
    }

    #[test]
    fn body_without_framing_gets_content_length() {
        for body in ["", "x", "hello world", "ünïcödé"] {
            let mut r = Response::new();
            r.write_ok(body, &Headers::new());
            let (line, headers, consumed) = parse_response_head(r.buffer()).unwrap();
            assert_eq!(line.code, 200);
            assert_eq!(headers.get("content-length"), Some(body.len().to_string().as_str()));
            assert_eq!(&r.buffer()[consumed..], body.as_bytes());
        }
    }

    #[test]
    fn explicit_length_is_not_duplicated() {
        let mut r = Response::new();
        r.write(StatusCode::Ok, "abc", &Headers::new().with("content-length", "3"));
        assert_eq!(text(&r).matches("ength: 3").count(), 1);
    }

    #[test]
    fn chunked_responses_have_no_length() {
        let mut r = Response::new();
        r.write_ok_headers(&Headers::new().with("Transfer-Encoding", "chunked"));
        let mut body = BytesMut::new();
        encode_chunk(b"part", &mut body);
        encode_last_chunk(&mut body);
        r.write_raw(&body);
        assert_eq!(
            text(&r),
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npart\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn close_after_response_skips_length() {
        let mut r = Response::new();
        r.set_close_connection_after_response(true);
        r.write(StatusCode::Ok, "streamed", &Headers::new());
        assert!(!text(&r).to_ascii_lowercase().contains("content-length"));
        assert!(r.close_connection_after_response());
    }

    #[test]
    fn status_only() {
        let mut r = Response::new();
        r.write_status(StatusCode::PayloadTooLarge, &Headers::new());
        assert_eq!(text(&r), "HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(r.status(), Some(StatusCode::PayloadTooLarge));
        assert_eq!(r.headers().get("content-length"), Some("0"));
        assert_eq!(r.size(), r.buffer().len());
    }
}
