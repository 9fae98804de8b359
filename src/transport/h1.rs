//! HTTP/1.1 client over any byte stream.
//!
//! Uses httparse for response parsing and raw I/O for full control over
//! request formatting and header order. A connection keeps its read buffer
//! across requests so pipelined or early bytes are never lost on keep-alive
//! reuse.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Invalidation, ProxyError, Result};
use crate::response::TransportResponse;
use crate::transport::BoxedStream;
use crate::version::HttpVersion;

/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Maximum decoded body size, for chunked and Content-Length bodies alike.
const MAX_BODY_SIZE: usize = 128 * 1024 * 1024;

const READ_CHUNK: usize = 8192;

/// Parsed status line and header block.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub minor_version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn status_line(&self) -> String {
        format!("HTTP/1.{} {} {}", self.minor_version, self.status, self.reason)
            .trim_end()
            .to_string()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP/1.1 connection for sending requests.
pub struct H1Connection {
    stream: BoxedStream,
    buffer: BytesMut,
    /// Whether the connection must be closed after the current response.
    should_close: bool,
}

impl H1Connection {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            should_close: false,
        }
    }

    /// False once the peer asked to close or framing required it.
    pub fn is_reusable(&self) -> bool {
        !self.should_close
    }

    /// Unwrap the stream, replaying any bytes already buffered.
    pub fn into_stream(self) -> BoxedStream {
        if self.buffer.is_empty() {
            self.stream
        } else {
            Box::new(Rewind::new(self.buffer.freeze(), self.stream))
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Send a request and read the complete response.
    ///
    /// A write failure or EOF before any response byte is reported as
    /// `SessionInvalidated(ConnClosed)`: the peer dropped an idle keep-alive
    /// connection and the request never reached it.
    pub async fn send_request(
        &mut self,
        method: &Method,
        uri: &Uri,
        headers: &[(String, String)],
        body: Option<&Bytes>,
    ) -> Result<TransportResponse> {
        let request = encode_request(method, uri, headers, body)?;
        self.write_all(&request).await?;
        if let Some(body) = body {
            self.write_all(body).await?;
        }
        self.stream
            .flush()
            .await
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))?;

        loop {
            let head = self.read_head().await?;
            // 1xx responses carry no body; keep reading for the final one
            if (100..200).contains(&head.status) {
                continue;
            }
            let body = self.read_body(&head, method).await?;
            if head.minor_version == 0
                && !head
                    .header("connection")
                    .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            {
                self.should_close = true;
            }
            return Ok(TransportResponse::new(
                head.status,
                head.headers,
                HttpVersion::Http1_1,
                body,
            ));
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))
    }

    async fn read_more(&mut self) -> Result<usize> {
        self.buffer.reserve(READ_CHUNK);
        self.stream
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| Error::connection(format!("failed to read response: {}", e)))
    }

    /// Read and parse one status line plus headers.
    pub async fn read_head(&mut self) -> Result<ResponseHead> {
        loop {
            if let Some((head, consumed)) = parse_head(&self.buffer)? {
                self.buffer.advance(consumed);
                if head
                    .header("connection")
                    .is_some_and(|v| v.to_ascii_lowercase().contains("close"))
                {
                    self.should_close = true;
                }
                return Ok(head);
            }
            if self.buffer.len() >= MAX_HEADERS_SIZE {
                return Err(Error::http_protocol("response headers too large"));
            }
            if self.read_more().await? == 0 {
                if self.buffer.is_empty() {
                    return Err(Error::SessionInvalidated(Invalidation::ConnClosed));
                }
                return Err(Error::http_protocol(
                    "connection closed before response headers were complete",
                ));
            }
        }
    }

    async fn read_body(&mut self, head: &ResponseHead, method: &Method) -> Result<Bytes> {
        // HEAD responses and 204/304 never carry a body
        if matches!(head.status, 204 | 304) || *method == Method::HEAD {
            return Ok(Bytes::new());
        }

        // Transfer-Encoding overrides Content-Length
        if let Some(te) = head.header("transfer-encoding") {
            let chunked = te
                .split(',')
                .next_back()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case("chunked"));
            if chunked {
                return self.read_chunked().await;
            }
            self.should_close = true;
            return self.read_until_close().await;
        }

        if let Some(cl) = head.header("content-length") {
            let len = parse_content_length(cl)?;
            if len > MAX_BODY_SIZE {
                return Err(Error::http_protocol(format!(
                    "Content-Length {} exceeds the {} byte limit",
                    len, MAX_BODY_SIZE
                )));
            }
            return self.read_exact_body(len).await;
        }

        self.should_close = true;
        self.read_until_close().await
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Bytes> {
        while self.buffer.len() < len {
            if self.read_more().await? == 0 {
                return Err(Error::http_protocol(format!(
                    "connection closed before full body (got {} of {} bytes)",
                    self.buffer.len(),
                    len
                )));
            }
        }
        Ok(self.buffer.split_to(len).freeze())
    }

    async fn read_until_close(&mut self) -> Result<Bytes> {
        while self.read_more().await? > 0 {}
        Ok(self.buffer.split().freeze())
    }

    async fn read_line(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                let line = self.buffer.split_to(pos);
                self.buffer.advance(2);
                return Ok(line);
            }
            if self.read_more().await? == 0 {
                return Err(Error::http_protocol("connection closed inside chunked body"));
            }
        }
    }

    /// chunked-body = *chunk last-chunk trailer-section CRLF
    async fn read_chunked(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)
                .ok_or_else(|| Error::http_protocol("invalid chunk size line"))?;
            if size == 0 {
                // Trailer fields until the empty line
                while !self.read_line().await?.is_empty() {}
                return Ok(body.freeze());
            }
            let framed = size
                .checked_add(2)
                .filter(|_| body.len().saturating_add(size) <= MAX_BODY_SIZE)
                .ok_or_else(|| {
                    Error::http_protocol(format!(
                        "chunk of {} bytes exceeds the {} byte body limit",
                        size, MAX_BODY_SIZE
                    ))
                })?;
            while self.buffer.len() < framed {
                if self.read_more().await? == 0 {
                    return Err(Error::http_protocol("connection closed inside chunk data"));
                }
            }
            body.extend_from_slice(&self.buffer[..size]);
            if &self.buffer[size..framed] != b"\r\n" {
                return Err(Error::http_protocol("chunk data not terminated by CRLF"));
            }
            self.buffer.advance(framed);
        }
    }
}

/// Open a CONNECT tunnel to `authority` over `stream`.
///
/// Anything other than `200` fails with `ProxyTunnelFailed` carrying the
/// proxy's status line.
pub async fn connect_tunnel(
    stream: BoxedStream,
    authority: &str,
    headers: &[(String, String)],
) -> Result<BoxedStream> {
    let mut conn = H1Connection::new(stream);
    let request = encode_connect(authority, headers)?;
    conn.stream
        .write_all(&request)
        .await
        .map_err(|e| Error::connection(format!("failed to send CONNECT: {}", e)))?;
    conn.stream
        .flush()
        .await
        .map_err(|e| Error::connection(format!("failed to send CONNECT: {}", e)))?;

    let head = match conn.read_head().await {
        Ok(head) => head,
        Err(Error::SessionInvalidated(_)) => {
            return Err(ProxyError::ProxyTunnelFailed {
                status_line: "proxy closed the connection".into(),
            }
            .into())
        }
        Err(e) => return Err(e),
    };
    if head.status != 200 {
        return Err(ProxyError::ProxyTunnelFailed {
            status_line: head.status_line(),
        }
        .into());
    }
    Ok(conn.into_stream())
}

/// Serialize a request in origin-form with `Host` first.
pub fn encode_request(
    method: &Method,
    uri: &Uri,
    headers: &[(String, String)],
    body: Option<&Bytes>,
) -> Result<Vec<u8>> {
    for (name, value) in headers {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }

    let mut request = Vec::with_capacity(512);
    request.extend_from_slice(method.as_str().as_bytes());
    request.push(b' ');
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    request.extend_from_slice(if target.is_empty() { "/" } else { target }.as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\n");

    request.extend_from_slice(b"Host: ");
    if let Some(authority) = uri.authority() {
        request.extend_from_slice(authority.as_str().as_bytes());
    }
    request.extend_from_slice(b"\r\n");

    let has = |wanted: &str| headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(wanted));
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        push_header(&mut request, name, value);
    }
    if !has("connection") {
        push_header(&mut request, "Connection", "keep-alive");
    }
    // Content-Length MUST NOT accompany Transfer-Encoding
    if let Some(body) = body {
        if !has("transfer-encoding") && !has("content-length") {
            push_header(&mut request, "Content-Length", &body.len().to_string());
        }
    }
    request.extend_from_slice(b"\r\n");
    Ok(request)
}

/// Serialize a CONNECT request in authority-form.
pub fn encode_connect(authority: &str, headers: &[(String, String)]) -> Result<Vec<u8>> {
    for (name, value) in headers {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }
    let mut request = Vec::with_capacity(256);
    request.extend_from_slice(format!("CONNECT {} HTTP/1.1\r\n", authority).as_bytes());
    push_header(&mut request, "Host", authority);
    for (name, value) in headers {
        push_header(&mut request, name, value);
    }
    request.extend_from_slice(b"\r\n");
    Ok(request)
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Parse a response head; `None` while incomplete.
fn parse_head(buffer: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut response = httparse::Response::new(&mut headers);
    let consumed = match response
        .parse(buffer)
        .map_err(|e| Error::http_protocol(format!("failed to parse response: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let status = response
        .code
        .ok_or_else(|| Error::http_protocol("missing status code"))?;
    let head = ResponseHead {
        minor_version: response.version.unwrap_or(1),
        status,
        reason: response.reason.unwrap_or("").to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
    };
    Ok(Some((head, consumed)))
}

/// Hex chunk size, ignoring chunk extensions after `;`.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    usize::from_str_radix(size, 16).ok()
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Header names must be tokens: 1*tchar.
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(Error::http_protocol(format!(
            "invalid header name: {:?}",
            name
        )));
    }
    Ok(())
}

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// Header values must not contain NUL, CR, or LF.
fn validate_header_value(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(Error::http_protocol(
            "invalid character in header value (CR/LF/NUL not allowed)",
        ));
    }
    Ok(())
}

/// Multiple comma-separated values must all be identical.
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parsed = value.split(',').map(|s| s.trim().parse::<usize>());
    let first = match parsed.next() {
        Some(Ok(n)) => n,
        _ => {
            return Err(Error::http_protocol(format!(
                "invalid Content-Length: {}",
                value
            )))
        }
    };
    for next in parsed {
        match next {
            Ok(n) if n == first => {}
            _ => {
                return Err(Error::http_protocol(format!(
                    "conflicting Content-Length values: {}",
                    value
                )))
            }
        }
    }
    Ok(first)
}

/// Stream that yields `prefix` before reading from `inner`.
pub struct Rewind {
    prefix: Bytes,
    inner: BoxedStream,
}

impl Rewind {
    pub fn new(prefix: Bytes, inner: BoxedStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
