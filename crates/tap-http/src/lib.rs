//! HTTP/1.1 framing for the proxy: head parsing, body framing, and the
//! incremental response decoder used for capture on the upstream path.

mod body;
mod response;

pub use body::{encode_body_chunk, encode_body_end, BodyPart, BodyReader};
pub use response::{ResponseDecoder, ResponseEvent};

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;
pub(crate) const CHUNK_LINE_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    fn parse(text: &str) -> Result<Self, HeadParseError> {
        match text {
            "HTTP/1.1" => Ok(Self::Http11),
            "HTTP/1.0" => Ok(Self::Http10),
            _ => Err(HeadParseError::UnsupportedVersion),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    /// Splits one `name: value` line. Also used for chunked trailers, which
    /// share the header grammar.
    pub fn parse(line: &str) -> Result<Self, HeadParseError> {
        let (name, value) = line.split_once(':').ok_or(HeadParseError::BadHeaderLine)?;
        Ok(Self {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// How the bytes after a head are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

impl HttpBodyMode {
    /// Requests carry a body only when they declare one; `Transfer-Encoding:
    /// chunked` beats `Content-Length` when both appear.
    fn for_request(headers: &[HttpHeader]) -> Result<Self, HeadParseError> {
        if header_has_token(headers, "transfer-encoding", "chunked") {
            return Ok(Self::Chunked);
        }
        Ok(match declared_content_length(headers)? {
            Some(length) if length > 0 => Self::ContentLength(length),
            _ => Self::None,
        })
    }

    /// Responses additionally depend on the request method and status code,
    /// and fall back to read-until-close when nothing is declared.
    fn for_response(
        request_method: &str,
        status_code: u16,
        headers: &[HttpHeader],
    ) -> Result<Self, HeadParseError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || matches!(status_code, 100..=199 | 204 | 304)
        {
            return Ok(Self::None);
        }
        if header_has_token(headers, "transfer-encoding", "chunked") {
            return Ok(Self::Chunked);
        }
        Ok(match declared_content_length(headers)? {
            Some(length) if length > 0 => Self::ContentLength(length),
            Some(_) => Self::None,
            None => Self::CloseDelimited,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadParseError {
    NotUtf8,
    MissingStartLine,
    BadRequestLine,
    BadStatusLine,
    UnsupportedVersion,
    BadHeaderLine,
    BadContentLength,
}

impl HeadParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::NotUtf8 => "not_utf8",
            Self::MissingStartLine => "missing_start_line",
            Self::BadRequestLine => "bad_request_line",
            Self::BadStatusLine => "bad_status_line",
            Self::UnsupportedVersion => "unsupported_version",
            Self::BadHeaderLine => "bad_header_line",
            Self::BadContentLength => "bad_content_length",
        }
    }
}

impl fmt::Display for HeadParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotUtf8 => "head contains non-UTF-8 bytes",
            Self::MissingStartLine => "head has no start line",
            Self::BadRequestLine => "malformed request line",
            Self::BadStatusLine => "malformed status line",
            Self::UnsupportedVersion => "unsupported HTTP version",
            Self::BadHeaderLine => "header line is not name: value",
            Self::BadContentLength => "invalid Content-Length header",
        };
        f.write_str(text)
    }
}

impl std::error::Error for HeadParseError {}

impl From<HeadParseError> for io::Error {
    fn from(error: HeadParseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

pub fn parse_http_request_head(raw: &[u8]) -> Result<HttpRequestHead, HeadParseError> {
    let (request_line, headers) = split_head(raw)?;

    // method first, version last; whatever sits between is the target
    let (method, rest) = request_line
        .split_once(' ')
        .ok_or(HeadParseError::BadRequestLine)?;
    let (target, version_text) = rest
        .rsplit_once(' ')
        .ok_or(HeadParseError::BadRequestLine)?;
    if method.is_empty() || target.is_empty() || target.contains(' ') {
        return Err(HeadParseError::BadRequestLine);
    }
    let version = HttpVersion::parse(version_text)?;

    let body_mode = HttpBodyMode::for_request(&headers)?;
    let connection_close = wants_close(version, &headers);

    Ok(HttpRequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn parse_http_response_head(
    raw: &[u8],
    request_method: &str,
) -> Result<HttpResponseHead, HeadParseError> {
    let (status_line, headers) = split_head(raw)?;

    let (version_text, rest) = status_line
        .split_once(' ')
        .ok_or(HeadParseError::BadStatusLine)?;
    let version = HttpVersion::parse(version_text)?;
    let (status_text, reason_phrase) = match rest.split_once(' ') {
        Some(split) => split,
        None => (rest, ""),
    };
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| HeadParseError::BadStatusLine)?;

    let body_mode = HttpBodyMode::for_response(request_method, status_code, &headers)?;
    let connection_close =
        body_mode == HttpBodyMode::CloseDelimited || wants_close(version, &headers);

    Ok(HttpResponseHead {
        raw: raw.to_vec(),
        version,
        status_code,
        reason_phrase: reason_phrase.to_string(),
        headers,
        body_mode,
        connection_close,
    })
}

/// Splits a raw head into its start line and parsed header block.
fn split_head(raw: &[u8]) -> Result<(&str, Vec<HttpHeader>), HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::NotUtf8)?;
    let mut lines = text.split("\r\n");

    let start_line = match lines.next() {
        Some(line) if !line.is_empty() => line,
        _ => return Err(HeadParseError::MissingStartLine),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        headers.push(HttpHeader::parse(line)?);
    }
    Ok((start_line, headers))
}

/// True when any header named `name` lists `token` in its comma-separated
/// value.
pub fn header_has_token(headers: &[HttpHeader], name: &str, token: &str) -> bool {
    headers.iter().any(|header| {
        header.name.eq_ignore_ascii_case(name)
            && header
                .value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
    })
}

pub fn header_value<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// A repeated `Content-Length` is flattened last-wins, matching how headers
/// land in exchange records.
fn declared_content_length(headers: &[HttpHeader]) -> Result<Option<u64>, HeadParseError> {
    headers
        .iter()
        .rev()
        .find(|header| header.name.eq_ignore_ascii_case("content-length"))
        .map(|header| {
            header
                .value
                .parse::<u64>()
                .map_err(|_| HeadParseError::BadContentLength)
        })
        .transpose()
}

fn wants_close(version: HttpVersion, headers: &[HttpHeader]) -> bool {
    header_has_token(headers, "connection", "close")
        || (version == HttpVersion::Http10
            && !header_has_token(headers, "connection", "keep-alive"))
}

/// Re-serializes a request head with a replacement request-target. Everything
/// after the request line is forwarded byte-for-byte.
pub fn rewrite_request_line(head: &HttpRequestHead, new_target: &str) -> Vec<u8> {
    let line_end = locate(&head.raw, b"\r\n").unwrap_or(head.raw.len());
    let mut out = Vec::with_capacity(head.raw.len());
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(new_target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.version.as_str().as_bytes());
    out.extend_from_slice(&head.raw[line_end..]);
    out
}

/// A stream plus the bytes already read past the last consumed message
/// boundary. Leftover bytes always drain before the stream is read again,
/// which is what lets bytes received ahead of an upstream dial become the
/// first forwarded payload.
#[derive(Debug)]
pub struct BufferedConn<S> {
    pub stream: S,
    read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn from_parts(stream: S, read_buf: Vec<u8>) -> Self {
        Self { stream, read_buf }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buf)
    }

    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.read_buf)
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// One read from the underlying stream into the buffer. Zero means EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let added = self.stream.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..added]);
        Ok(added)
    }

    /// Grows the buffer until `delimiter` shows up, then hands back
    /// everything through it. `Ok(None)` means the peer closed cleanly
    /// before any byte arrived; EOF mid-message is an error.
    pub async fn read_until(
        &mut self,
        delimiter: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(found) = locate(&self.read_buf, delimiter) {
                let consumed = self.read_buf.drain(..found + delimiter.len()).collect();
                return Ok(Some(consumed));
            }
            if self.read_buf.len() > max_bytes {
                return Err(invalid_data("message head grew past the configured limit"));
            }
            if self.fill().await? == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(unexpected_eof("stream ended mid-message"))
                };
            }
        }
    }

    pub async fn read_exact_buffered(&mut self, exact_len: usize) -> io::Result<Vec<u8>> {
        while self.read_buf.len() < exact_len {
            if self.fill().await? == 0 {
                return Err(unexpected_eof("stream ended inside a fixed-length read"));
            }
        }
        Ok(self.read_buf.drain(..exact_len).collect())
    }

    /// Returns up to `max_len` bytes, draining leftovers first. An empty
    /// result means EOF.
    pub async fn read_some(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        if self.read_buf.is_empty() && self.fill().await? == 0 {
            return Ok(Vec::new());
        }
        let take = self.read_buf.len().min(max_len);
        Ok(self.read_buf.drain(..take).collect())
    }
}

/// First offset where `needle` starts inside `haystack`.
pub(crate) fn locate(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let last_start = haystack.len().checked_sub(needle.len())?;
    (0..=last_start).find(|&start| haystack[start..].starts_with(needle))
}

pub(crate) fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

pub(crate) fn unexpected_eof(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, message)
}
