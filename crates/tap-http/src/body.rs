use std::io;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::{
    invalid_data, unexpected_eof, BufferedConn, HttpBodyMode, HttpHeader, CHUNK_LINE_LIMIT,
    IO_CHUNK_SIZE,
};

/// One framed piece of a message body: a run of payload bytes, or the end
/// marker with whatever trailers the peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPart {
    Chunk(Bytes),
    End { trailers: Vec<HttpHeader> },
}

/// Pull-decoder for a message body. Yields payload bytes only — chunked
/// framing is consumed here and reapplied by [`encode_body_chunk`] on the
/// way back out.
#[derive(Debug)]
pub struct BodyReader {
    state: ReaderState,
}

#[derive(Debug)]
enum ReaderState {
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkPayload { remaining: u64 },
    ChunkTerminator,
    Trailers { collected: Vec<HttpHeader> },
    UntilEof,
    Done,
}

impl BodyReader {
    pub fn new(mode: HttpBodyMode) -> Self {
        let state = match mode {
            HttpBodyMode::None => ReaderState::Done,
            HttpBodyMode::ContentLength(length) => ReaderState::Fixed { remaining: length },
            HttpBodyMode::Chunked => ReaderState::ChunkSize,
            HttpBodyMode::CloseDelimited => ReaderState::UntilEof,
        };
        Self { state }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ReaderState::Done)
    }

    pub async fn next_part<S: AsyncRead + Unpin>(
        &mut self,
        conn: &mut BufferedConn<S>,
    ) -> io::Result<BodyPart> {
        loop {
            match &mut self.state {
                ReaderState::Done => {
                    return Ok(BodyPart::End {
                        trailers: Vec::new(),
                    })
                }
                ReaderState::Fixed { remaining } => {
                    if *remaining == 0 {
                        self.state = ReaderState::Done;
                        continue;
                    }
                    let take = std::cmp::min(*remaining, IO_CHUNK_SIZE as u64) as usize;
                    let bytes = conn.read_some(take).await?;
                    if bytes.is_empty() {
                        return Err(unexpected_eof("body cut short of its declared length"));
                    }
                    *remaining -= bytes.len() as u64;
                    return Ok(BodyPart::Chunk(Bytes::from(bytes)));
                }
                ReaderState::ChunkSize => {
                    let line = conn
                        .read_until(b"\r\n", CHUNK_LINE_LIMIT)
                        .await?
                        .ok_or_else(|| unexpected_eof("chunked body cut short"))?;
                    let length = parse_chunk_size(&line)?;
                    self.state = if length == 0 {
                        ReaderState::Trailers {
                            collected: Vec::new(),
                        }
                    } else {
                        ReaderState::ChunkPayload { remaining: length }
                    };
                }
                ReaderState::ChunkPayload { remaining } => {
                    if *remaining == 0 {
                        self.state = ReaderState::ChunkTerminator;
                        continue;
                    }
                    let take = std::cmp::min(*remaining, IO_CHUNK_SIZE as u64) as usize;
                    let bytes = conn.read_some(take).await?;
                    if bytes.is_empty() {
                        return Err(unexpected_eof("chunk payload cut short"));
                    }
                    *remaining -= bytes.len() as u64;
                    return Ok(BodyPart::Chunk(Bytes::from(bytes)));
                }
                ReaderState::ChunkTerminator => {
                    let terminator = conn.read_exact_buffered(2).await?;
                    if terminator != b"\r\n" {
                        return Err(invalid_data("chunk payload is not followed by CRLF"));
                    }
                    self.state = ReaderState::ChunkSize;
                }
                ReaderState::Trailers { collected } => {
                    let line = conn
                        .read_until(b"\r\n", CHUNK_LINE_LIMIT)
                        .await?
                        .ok_or_else(|| unexpected_eof("chunked body cut short"))?;
                    if line == b"\r\n" {
                        let trailers = std::mem::take(collected);
                        self.state = ReaderState::Done;
                        return Ok(BodyPart::End { trailers });
                    }
                    collected.push(parse_trailer(&line)?);
                }
                ReaderState::UntilEof => {
                    let bytes = conn.read_some(IO_CHUNK_SIZE).await?;
                    if bytes.is_empty() {
                        self.state = ReaderState::Done;
                        continue;
                    }
                    return Ok(BodyPart::Chunk(Bytes::from(bytes)));
                }
            }
        }
    }
}

/// Accumulates the leading hex digits of a chunk-size line; a `;` starts
/// chunk extensions and whitespace or CR ends the field, all of which are
/// passed over.
pub(crate) fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let mut size = 0_u64;
    let mut digits_seen = false;

    for &byte in line {
        let digit = match byte {
            b'0'..=b'9' => u64::from(byte - b'0'),
            b'a'..=b'f' => u64::from(byte - b'a' + 10),
            b'A'..=b'F' => u64::from(byte - b'A' + 10),
            b';' | b' ' | b'\t' | b'\r' => break,
            _ => return Err(invalid_data("chunk size is not hex")),
        };
        size = size
            .checked_mul(16)
            .and_then(|shifted| shifted.checked_add(digit))
            .ok_or_else(|| invalid_data("chunk size overflows"))?;
        digits_seen = true;
    }

    if !digits_seen {
        return Err(invalid_data("chunk size line has no digits"));
    }
    Ok(size)
}

fn parse_trailer(line: &[u8]) -> io::Result<HttpHeader> {
    let text = std::str::from_utf8(line)
        .map_err(|_| invalid_data("trailer contains non-UTF-8 bytes"))?;
    Ok(HttpHeader::parse(text.trim_end_matches("\r\n"))?)
}

/// Re-frames a run of payload bytes for the given body mode.
pub fn encode_body_chunk(mode: HttpBodyMode, payload: &[u8]) -> Vec<u8> {
    match mode {
        HttpBodyMode::Chunked => {
            if payload.is_empty() {
                return Vec::new();
            }
            let mut out = format!("{:x}\r\n", payload.len()).into_bytes();
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\r\n");
            out
        }
        _ => payload.to_vec(),
    }
}

/// The end-of-body marker for the given mode; empty for length-delimited
/// bodies, the terminal chunk plus trailer block for chunked ones.
pub fn encode_body_end(mode: HttpBodyMode, trailers: &[HttpHeader]) -> Vec<u8> {
    match mode {
        HttpBodyMode::Chunked => {
            let mut out = b"0\r\n".to_vec();
            for trailer in trailers {
                out.extend_from_slice(trailer.name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(trailer.value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_body(mode: HttpBodyMode, wire: &[u8]) -> (Vec<u8>, Vec<HttpHeader>) {
        let mut conn = BufferedConn::new(wire);
        let mut reader = BodyReader::new(mode);
        let mut payload = Vec::new();
        loop {
            match reader.next_part(&mut conn).await.expect("body part") {
                BodyPart::Chunk(bytes) => payload.extend_from_slice(&bytes),
                BodyPart::End { trailers } => return (payload, trailers),
            }
        }
    }

    #[tokio::test]
    async fn fixed_body_yields_payload_then_end() {
        let (payload, trailers) = collect_body(HttpBodyMode::ContentLength(5), b"hello").await;
        assert_eq!(payload, b"hello");
        assert!(trailers.is_empty());
    }

    #[tokio::test]
    async fn none_body_yields_immediate_end() {
        let (payload, _) = collect_body(HttpBodyMode::None, b"").await;
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn chunked_body_strips_framing() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (payload, trailers) = collect_body(HttpBodyMode::Chunked, wire).await;
        assert_eq!(payload, b"hello world");
        assert!(trailers.is_empty());
    }

    #[tokio::test]
    async fn chunked_body_collects_trailers() {
        let wire = b"3\r\nabc\r\n0\r\nX-Sum: 1\r\n\r\n";
        let (payload, trailers) = collect_body(HttpBodyMode::Chunked, wire).await;
        assert_eq!(payload, b"abc");
        assert_eq!(trailers.len(), 1);
        assert_eq!(trailers[0].name, "X-Sum");
        assert_eq!(trailers[0].value, "1");
    }

    #[tokio::test]
    async fn chunked_body_rejects_bad_terminator() {
        let wire = b"3\r\nabcXX";
        let mut conn = BufferedConn::new(&wire[..]);
        let mut reader = BodyReader::new(HttpBodyMode::Chunked);
        let first = reader.next_part(&mut conn).await.expect("payload");
        assert_eq!(first, BodyPart::Chunk(Bytes::from_static(b"abc")));
        let error = reader.next_part(&mut conn).await.expect_err("must fail");
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn close_delimited_body_ends_at_eof() {
        let (payload, _) = collect_body(HttpBodyMode::CloseDelimited, b"tail bytes").await;
        assert_eq!(payload, b"tail bytes");
    }

    #[test]
    fn chunk_size_accepts_extensions_and_rejects_garbage() {
        assert_eq!(parse_chunk_size(b"1a\r\n").expect("size"), 26);
        assert_eq!(parse_chunk_size(b"5;name=value\r\n").expect("size"), 5);
        assert!(parse_chunk_size(b"\r\n").is_err());
        assert!(parse_chunk_size(b"zz\r\n").is_err());
        assert!(parse_chunk_size(b"ffffffffffffffff0\r\n").is_err());
    }

    #[test]
    fn encode_chunk_round_trips_through_the_grammar() {
        let encoded = encode_body_chunk(HttpBodyMode::Chunked, b"hello");
        assert_eq!(encoded, b"5\r\nhello\r\n");
        assert!(encode_body_chunk(HttpBodyMode::Chunked, b"").is_empty());
        assert_eq!(
            encode_body_chunk(HttpBodyMode::ContentLength(5), b"hello"),
            b"hello"
        );
    }

    #[test]
    fn encode_end_emits_terminal_chunk_with_trailers() {
        let trailers = vec![HttpHeader {
            name: "X-Sum".to_string(),
            value: "1".to_string(),
        }];
        assert_eq!(
            encode_body_end(HttpBodyMode::Chunked, &trailers),
            b"0\r\nX-Sum: 1\r\n\r\n"
        );
        assert!(encode_body_end(HttpBodyMode::ContentLength(5), &[]).is_empty());
    }
}
