use std::io;

use bytes::Bytes;

use crate::body::parse_chunk_size;
use crate::{
    invalid_data, locate, parse_http_response_head, HttpBodyMode, HttpResponseHead,
    CHUNK_LINE_LIMIT,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Head(HttpResponseHead),
    BodyChunk(Bytes),
    End,
}

/// Incremental decoder for the upstream response byte stream. The splice
/// relays bytes verbatim; this runs alongside it, fed the same bytes in the
/// same order, and reports head / body-payload / end events for capture.
#[derive(Debug)]
pub struct ResponseDecoder {
    request_method: String,
    max_head_bytes: usize,
    buf: Vec<u8>,
    state: DecoderState,
}

#[derive(Debug)]
enum DecoderState {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkPayload { remaining: u64 },
    ChunkTerminator,
    TrailerLine,
    UntilClose,
    Done,
}

impl ResponseDecoder {
    pub fn new(request_method: impl Into<String>, max_head_bytes: usize) -> Self {
        Self {
            request_method: request_method.into(),
            max_head_bytes,
            buf: Vec::new(),
            state: DecoderState::Head,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecoderState::Done)
    }

    pub fn feed(&mut self, bytes: &[u8]) -> io::Result<Vec<ResponseEvent>> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                DecoderState::Head => {
                    let Some(position) = locate(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > self.max_head_bytes {
                            return Err(invalid_data(
                                "response head grew past the configured limit",
                            ));
                        }
                        break;
                    };
                    let head_bytes = self.buf.drain(..position + 4).collect::<Vec<_>>();
                    let head = parse_http_response_head(&head_bytes, &self.request_method)?;
                    // Interim responses carry no body; the final status line
                    // follows on the same stream.
                    if (100..200).contains(&head.status_code) {
                        continue;
                    }
                    let body_mode = head.body_mode;
                    events.push(ResponseEvent::Head(head));
                    self.state = match body_mode {
                        HttpBodyMode::None => {
                            events.push(ResponseEvent::End);
                            DecoderState::Done
                        }
                        HttpBodyMode::ContentLength(length) => {
                            DecoderState::FixedBody { remaining: length }
                        }
                        HttpBodyMode::Chunked => DecoderState::ChunkSize,
                        HttpBodyMode::CloseDelimited => DecoderState::UntilClose,
                    };
                }
                DecoderState::FixedBody { remaining } => {
                    if *remaining == 0 {
                        events.push(ResponseEvent::End);
                        self.state = DecoderState::Done;
                        continue;
                    }
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = std::cmp::min(*remaining, self.buf.len() as u64) as usize;
                    let payload = self.buf.drain(..take).collect::<Vec<_>>();
                    *remaining -= payload.len() as u64;
                    let ended = *remaining == 0;
                    events.push(ResponseEvent::BodyChunk(Bytes::from(payload)));
                    if ended {
                        events.push(ResponseEvent::End);
                        self.state = DecoderState::Done;
                    }
                }
                DecoderState::ChunkSize => {
                    let Some(position) = locate(&self.buf, b"\r\n") else {
                        if self.buf.len() > CHUNK_LINE_LIMIT {
                            return Err(invalid_data("chunk size line grew past the limit"));
                        }
                        break;
                    };
                    let line = self.buf.drain(..position + 2).collect::<Vec<_>>();
                    let length = parse_chunk_size(&line)?;
                    self.state = if length == 0 {
                        DecoderState::TrailerLine
                    } else {
                        DecoderState::ChunkPayload { remaining: length }
                    };
                }
                DecoderState::ChunkPayload { remaining } => {
                    if *remaining == 0 {
                        self.state = DecoderState::ChunkTerminator;
                        continue;
                    }
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = std::cmp::min(*remaining, self.buf.len() as u64) as usize;
                    let payload = self.buf.drain(..take).collect::<Vec<_>>();
                    *remaining -= payload.len() as u64;
                    events.push(ResponseEvent::BodyChunk(Bytes::from(payload)));
                }
                DecoderState::ChunkTerminator => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    let terminator = self.buf.drain(..2).collect::<Vec<_>>();
                    if terminator != b"\r\n" {
                        return Err(invalid_data("chunk payload is not followed by CRLF"));
                    }
                    self.state = DecoderState::ChunkSize;
                }
                DecoderState::TrailerLine => {
                    let Some(position) = locate(&self.buf, b"\r\n") else {
                        if self.buf.len() > CHUNK_LINE_LIMIT {
                            return Err(invalid_data("trailer line grew past the limit"));
                        }
                        break;
                    };
                    let line = self.buf.drain(..position + 2).collect::<Vec<_>>();
                    if line == b"\r\n" {
                        events.push(ResponseEvent::End);
                        self.state = DecoderState::Done;
                    }
                }
                DecoderState::UntilClose => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let payload = std::mem::take(&mut self.buf);
                    events.push(ResponseEvent::BodyChunk(Bytes::from(payload)));
                }
                DecoderState::Done => {
                    self.buf.clear();
                    break;
                }
            }
        }

        Ok(events)
    }

    /// Signals upstream EOF. Close-delimited bodies end here; any other
    /// unfinished state means the response was truncated.
    pub fn finish(&mut self) -> Vec<ResponseEvent> {
        if matches!(self.state, DecoderState::UntilClose) {
            self.state = DecoderState::Done;
            return vec![ResponseEvent::End];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut ResponseDecoder, wire: &[u8], step: usize) -> Vec<ResponseEvent> {
        let mut events = Vec::new();
        for piece in wire.chunks(step) {
            events.extend(decoder.feed(piece).expect("feed"));
        }
        events
    }

    fn payload_of(events: &[ResponseEvent]) -> Vec<u8> {
        let mut payload = Vec::new();
        for event in events {
            if let ResponseEvent::BodyChunk(bytes) = event {
                payload.extend_from_slice(bytes);
            }
        }
        payload
    }

    #[test]
    fn decodes_fixed_length_response_fed_byte_by_byte() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
        let events = feed_all(&mut decoder, wire, 1);

        match &events[0] {
            ResponseEvent::Head(head) => assert_eq!(head.status_code, 200),
            other => panic!("expected head event, got {other:?}"),
        }
        assert_eq!(payload_of(&events), b"hello");
        assert_eq!(events.last(), Some(&ResponseEvent::End));
        assert!(decoder.is_done());
    }

    #[test]
    fn decodes_chunked_response_across_arbitrary_boundaries() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        for step in [1, 3, 7, wire.len()] {
            let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
            let events = feed_all(&mut decoder, wire, step);
            assert_eq!(payload_of(&events), b"hello world", "step {step}");
            assert_eq!(events.last(), Some(&ResponseEvent::End), "step {step}");
        }
    }

    #[test]
    fn close_delimited_response_ends_on_finish() {
        let wire = b"HTTP/1.1 200 OK\r\n\r\npartial body";
        let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
        let mut events = decoder.feed(wire).expect("feed");
        assert_eq!(payload_of(&events), b"partial body");
        assert!(!events.contains(&ResponseEvent::End));

        events.extend(decoder.finish());
        assert_eq!(events.last(), Some(&ResponseEvent::End));
    }

    #[test]
    fn skips_interim_100_continue_before_final_status() {
        let wire = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let mut decoder = ResponseDecoder::new("POST", 64 * 1024);
        let events = decoder.feed(wire).expect("feed");
        match &events[0] {
            ResponseEvent::Head(head) => assert_eq!(head.status_code, 204),
            other => panic!("expected head event, got {other:?}"),
        }
        assert_eq!(events.last(), Some(&ResponseEvent::End));
    }

    #[test]
    fn rejects_unparseable_status_line() {
        let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
        let error = decoder
            .feed(b"NOT-HTTP garbage\r\n\r\n")
            .expect_err("must fail");
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn bytes_after_a_completed_response_are_ignored() {
        let wire = b"HTTP/1.1 204 No Content\r\n\r\nleftover";
        let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
        let events = decoder.feed(wire).expect("feed");
        assert_eq!(events.last(), Some(&ResponseEvent::End));
        assert!(decoder.feed(b"more").expect("feed").is_empty());
    }
}
