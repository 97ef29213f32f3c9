use proptest::prelude::*;
use tap_http::{
    encode_body_chunk, encode_body_end, HttpBodyMode, ResponseDecoder, ResponseEvent,
};

fn payload_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..200), 0..8)
}

fn decode_payload(wire: &[u8], piece_len: usize) -> (Option<u16>, Vec<u8>, bool) {
    let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
    let mut status = None;
    let mut payload = Vec::new();
    let mut ended = false;

    for piece in wire.chunks(piece_len.max(1)) {
        for event in decoder.feed(piece).expect("well-formed wire must decode") {
            match event {
                ResponseEvent::Head(head) => status = Some(head.status_code),
                ResponseEvent::BodyChunk(bytes) => payload.extend_from_slice(&bytes),
                ResponseEvent::End => ended = true,
            }
        }
    }
    for event in decoder.finish() {
        if event == ResponseEvent::End {
            ended = true;
        }
    }
    (status, payload, ended)
}

proptest! {
    #[test]
    fn content_length_wire_decodes_to_the_exact_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..2_000),
        piece_len in 1_usize..64,
    ) {
        let mut wire = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .into_bytes();
        wire.extend_from_slice(&payload);

        let (status, decoded, ended) = decode_payload(&wire, piece_len);
        prop_assert_eq!(status, Some(200));
        prop_assert_eq!(decoded, payload);
        prop_assert!(ended);
    }

    #[test]
    fn chunked_wire_built_by_the_encoder_decodes_to_the_same_payload(
        chunks in payload_strategy(),
        piece_len in 1_usize..64,
    ) {
        let mut wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let mut expected = Vec::new();
        for chunk in &chunks {
            expected.extend_from_slice(chunk);
            wire.extend_from_slice(&encode_body_chunk(HttpBodyMode::Chunked, chunk));
        }
        wire.extend_from_slice(&encode_body_end(HttpBodyMode::Chunked, &[]));

        let (status, decoded, ended) = decode_payload(&wire, piece_len);
        prop_assert_eq!(status, Some(200));
        prop_assert_eq!(decoded, expected);
        prop_assert!(ended);
    }
}
