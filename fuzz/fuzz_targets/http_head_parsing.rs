#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_http::{parse_http_request_head, parse_http_response_head};

fuzz_target!(|data: &[u8]| {
    let split = data
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(data.len());
    let request = &data[..split];
    let response = if split < data.len() {
        &data[split + 1..]
    } else {
        data
    };

    let _ = parse_http_request_head(request);

    let method = if request.starts_with(b"HEAD") {
        "HEAD"
    } else {
        "GET"
    };
    let _ = parse_http_response_head(response, method);
});
