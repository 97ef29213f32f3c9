#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_http::ResponseDecoder;

fuzz_target!(|data: &[u8]| {
    // feed in uneven pieces so incremental state transitions get exercised
    let mut decoder = ResponseDecoder::new("GET", 64 * 1024);
    let mut step = 1;
    let mut offset = 0;
    while offset < data.len() {
        let end = std::cmp::min(offset + step, data.len());
        if decoder.feed(&data[offset..end]).is_err() {
            return;
        }
        offset = end;
        step = (step * 2).min(251);
    }
    let _ = decoder.finish();
});
