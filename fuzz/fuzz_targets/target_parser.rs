#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_core::{parse_connect_target, parse_forward_target};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        for line in text.lines().take(8) {
            let _ = parse_connect_target(line);
            let _ = parse_forward_target(line, None);
            let _ = parse_forward_target(line, Some(line));
        }

        if let Some((target, host)) = text.split_once('\n') {
            let _ = parse_forward_target(target, Some(host));
        }
    }
});
