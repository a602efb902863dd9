#![no_main]

use libfuzzer_sys::fuzz_target;
use reqflow::fuzzing::{try_parse_response, ChunkedDecoder, MAX_RESPONSE_HEADERS};

// The receive path must never panic, whatever bytes the server sends:
// prelude parsing and chunked decoding either make progress or return a
// classified parse error.
fuzz_target!(|data: &[u8]| {
    let _ = try_parse_response::<MAX_RESPONSE_HEADERS>(data);
    let _ = try_parse_response::<0>(data);

    // Replay the same bytes through the chunked decoder in two splits to
    // exercise resumption at arbitrary boundaries.
    let split = if data.is_empty() {
        0
    } else {
        data[0] as usize % data.len()
    };
    let (a, b) = data.split_at(split);

    let mut dec = ChunkedDecoder::new();
    let mut out = [0u8; 1024];
    for part in [a, b] {
        let mut input = part;
        while !input.is_empty() && !dec.is_ended() {
            match dec.read(input, &mut out) {
                Ok((0, 0)) => break,
                Ok((i, _)) => input = &input[i..],
                Err(_) => return,
            }
        }
    }
});
