//! Fuzz the incremental RESP reader: arbitrary bytes, arbitrary chunking.
//! Must never panic, and byte accounting must never exceed the input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mirror_engine::resp::RespParser;

fuzz_target!(|data: &[u8]| {
    let mut parser = RespParser::new();
    let mut consumed = 0u64;

    for chunk in data.chunks(7) {
        parser.feed(chunk);
        loop {
            match parser.next_command() {
                Ok(Some(cmd)) => consumed += cmd.stream_bytes,
                Ok(None) => break,
                Err(_) => return, // malformed input is a clean error
            }
        }
    }

    assert!(consumed <= data.len() as u64);
});
