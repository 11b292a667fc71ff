//! Fuzz the structural RDB consumer: arbitrary payloads must produce
//! entries, a clean error, or a request for more bytes: never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mirror_engine::rdb::{RdbEvent, RdbParser};

fuzz_target!(|data: &[u8]| {
    let mut parser = RdbParser::new();

    for chunk in data.chunks(11) {
        parser.feed(chunk);
        loop {
            match parser.next() {
                Ok(Some(RdbEvent::Entry(_))) => continue,
                Ok(Some(RdbEvent::End)) => return,
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
