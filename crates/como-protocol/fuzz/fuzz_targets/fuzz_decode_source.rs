#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary payloads must decode to Ok or Err, never panic
    let _ = como_protocol::decode_source(bytes::Bytes::copy_from_slice(data));
});
