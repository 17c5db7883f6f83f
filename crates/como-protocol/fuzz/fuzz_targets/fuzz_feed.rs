#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Split the input in two chunks so partial frames get carried over
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (first, second) = data.split_at(split);

    let Ok((frames, rest)) = como_protocol::feed(bytes::BytesMut::new(), first) else {
        return;
    };
    for frame in frames {
        let _ = como_protocol::Message::from_frame(frame);
    }
    if let Ok((frames, _)) = como_protocol::feed(rest, second) {
        for frame in frames {
            let _ = como_protocol::Message::from_frame(frame);
        }
    }
});
