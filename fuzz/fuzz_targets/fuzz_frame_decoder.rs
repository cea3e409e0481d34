//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences into the streaming frame decoder, split
//! at a fuzzer-chosen point, and asserts that it never panics, never yields
//! an empty or oversized payload, and accepts bytes again after a reset.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use dslink::rpc::codec::FrameDecoder;

const MAX: usize = 4096;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let at = usize::from(split).min(rest.len());
    let mut decoder = FrameDecoder::new(MAX);

    let mut frames = decoder.feed(&rest[..at]);
    frames.extend(decoder.feed(&rest[at..]));
    for payload in &frames {
        assert!(payload.len() <= MAX, "payload exceeds max frame size");
        assert!(!payload.is_empty(), "decoder must not yield empty payload");
    }

    // Chunking must not change the result.
    let mut whole = FrameDecoder::new(MAX);
    assert_eq!(whole.feed(rest), frames);

    decoder.reset();
    let _ = decoder.feed(rest);
});
