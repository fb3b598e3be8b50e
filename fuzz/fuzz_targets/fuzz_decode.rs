#![no_main]

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;
use p7_protocol::{MessageCodec, Specification};
use std::sync::Arc;

static CODEC: Lazy<Option<MessageCodec>> = Lazy::new(|| {
    Specification::from_xml(include_str!("../../specs/wired.xml"))
        .ok()
        .map(|spec| MessageCodec::new(Arc::new(spec)))
});

fuzz_target!(|data: &[u8]| {
    // Message decoding must reject bad input without panicking
    if let Some(codec) = CODEC.as_ref() {
        if let Ok(message) = codec.decode(data) {
            // Whatever decoded must encode again
            let _ = codec.encode(&message);
        }
    }
});
