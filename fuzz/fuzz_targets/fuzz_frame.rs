#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use p7_protocol::utils::crypto::{SessionCipher, SymmetricCipher, IV_LEN, KEY_LEN};
use p7_protocol::{Checksum, Compression, FrameCodec};
use std::sync::Arc;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // The first byte picks the pipeline, the rest is wire input
    let Some((&selector, wire)) = data.split_first() else {
        return;
    };

    let mut codec = FrameCodec::new(64 * 1024);
    if selector & 1 != 0 {
        codec.set_compression(Compression::Deflate, 6);
    }
    codec.set_checksum(match (selector >> 1) & 3 {
        0 => Checksum::None,
        1 => Checksum::Sha1,
        2 => Checksum::Sha256,
        _ => Checksum::Sha512,
    });
    if selector & 8 != 0 {
        let kind = if selector & 16 != 0 {
            SymmetricCipher::XChaCha20Poly1305
        } else {
            SymmetricCipher::Aes256Gcm
        };
        if let Ok(cipher) = SessionCipher::new(kind, &[1u8; KEY_LEN], &[2u8; IV_LEN]) {
            codec.set_cipher(Arc::new(cipher));
        }
    }

    let mut buf = BytesMut::from(wire);
    // Drain until the decoder wants more input or fails
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
