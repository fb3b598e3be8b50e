//! Frame codec.
//!
//! ```text
//! [length: u32 BE] [payload: length bytes] [checksum trailer: 0/20/32/64 bytes]
//! ```
//!
//! Write path: compress → encrypt → length prefix → checksum over the payload.
//! Read path: length → verify checksum → decrypt → decompress.
//!
//! The codec implements the `tokio_util` codec traits over a `BytesMut` buffer, so it
//! is driven the same way whether bytes come from a blocking socket or a test buffer.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{self, Compression};
use crate::utils::crypto::SessionCipher;
use crate::utils::digest::{constant_time_eq, Checksum};
use crate::utils::metrics::global_metrics;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Length prefix size.
pub const LENGTH_PREFIX: usize = 4;

/// Per-session frame pipeline. Starts as a plain length-prefixed codec; the handshake
/// switches compression, checksum and encryption on.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression: Compression,
    compression_level: u32,
    checksum: Checksum,
    cipher: Option<Arc<SessionCipher>>,
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            compression: Compression::None,
            compression_level: compression::DEFAULT_LEVEL,
            checksum: Checksum::None,
            cipher: None,
            max_payload,
        }
    }

    pub fn set_compression(&mut self, compression: Compression, level: u32) {
        self.compression = compression;
        self.compression_level = level;
    }

    pub fn set_checksum(&mut self, checksum: Checksum) {
        self.checksum = checksum;
    }

    pub fn set_cipher(&mut self, cipher: Arc<SessionCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    pub fn encryption_active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Bytes a frame carrying `payload_len` bytes occupies on the wire.
    pub fn frame_len(&self, payload_len: usize) -> usize {
        LENGTH_PREFIX + payload_len + self.checksum.trailer_len()
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let metrics = global_metrics();
        let mut data = plaintext.to_vec();
        if self.compression != Compression::None {
            data = compression::apply(self.compression, data, self.compression_level)?;
            metrics.frame_compressed();
        }
        if let Some(cipher) = &self.cipher {
            data = cipher.encrypt(&data)?;
            metrics.frame_encrypted();
        }
        Ok(data)
    }

    fn open(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let data = match &self.cipher {
            Some(cipher) => cipher.decrypt(payload)?,
            None => payload.to_vec(),
        };
        compression::revert(self.compression, data)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<()> {
        let payload = self.seal(item)?;
        if payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        let length = u32::try_from(payload.len())
            .map_err(|_| ProtocolError::OversizedPacket(payload.len()))?;

        dst.reserve(self.frame_len(payload.len()));
        dst.put_u32(length);
        dst.put_slice(&payload);
        if !self.checksum.is_none() {
            dst.put_slice(&self.checksum.digest(&[&payload[..]]));
        }
        trace!(
            plain = item.len(),
            wire = payload.len(),
            checksum = ?self.checksum,
            "Encoded frame"
        );
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_payload {
            return Err(ProtocolError::OversizedPacket(length));
        }

        let total = self.frame_len(length);
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(length);
        let trailer = src.split_to(self.checksum.trailer_len());

        if !self.checksum.is_none() {
            let expected = self.checksum.digest(&[&payload[..]]);
            if !constant_time_eq(&expected, &trailer) {
                warn!(checksum = ?self.checksum, "Frame checksum mismatch");
                return Err(ProtocolError::ChecksumMismatch);
            }
        }

        let plain = self.open(&payload)?;
        trace!(wire = length, plain = plain.len(), "Decoded frame");
        Ok(Some(plain))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::utils::crypto::{SymmetricCipher, IV_LEN, KEY_LEN};

    fn encode(codec: &mut FrameCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(payload, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_plain_frame_layout() {
        let mut codec = FrameCodec::default();
        let buf = encode(&mut codec, b"abc");
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_trailer_lengths() {
        for (checksum, trailer) in [
            (Checksum::None, 0),
            (Checksum::Sha1, 20),
            (Checksum::Sha256, 32),
            (Checksum::Sha512, 64),
        ] {
            let mut codec = FrameCodec::default();
            codec.set_checksum(checksum);
            let buf = encode(&mut codec, b"payload");
            assert_eq!(buf.len(), LENGTH_PREFIX + 7 + trailer);
        }
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::default();
        codec.set_checksum(Checksum::Sha256);
        let full = encode(&mut codec, b"hello");

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let mut codec = FrameCodec::default();
        codec.set_checksum(Checksum::Sha1);
        let mut buf = encode(&mut codec, b"hello");
        buf[5] ^= 0xFF;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_full_pipeline() {
        let cipher = Arc::new(
            SessionCipher::new(SymmetricCipher::Aes256Gcm, &[5u8; KEY_LEN], &[6u8; IV_LEN])
                .unwrap(),
        );
        let mut codec = FrameCodec::default();
        codec.set_compression(Compression::Deflate, 6);
        codec.set_checksum(Checksum::Sha512);
        codec.set_cipher(cipher);

        let payload = b"wired.user.nick ".repeat(32);
        let mut buf = encode(&mut codec, &payload);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), payload);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&[0u8, 0, 0x10, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(4096))
        ));
    }
}
