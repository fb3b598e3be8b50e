//! Raw DEFLATE frame compression.
//!
//! Inflation stops at the maximum payload size, so a small frame cannot expand without
//! bound.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Frame compression negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

impl Compression {
    /// Enum constant of `p7.handshake.compression`, `None` when the field is omitted.
    pub fn constant(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Deflate => Some("p7.handshake.compression.deflate"),
        }
    }

    pub fn from_constant(name: &str) -> Option<Self> {
        match name {
            "p7.handshake.compression.deflate" => Some(Compression::Deflate),
            _ => None,
        }
    }
}

/// Default deflate level
pub const DEFAULT_LEVEL: u32 = 6;

/// Maximum output size for decompression (align with MAX_PAYLOAD_SIZE to prevent DoS)
const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Compresses data with raw deflate
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
}

/// Decompresses raw deflate data
///
/// Enforces a maximum output size limit to prevent decompression bombs.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds MAX_DECOMPRESSION_SIZE
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut reader = DeflateDecoder::new(data);

    // Read in chunks to enforce size limit
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > MAX_DECOMPRESSION_SIZE {
                    return Err(ProtocolError::DecompressionFailure);
                }
            }
            Err(_) => return Err(ProtocolError::DecompressionFailure),
        }
    }
    Ok(out)
}

/// Apply the negotiated compression, passing data through when none is active.
pub fn apply(kind: Compression, data: Vec<u8>, level: u32) -> Result<Vec<u8>> {
    match kind {
        Compression::None => Ok(data),
        Compression::Deflate => compress(&data, level),
    }
}

/// Invert [`apply`].
pub fn revert(kind: Compression, data: Vec<u8>) -> Result<Vec<u8>> {
    match kind {
        Compression::None => Ok(data),
        Compression::Deflate => decompress(&data),
    }
}
