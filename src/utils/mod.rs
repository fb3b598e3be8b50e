//! # Utility Modules
//!
//! Supporting utilities for the frame pipeline, logging and timing.
//!
//! ## Components
//! - **Compression**: raw DEFLATE with a decompression size limit
//! - **Crypto**: AES-256-GCM and XChaCha20-Poly1305 session ciphers
//! - **Digest**: SHA-1/SHA-256/SHA-512 frame checksums and proof hashing
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Default durations and deadline helpers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Decompression bomb protection (16MB limit)
//! - Memory zeroing for sensitive data (zeroize crate)

pub mod compression;
pub mod crypto;
pub mod digest;
pub mod logging;
pub mod metrics;
pub mod timeout;
