//! # Core Protocol Components
//!
//! Typed messages, the binary message codec and the frame pipeline.
//!
//! ## Components
//! - **Types**: field kinds and tagged field values
//! - **Message**: a message instance bound to its specification
//! - **Codec**: specification-driven binary encoding of messages
//! - **Frame**: length prefix, compression, encryption and checksum trailer
//!
//! ## Wire Format
//! ```text
//! frame:   [Length(4)] [Payload(N)] [Checksum(0/20/32/64)]
//! message: [MessageId(4)] { [FieldId(4)] [Length(4)?] [Value] }*
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation
//! - Decoding never reads past the supplied buffer

pub mod codec;
pub mod frame;
pub mod message;
pub mod types;
