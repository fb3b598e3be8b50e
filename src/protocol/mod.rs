//! # Protocol Layer
//!
//! Connection establishment and message correlation on top of the core codec.
//!
//! ## Components
//! - **Handshake**: version exchange and cipher/compression/checksum negotiation
//! - **Key Exchange**: RSA key transport or X25519 agreement, plus password proofs
//! - **Transaction**: transaction ids and reply-grammar correlation
//! - **Dispatcher**: routes application messages to registered handlers
//!
//! ## Connection Flow
//! ```text
//! Client                                     Server
//!   |-- p7.handshake.client_handshake ------>|
//!   |<----- p7.handshake.server_handshake ---|
//!   |-- p7.handshake.acknowledge ----------->|
//!   |<----- p7.encryption.server_key --------|  (cipher negotiated)
//!   |-- p7.encryption.client_key ----------->|
//!   |<----- p7.encryption.acknowledge -------|
//!   |<-- p7.compatibility_check.* ---------->|  (protocol mismatch)
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod key_exchange;
pub mod transaction;
