//! # Services
//!
//! Connection-level services built on the protocol layer.
//!
//! ## Components
//! - **Secure**: [`secure::SecureChannel`], a handshaken connection with framed I/O
//! - **Client**: login flow, transactions and asynchronous dispatch for one connection
//! - **Server**: acceptor, per-connection sessions, credentials and broadcast

pub mod client;
pub mod secure;
pub mod server;
