//! # P7 Protocol
//!
//! A specification-driven implementation of the P7 binary protocol: XML-described
//! messages, a framed and optionally compressed, encrypted and checksummed transport,
//! request/reply transactions, and the client and server sessions built on them.
//!
//! ## Layers
//! - [`spec`]: the registry loaded from the bootstrap and application documents
//! - [`core`]: typed messages, the binary codec and the frame pipeline
//! - [`protocol`]: handshake, key exchange, transaction correlation, dispatch
//! - [`service`]: secure channel, client connection and server
//! - [`config`], [`error`], [`utils`]: configuration, errors, crypto and observability
//!
//! ## Example
//! ```rust,no_run
//! use p7_protocol::{ConnectOptions, Connection, Specification};
//! use std::sync::Arc;
//!
//! # fn main() -> p7_protocol::Result<()> {
//! let spec = Arc::new(Specification::from_file("specs/wired.xml")?);
//! let connection = Connection::connect(
//!     Arc::clone(&spec),
//!     ConnectOptions::new("127.0.0.1:4871", "guest", ""),
//! )?;
//! println!("round trip: {:?}", connection.ping()?);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod spec;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::codec::MessageCodec;
pub use crate::core::frame::FrameCodec;
pub use crate::core::message::Message;
pub use crate::core::types::{FieldKind, FieldValue};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::dispatcher::Dispatcher;
pub use crate::protocol::handshake::{HandshakePolicy, NegotiatedParams};
pub use crate::protocol::transaction::{Correlator, Waiter};
pub use crate::service::client::{ConnectOptions, Connection, ConnectionObserver, LoginInfo};
pub use crate::service::secure::{AcceptOptions, ClientOptions, SecureChannel};
pub use crate::service::server::{
    CredentialStore, MemoryCredentials, Server, ServerHandle, ServerSession,
};
pub use crate::spec::Specification;
pub use crate::utils::compression::Compression;
pub use crate::utils::crypto::CipherSuite;
pub use crate::utils::digest::Checksum;
