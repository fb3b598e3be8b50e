//! # Error Types
//!
//! Error handling for the P7 protocol engine.
//!
//! Every fallible operation in the crate returns [`Result`], whose error is a
//! [`ProtocolError`]. Variants are grouped by [`ErrorCategory`], which decides how a
//! connection reacts to them:
//!
//! ## Error Categories
//! - **Transport**: socket failures, always fatal to the connection
//! - **Framing**: checksum, cipher, compression and codec failures, fatal
//! - **Sequence**: a message arrived out of order for the session state
//! - **Authentication**: key exchange or login rejected, the connect attempt fails
//! - **Correlation**: a transaction wait timed out or received an unlisted reply
//! - **Configuration**: invalid configuration or specification document
//!
//! Application errors (`wired.error` messages) are not faults. They travel through the
//! normal dispatch path as messages.
//!
//! ## Example Usage
//! ```rust
//! use p7_protocol::error::{ErrorCategory, ProtocolError, Result};
//!
//! fn check(frame_len: usize) -> Result<()> {
//!     if frame_len > 16 {
//!         return Err(ProtocolError::OversizedPacket(frame_len));
//!     }
//!     Ok(())
//! }
//!
//! let err = check(32).unwrap_err();
//! assert_eq!(err.category(), ErrorCategory::Framing);
//! assert!(err.is_fatal());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire connection registry lock";

    /// Framing errors
    pub const ERR_TRUNCATED_FRAME: &str = "Frame ended before the declared length";
    pub const ERR_TRUNCATED_FIELD: &str = "Field value runs past the end of the message";
    pub const ERR_MISSING_MESSAGE_ID: &str = "Message shorter than its type id";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";
    pub const ERR_INVALID_OOB_LENGTH: &str = "Out-of-band field must carry an 8-byte size";

    /// Handshake errors
    pub const ERR_MISSING_VERSION: &str = "Handshake is missing the bootstrap version";
    pub const ERR_MISSING_PROTOCOL: &str = "Handshake is missing the protocol name or version";
    pub const ERR_MISSING_PUBLIC_KEY: &str = "Server key message is missing the public key";
    pub const ERR_MISSING_CIPHER_KEY: &str = "Client key message is missing the cipher key";
    pub const ERR_MISSING_CIPHER_IV: &str = "Client key message is missing the cipher IV";
    pub const ERR_MISSING_USERNAME: &str = "Client key message is missing the username";
    pub const ERR_MISSING_PROOF: &str = "Key exchange message is missing the password proof";
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Peer public key is malformed";
    pub const ERR_KEY_EXCHANGE_CONSUMED: &str = "Key exchange secret already consumed";
    pub const ERR_LOW_ORDER_PUBLIC_KEY: &str = "Peer public key yields a non-contributory secret";
    pub const ERR_NO_RSA_KEY: &str = "RSA cipher suite selected but no server key is loaded";
    pub const ERR_PROOF_MISMATCH: &str = "Password proof mismatch";
    pub const ERR_UNKNOWN_USER: &str = "Unknown user";
    pub const ERR_SERVER_REJECTED: &str = "Server rejected the credentials";
    pub const ERR_COMPATIBILITY_REJECTED: &str = "Peer reported the protocols incompatible";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "Connection is not established";
    pub const ERR_TIMEOUT: &str = "Operation timed out";
}

/// Coarse classification of a [`ProtocolError`], used to decide whether a connection
/// survives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Framing,
    Sequence,
    Authentication,
    Correlation,
    Configuration,
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Duplicate {kind} id {id} in specification")]
    DuplicateId { kind: &'static str, id: u32 },

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown message id: {0}")]
    UnknownMessageId(u32),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Unknown field id: {0}")]
    UnknownFieldId(u32),

    #[error("Field {field} expects a value of kind {expected}")]
    FieldTypeMismatch {
        field: String,
        expected: &'static str,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Incompatible protocol: {0}")]
    IncompatibleProtocol(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Message out of sequence: {0}")]
    OutOfSequence(String),

    #[error("No transaction defined for message {0}")]
    UnknownTransaction(String),

    #[error("Reply {received} does not satisfy transaction for {expected}")]
    CorrelationFailure { expected: String, received: String },

    #[error("Message dispatch suspended")]
    Suspended,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::Suspended
            | ProtocolError::Custom(_) => ErrorCategory::Transport,
            ProtocolError::UnknownMessage(_)
            | ProtocolError::UnknownMessageId(_)
            | ProtocolError::UnknownField(_)
            | ProtocolError::UnknownFieldId(_)
            | ProtocolError::FieldTypeMismatch { .. }
            | ProtocolError::MalformedMessage(_)
            | ProtocolError::OversizedPacket(_)
            | ProtocolError::ChecksumMismatch
            | ProtocolError::DecryptionFailure
            | ProtocolError::EncryptionFailure
            | ProtocolError::CompressionFailure
            | ProtocolError::DecompressionFailure
            | ProtocolError::HandshakeError(_)
            | ProtocolError::UnsupportedVersion(_)
            | ProtocolError::IncompatibleProtocol(_) => ErrorCategory::Framing,
            ProtocolError::UnexpectedMessage(_) | ProtocolError::OutOfSequence(_) => {
                ErrorCategory::Sequence
            }
            ProtocolError::AuthenticationFailed(_) | ProtocolError::LoginFailed(_) => {
                ErrorCategory::Authentication
            }
            ProtocolError::Timeout
            | ProtocolError::UnknownTransaction(_)
            | ProtocolError::CorrelationFailure { .. } => ErrorCategory::Correlation,
            ProtocolError::InvalidSpecification(_)
            | ProtocolError::DuplicateId { .. }
            | ProtocolError::ConfigError(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether the error must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Framing | ErrorCategory::Authentication
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
