//! Transport handshake messages and parameter negotiation.
//!
//! The handshake runs before anything else on a connection:
//!
//! ```text
//! client                                   server
//!   p7.handshake.client_handshake  ──────▶
//!                                  ◀──────  p7.handshake.server_handshake
//!   p7.handshake.acknowledge       ──────▶
//!   (compression + checksum active from here on)
//! ```
//!
//! This module only builds and reads those messages and decides the negotiated
//! parameters. Driving them over a socket is done by
//! [`SecureChannel`](crate::service::secure::SecureChannel).

use crate::config::{ClientConfig, ServerConfig};
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::spec::Specification;
use crate::utils::compression::Compression;
use crate::utils::crypto::CipherSuite;
use crate::utils::digest::Checksum;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub const CLIENT_HANDSHAKE: &str = "p7.handshake.client_handshake";
pub const SERVER_HANDSHAKE: &str = "p7.handshake.server_handshake";
pub const ACKNOWLEDGE: &str = "p7.handshake.acknowledge";
pub const COMPATIBILITY_SPECIFICATION: &str = "p7.compatibility_check.specification";
pub const COMPATIBILITY_STATUS: &str = "p7.compatibility_check.status";

const FIELD_VERSION: &str = "p7.handshake.version";
const FIELD_PROTOCOL_NAME: &str = "p7.handshake.protocol.name";
const FIELD_PROTOCOL_VERSION: &str = "p7.handshake.protocol.version";
const FIELD_COMPRESSION: &str = "p7.handshake.compression";
const FIELD_ENCRYPTION: &str = "p7.handshake.encryption";
const FIELD_CHECKSUM: &str = "p7.handshake.checksum";
const FIELD_COMPATIBILITY_CHECK: &str = "p7.handshake.compatibility_check";
const FIELD_SPECIFICATION: &str = "p7.compatibility_check.specification";
const FIELD_STATUS: &str = "p7.compatibility_check.status";

/// Frame options carried by a handshake. Used both for the client's proposal and for
/// the server's selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NegotiatedParams {
    pub compression: Compression,
    pub cipher: CipherSuite,
    pub checksum: Checksum,
}

impl NegotiatedParams {
    /// The proposal a client built from `config` sends.
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            compression: config.compression,
            cipher: config.cipher,
            checksum: config.checksum,
        }
    }
}

/// What a peer announced about itself in its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub bootstrap_version: String,
    pub protocol_name: String,
    pub protocol_version: String,
}

/// Server-side selection rules, one allowed set and fallback per parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakePolicy {
    pub ciphers: Vec<CipherSuite>,
    pub cipher_fallback: CipherSuite,
    pub compressions: Vec<Compression>,
    pub compression_fallback: Compression,
    pub checksums: Vec<Checksum>,
    pub checksum_fallback: Checksum,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

fn select<T: Copy + PartialEq>(proposed: T, allowed: &[T], fallback: T) -> T {
    if allowed.contains(&proposed) {
        proposed
    } else {
        fallback
    }
}

impl HandshakePolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            ciphers: config.ciphers.clone(),
            cipher_fallback: config.cipher_fallback,
            compressions: config.compressions.clone(),
            compression_fallback: config.compression_fallback,
            checksums: config.checksums.clone(),
            checksum_fallback: config.checksum_fallback,
        }
    }

    /// A policy that accepts whatever the client proposes.
    pub fn permissive() -> Self {
        Self {
            ciphers: vec![
                CipherSuite::None,
                CipherSuite::RsaAes256,
                CipherSuite::RsaChaCha20,
                CipherSuite::EcdhAes256,
                CipherSuite::EcdhChaCha20,
            ],
            cipher_fallback: CipherSuite::None,
            compressions: vec![Compression::None, Compression::Deflate],
            compression_fallback: Compression::None,
            checksums: vec![
                Checksum::None,
                Checksum::Sha1,
                Checksum::Sha256,
                Checksum::Sha512,
            ],
            checksum_fallback: Checksum::None,
        }
    }

    /// Select the parameters for a proposal. Pure, so identical proposals always get
    /// identical answers.
    pub fn negotiate(&self, proposal: &NegotiatedParams) -> NegotiatedParams {
        NegotiatedParams {
            compression: select(
                proposal.compression,
                &self.compressions,
                self.compression_fallback,
            ),
            cipher: select(proposal.cipher, &self.ciphers, self.cipher_fallback),
            checksum: select(proposal.checksum, &self.checksums, self.checksum_fallback),
        }
    }

    /// Whether any allowed suite needs a server RSA key.
    pub fn uses_rsa(&self) -> bool {
        self.ciphers
            .iter()
            .chain(std::iter::once(&self.cipher_fallback))
            .any(|c| matches!(c, CipherSuite::RsaAes256 | CipherSuite::RsaChaCha20))
    }
}

fn write_params(message: &mut Message, params: &NegotiatedParams) -> Result<()> {
    if let Some(constant) = params.compression.constant() {
        message.set_enum(FIELD_COMPRESSION, constant)?;
    }
    if let Some(constant) = params.cipher.constant() {
        message.set_enum(FIELD_ENCRYPTION, constant)?;
    }
    if let Some(constant) = params.checksum.constant() {
        message.set_enum(FIELD_CHECKSUM, constant)?;
    }
    Ok(())
}

/// Read the frame options of a handshake message. Absent or unrecognized values read
/// as `None`.
pub fn read_params(message: &Message) -> NegotiatedParams {
    NegotiatedParams {
        compression: message
            .enum_name(FIELD_COMPRESSION)
            .and_then(Compression::from_constant)
            .unwrap_or_default(),
        cipher: message
            .enum_name(FIELD_ENCRYPTION)
            .and_then(CipherSuite::from_constant)
            .unwrap_or_default(),
        checksum: message
            .enum_name(FIELD_CHECKSUM)
            .and_then(Checksum::from_constant)
            .unwrap_or_default(),
    }
}

/// Read the version and protocol identity from either handshake message.
pub fn read_peer(message: &Message) -> Result<PeerInfo> {
    let bootstrap_version = message
        .string(FIELD_VERSION)
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MISSING_VERSION.into()))?;
    let (protocol_name, protocol_version) = message
        .string(FIELD_PROTOCOL_NAME)
        .zip(message.string(FIELD_PROTOCOL_VERSION))
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MISSING_PROTOCOL.into()))?;
    Ok(PeerInfo {
        bootstrap_version: bootstrap_version.to_string(),
        protocol_name: protocol_name.to_string(),
        protocol_version: protocol_version.to_string(),
    })
}

/// Fail with `UnsupportedVersion` unless the peer speaks our bootstrap version.
pub fn check_version(spec: &Specification, peer: &PeerInfo) -> Result<()> {
    if peer.bootstrap_version == spec.bootstrap_version() {
        Ok(())
    } else {
        warn!(
            local = spec.bootstrap_version(),
            remote = %peer.bootstrap_version,
            "Bootstrap version mismatch"
        );
        Err(ProtocolError::UnsupportedVersion(format!(
            "local {}, remote {}",
            spec.bootstrap_version(),
            peer.bootstrap_version
        )))
    }
}

fn identity(spec: &Arc<Specification>, name: &str) -> Result<Message> {
    Message::new(spec, name)?
        .with(FIELD_VERSION, spec.bootstrap_version())?
        .with(FIELD_PROTOCOL_NAME, spec.protocol_name())?
        .with(FIELD_PROTOCOL_VERSION, spec.protocol_version())
}

/// Build the opening `p7.handshake.client_handshake`.
pub fn client_handshake(
    spec: &Arc<Specification>,
    proposal: &NegotiatedParams,
) -> Result<Message> {
    let mut message = identity(spec, CLIENT_HANDSHAKE)?;
    write_params(&mut message, proposal)?;
    Ok(message)
}

/// Server half of the exchange: read the client handshake and build the reply.
///
/// The reply is built even when the bootstrap versions differ so the client learns the
/// server's version; the returned `PeerInfo` must then go through [`check_version`].
#[instrument(skip(spec, policy, request), fields(message = request.name()))]
pub fn server_negotiate(
    spec: &Arc<Specification>,
    policy: &HandshakePolicy,
    request: &Message,
) -> Result<(PeerInfo, NegotiatedParams, Message)> {
    expect(request, CLIENT_HANDSHAKE)?;
    let peer = read_peer(request)?;
    let selected = policy.negotiate(&read_params(request));
    let wants_check = spec.needs_compatibility_check(&peer.protocol_name, &peer.protocol_version);

    let mut reply = identity(spec, SERVER_HANDSHAKE)?;
    write_params(&mut reply, &selected)?;
    if wants_check {
        reply.set(FIELD_COMPATIBILITY_CHECK, true)?;
    }
    debug!(?selected, wants_check, peer = %peer.protocol_name, "Negotiated handshake");
    Ok((peer, selected, reply))
}

/// Client half: read the server's selection.
///
/// Returns the server identity, the parameters to activate, and whether the server asked
/// for our specification.
#[instrument(skip(spec, reply), fields(message = reply.name()))]
pub fn client_accept(
    spec: &Specification,
    reply: &Message,
) -> Result<(PeerInfo, NegotiatedParams, bool)> {
    expect(reply, SERVER_HANDSHAKE)?;
    let peer = read_peer(reply)?;
    check_version(spec, &peer)?;
    let selected = read_params(reply);
    let server_wants_check = reply.bool(FIELD_COMPATIBILITY_CHECK).unwrap_or(false);
    debug!(?selected, server_wants_check, "Server selected handshake parameters");
    Ok((peer, selected, server_wants_check))
}

/// Build `p7.handshake.acknowledge`, asking for the server's specification if needed.
pub fn acknowledge(spec: &Arc<Specification>, wants_check: bool) -> Result<Message> {
    let mut message = Message::new(spec, ACKNOWLEDGE)?;
    if wants_check {
        message.set(FIELD_COMPATIBILITY_CHECK, true)?;
    }
    Ok(message)
}

/// Whether an acknowledge asks for our specification.
pub fn acknowledge_wants_check(message: &Message) -> Result<bool> {
    expect(message, ACKNOWLEDGE)?;
    Ok(message.bool(FIELD_COMPATIBILITY_CHECK).unwrap_or(false))
}

/// Our application document, sent when the peer asked for a compatibility check.
pub fn compatibility_specification(spec: &Arc<Specification>) -> Result<Message> {
    Message::new(spec, COMPATIBILITY_SPECIFICATION)?.with(FIELD_SPECIFICATION, spec.document())
}

/// Judge a peer's document and build the status reply.
pub fn evaluate_compatibility(
    spec: &Arc<Specification>,
    message: &Message,
) -> Result<(bool, Message)> {
    expect(message, COMPATIBILITY_SPECIFICATION)?;
    let document = message.string(FIELD_SPECIFICATION).ok_or_else(|| {
        ProtocolError::MalformedMessage(format!("{COMPATIBILITY_SPECIFICATION} has no document"))
    })?;
    let compatible = match spec.is_compatible_with(document) {
        Ok(compatible) => compatible,
        Err(e) => {
            warn!(error = %e, "Peer specification could not be parsed");
            false
        }
    };
    let status = Message::new(spec, COMPATIBILITY_STATUS)?.with(FIELD_STATUS, compatible)?;
    Ok((compatible, status))
}

/// Read a compatibility status, failing with `IncompatibleProtocol` on `false`.
pub fn check_compatibility_status(message: &Message) -> Result<()> {
    expect(message, COMPATIBILITY_STATUS)?;
    if message.bool(FIELD_STATUS).unwrap_or(false) {
        Ok(())
    } else {
        Err(ProtocolError::IncompatibleProtocol(
            constants::ERR_COMPATIBILITY_REJECTED.into(),
        ))
    }
}

/// Fail with `UnexpectedMessage` unless `message` is of type `name`.
pub fn expect(message: &Message, name: &str) -> Result<()> {
    if message.name() == name {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedMessage(format!(
            "expected {name}, got {}",
            message.name()
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec() -> Arc<Specification> {
        Arc::new(Specification::bootstrap().unwrap())
    }

    fn proposal() -> NegotiatedParams {
        NegotiatedParams {
            compression: Compression::Deflate,
            cipher: CipherSuite::EcdhChaCha20,
            checksum: Checksum::Sha512,
        }
    }

    #[test]
    fn test_negotiation_is_idempotent() {
        let spec = spec();
        let policy = HandshakePolicy::default();
        let request = client_handshake(&spec, &proposal()).unwrap();

        let (_, first, reply_a) = server_negotiate(&spec, &policy, &request).unwrap();
        let (_, second, reply_b) = server_negotiate(&spec, &policy, &request).unwrap();
        assert_eq!(first, second);
        assert_eq!(reply_a, reply_b);
        assert_eq!(first, proposal());
    }

    #[test]
    fn test_disallowed_proposals_take_fallbacks() {
        let policy = HandshakePolicy {
            ciphers: vec![CipherSuite::RsaAes256],
            cipher_fallback: CipherSuite::RsaAes256,
            compressions: vec![Compression::None],
            compression_fallback: Compression::None,
            checksums: vec![Checksum::Sha1],
            checksum_fallback: Checksum::Sha1,
        };
        let selected = policy.negotiate(&proposal());
        assert_eq!(selected.cipher, CipherSuite::RsaAes256);
        assert_eq!(selected.compression, Compression::None);
        assert_eq!(selected.checksum, Checksum::Sha1);
        assert!(policy.uses_rsa());
        assert_eq!(
            HandshakePolicy::permissive()
                .negotiate(&NegotiatedParams::default())
                .cipher,
            CipherSuite::None
        );
    }

    #[test]
    fn test_absent_fields_read_as_none() {
        let spec = spec();
        let request = client_handshake(&spec, &NegotiatedParams::default()).unwrap();
        assert!(!request.contains(FIELD_ENCRYPTION));
        assert_eq!(read_params(&request), NegotiatedParams::default());
    }

    #[test]
    fn test_client_reads_selection() {
        let spec = spec();
        let request = client_handshake(&spec, &proposal()).unwrap();
        let (peer, selected, reply) =
            server_negotiate(&spec, &HandshakePolicy::permissive(), &request).unwrap();
        assert_eq!(peer.protocol_name, "P7");

        let (server, accepted, wants_check) = client_accept(&spec, &reply).unwrap();
        assert_eq!(server.bootstrap_version, "1.0");
        assert_eq!(accepted, selected);
        assert!(!wants_check);
    }

    #[test]
    fn test_version_mismatch() {
        let spec = spec();
        let mut reply = identity(&spec, SERVER_HANDSHAKE).unwrap();
        reply.set(FIELD_VERSION, "2.0").unwrap();
        assert!(matches!(
            client_accept(&spec, &reply),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_wrong_message_is_unexpected() {
        let spec = spec();
        let ack = acknowledge(&spec, true).unwrap();
        assert!(acknowledge_wants_check(&ack).unwrap());
        assert!(matches!(
            client_accept(&spec, &ack),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_compatibility_roundtrip() {
        let spec = spec();
        let document = compatibility_specification(&spec).unwrap();
        let (compatible, status) = evaluate_compatibility(&spec, &document).unwrap();
        assert!(compatible);
        check_compatibility_status(&status).unwrap();

        let rejected = Message::new(&spec, COMPATIBILITY_STATUS)
            .unwrap()
            .with(FIELD_STATUS, false)
            .unwrap();
        assert!(matches!(
            check_compatibility_status(&rejected),
            Err(ProtocolError::IncompatibleProtocol(_))
        ));
    }
}
