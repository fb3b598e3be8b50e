//! Session key establishment and mutual password proofs.
//!
//! Runs right after the transport handshake when a cipher suite was negotiated:
//!
//! ```text
//! server  p7.encryption.server_key { public_key }
//! client  p7.encryption.client_key { cipher.key, cipher.iv, username, client_password }
//! server  p7.encryption.acknowledge { server_password }   (or authentication_error)
//! ```
//!
//! Both sides prove knowledge of the password digest bound to the server's public key:
//!
//! ```text
//! proof1 = H(digest ‖ server_public)     client → server
//! proof2 = H(server_public ‖ digest)     server → client
//! ```
//!
//! where `digest` is the lowercase hex SHA-256 of the password and `H` is the negotiated
//! checksum (SHA-256 when none was negotiated).
//!
//! Two key exchanges implement [`KeyExchange`]: RSA key transport, where the client picks
//! the key and seals every field with RSA-OAEP, and X25519 key agreement, where the
//! client sends its ephemeral public key in `cipher.key` and encrypts the credentials
//! with the derived session cipher.

use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::spec::Specification;
use crate::utils::crypto::{
    random_bytes, CipherSuite, KeyExchangeKind, SessionCipher, SymmetricCipher, IV_LEN, KEY_LEN,
};
use crate::utils::digest::{constant_time_eq, Checksum};
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, Zeroizing};

pub const SERVER_KEY: &str = "p7.encryption.server_key";
pub const CLIENT_KEY: &str = "p7.encryption.client_key";
pub const ACKNOWLEDGE: &str = "p7.encryption.acknowledge";
pub const AUTHENTICATION_ERROR: &str = "p7.encryption.authentication_error";

const FIELD_PUBLIC_KEY: &str = "p7.encryption.public_key";
const FIELD_CIPHER_KEY: &str = "p7.encryption.cipher.key";
const FIELD_CIPHER_IV: &str = "p7.encryption.cipher.iv";
const FIELD_USERNAME: &str = "p7.encryption.username";
const FIELD_CLIENT_PASSWORD: &str = "p7.encryption.client_password";
const FIELD_SERVER_PASSWORD: &str = "p7.encryption.server_password";

/// Lowercase hex SHA-256 of a password, the form credential stores keep.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Proof the client sends: `H(digest ‖ server_public)`.
pub fn client_proof(checksum: Checksum, digest: &str, server_public: &[u8]) -> Vec<u8> {
    checksum
        .proof_hash()
        .digest(&[digest.as_bytes(), server_public])
}

/// Proof the server answers with: `H(server_public ‖ digest)`.
pub fn server_proof(checksum: Checksum, digest: &str, server_public: &[u8]) -> Vec<u8> {
    checksum
        .proof_hash()
        .digest(&[server_public, digest.as_bytes()])
}

/// Constant-time proof comparison.
pub fn verify_proof(expected: &[u8], received: &[u8]) -> bool {
    constant_time_eq(expected, received)
}

/// What the server recovers from a `p7.encryption.client_key`.
pub struct ClientKey {
    pub username: String,
    pub proof: Vec<u8>,
    pub cipher: SessionCipher,
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKey")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// One key establishment method, usable from either end of the connection.
pub trait KeyExchange: Send {
    fn kind(&self) -> KeyExchangeKind;

    /// Public key bytes the server announces in `p7.encryption.server_key`. The same bytes
    /// feed both password proofs.
    fn server_public_key(&self) -> Result<Vec<u8>>;

    /// Server side: open a client key message with our secret.
    fn open_client_key(&mut self, message: &Message, symmetric: SymmetricCipher)
        -> Result<ClientKey>;

    /// Client side: establish the session key against `server_public` and seal the
    /// credentials into a client key message.
    fn seal_client_key(
        &mut self,
        spec: &Arc<Specification>,
        server_public: &[u8],
        symmetric: SymmetricCipher,
        username: &str,
        proof: &[u8],
    ) -> Result<(Message, SessionCipher)>;
}

/// Key exchange for the server end of a negotiated suite.
pub fn server_key_exchange(
    suite: CipherSuite,
    rsa_key: Option<&Arc<RsaPrivateKey>>,
) -> Result<Box<dyn KeyExchange>> {
    match suite.key_exchange() {
        Some(KeyExchangeKind::RsaKeyTransport) => {
            let key = rsa_key
                .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_NO_RSA_KEY.into()))?;
            Ok(Box::new(RsaKeyTransport::server(Arc::clone(key))?))
        }
        Some(KeyExchangeKind::EcdhKeyAgreement) => Ok(Box::new(EcdhKeyAgreement::new())),
        None => Err(ProtocolError::HandshakeError(format!(
            "cipher suite {suite:?} has no key exchange"
        ))),
    }
}

/// Key exchange for the client end of a negotiated suite.
pub fn client_key_exchange(suite: CipherSuite) -> Result<Box<dyn KeyExchange>> {
    match suite.key_exchange() {
        Some(KeyExchangeKind::RsaKeyTransport) => Ok(Box::new(RsaKeyTransport::client())),
        Some(KeyExchangeKind::EcdhKeyAgreement) => Ok(Box::new(EcdhKeyAgreement::new())),
        None => Err(ProtocolError::HandshakeError(format!(
            "cipher suite {suite:?} has no key exchange"
        ))),
    }
}

/// Build `p7.encryption.server_key`.
pub fn server_key_message(spec: &Arc<Specification>, public: &[u8]) -> Result<Message> {
    Message::new(spec, SERVER_KEY)?.with(FIELD_PUBLIC_KEY, public.to_vec())
}

/// Read the public key out of `p7.encryption.server_key`.
pub fn read_server_key(message: &Message) -> Result<Vec<u8>> {
    crate::protocol::handshake::expect(message, SERVER_KEY)?;
    message
        .data(FIELD_PUBLIC_KEY)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MISSING_PUBLIC_KEY.into()))
}

/// Build `p7.encryption.acknowledge` carrying proof2 sealed by the session cipher.
pub fn acknowledge_message(
    spec: &Arc<Specification>,
    cipher: &SessionCipher,
    proof: &[u8],
) -> Result<Message> {
    Message::new(spec, ACKNOWLEDGE)?.with(FIELD_SERVER_PASSWORD, cipher.encrypt(proof)?)
}

/// Open proof2 from a `p7.encryption.acknowledge`.
pub fn read_acknowledge(message: &Message, cipher: &SessionCipher) -> Result<Vec<u8>> {
    let sealed = message
        .data(FIELD_SERVER_PASSWORD)
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MISSING_PROOF.into()))?;
    cipher.decrypt(sealed)
}

pub fn authentication_error_message(spec: &Arc<Specification>) -> Result<Message> {
    Message::new(spec, AUTHENTICATION_ERROR)
}

fn required<'a>(message: &'a Message, field: &str, missing: &'static str) -> Result<&'a [u8]> {
    message
        .data(field)
        .ok_or_else(|| ProtocolError::HandshakeError(missing.into()))
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_INVALID_UTF8.into()))
}

/// RSA key transport. The server holds the private key; the client only needs the
/// public key it receives.
pub struct RsaKeyTransport {
    private: Option<Arc<RsaPrivateKey>>,
    public_der: Vec<u8>,
}

impl RsaKeyTransport {
    pub fn server(private: Arc<RsaPrivateKey>) -> Result<Self> {
        let public_der = private
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| ProtocolError::HandshakeError(format!("RSA key encoding: {e}")))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private: Some(private),
            public_der,
        })
    }

    pub fn client() -> Self {
        Self {
            private: None,
            public_der: Vec::new(),
        }
    }

    /// Generate a server key of `bits` bits.
    pub fn generate_key(bits: usize) -> Result<RsaPrivateKey> {
        RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ProtocolError::HandshakeError(format!("RSA key generation: {e}")))
    }

    fn seal(public: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
        public
            .encrypt(&mut OsRng, Oaep::new::<sha1::Sha1>(), data)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    fn open(private: &RsaPrivateKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        private
            .decrypt(Oaep::new::<sha1::Sha1>(), data)
            .map(Zeroizing::new)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

impl KeyExchange for RsaKeyTransport {
    fn kind(&self) -> KeyExchangeKind {
        KeyExchangeKind::RsaKeyTransport
    }

    fn server_public_key(&self) -> Result<Vec<u8>> {
        if self.private.is_none() {
            return Err(ProtocolError::HandshakeError(constants::ERR_NO_RSA_KEY.into()));
        }
        Ok(self.public_der.clone())
    }

    #[instrument(skip_all)]
    fn open_client_key(
        &mut self,
        message: &Message,
        symmetric: SymmetricCipher,
    ) -> Result<ClientKey> {
        crate::protocol::handshake::expect(message, CLIENT_KEY)?;
        let private = self
            .private
            .as_ref()
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_NO_RSA_KEY.into()))?;

        let key = Self::open(
            private,
            required(message, FIELD_CIPHER_KEY, constants::ERR_MISSING_CIPHER_KEY)?,
        )?;
        let iv = Self::open(
            private,
            required(message, FIELD_CIPHER_IV, constants::ERR_MISSING_CIPHER_IV)?,
        )?;
        let username = Self::open(
            private,
            required(message, FIELD_USERNAME, constants::ERR_MISSING_USERNAME)?,
        )?;
        let proof = Self::open(
            private,
            required(message, FIELD_CLIENT_PASSWORD, constants::ERR_MISSING_PROOF)?,
        )?;

        let cipher = SessionCipher::new(symmetric, &key, &iv)?;
        debug!("Opened RSA client key");
        Ok(ClientKey {
            username: utf8(username.to_vec())?,
            proof: proof.to_vec(),
            cipher,
        })
    }

    #[instrument(skip_all)]
    fn seal_client_key(
        &mut self,
        spec: &Arc<Specification>,
        server_public: &[u8],
        symmetric: SymmetricCipher,
        username: &str,
        proof: &[u8],
    ) -> Result<(Message, SessionCipher)> {
        let public = RsaPublicKey::from_pkcs1_der(server_public).map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_INVALID_PUBLIC_KEY.into())
        })?;
        self.public_der = server_public.to_vec();

        let key = Zeroizing::new(random_bytes::<KEY_LEN>()?);
        let iv = random_bytes::<IV_LEN>()?;
        let cipher = SessionCipher::new(symmetric, key.as_slice(), &iv)?;

        let message = Message::new(spec, CLIENT_KEY)?
            .with(FIELD_CIPHER_KEY, Self::seal(&public, key.as_slice())?)?
            .with(FIELD_CIPHER_IV, Self::seal(&public, &iv)?)?
            .with(FIELD_USERNAME, Self::seal(&public, username.as_bytes())?)?
            .with(FIELD_CLIENT_PASSWORD, Self::seal(&public, proof)?)?;
        Ok((message, cipher))
    }
}

/// Derive a session key from an X25519 shared secret and both public keys
fn derive_key_from_shared_secret(
    shared_secret: &SharedSecret,
    client_public: &[u8],
    server_public: &[u8],
) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(b"client_key");
    hasher.update(client_public);
    hasher.update(b"server_key");
    hasher.update(server_public);
    Zeroizing::new(hasher.finalize().into())
}

fn public_key(bytes: &[u8]) -> Result<PublicKey> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_INVALID_PUBLIC_KEY.into()))?;
    Ok(PublicKey::from(array))
}

/// Ephemeral X25519 key agreement. Each instance holds one single-use secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct EcdhKeyAgreement {
    #[zeroize(skip)]
    secret: Option<EphemeralSecret>,
    public: [u8; 32],
}

impl EcdhKeyAgreement {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self {
            secret: Some(secret),
            public,
        }
    }

    fn agree(&mut self, peer_public: &[u8]) -> Result<SharedSecret> {
        let peer = public_key(peer_public)?;
        let secret = self.secret.take().ok_or_else(|| {
            ProtocolError::HandshakeError(constants::ERR_KEY_EXCHANGE_CONSUMED.into())
        })?;
        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            warn!("Peer sent a low-order public key");
            return Err(ProtocolError::HandshakeError(
                constants::ERR_LOW_ORDER_PUBLIC_KEY.into(),
            ));
        }
        Ok(shared)
    }
}

impl Default for EcdhKeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for EcdhKeyAgreement {
    fn kind(&self) -> KeyExchangeKind {
        KeyExchangeKind::EcdhKeyAgreement
    }

    fn server_public_key(&self) -> Result<Vec<u8>> {
        Ok(self.public.to_vec())
    }

    #[instrument(skip_all)]
    fn open_client_key(
        &mut self,
        message: &Message,
        symmetric: SymmetricCipher,
    ) -> Result<ClientKey> {
        crate::protocol::handshake::expect(message, CLIENT_KEY)?;
        let client_public = required(message, FIELD_CIPHER_KEY, constants::ERR_MISSING_CIPHER_KEY)?;
        let iv = required(message, FIELD_CIPHER_IV, constants::ERR_MISSING_CIPHER_IV)?;

        let shared = self.agree(client_public)?;
        let key = derive_key_from_shared_secret(&shared, client_public, &self.public);
        let cipher = SessionCipher::new(symmetric, key.as_slice(), iv)?;

        let username = cipher.decrypt(required(
            message,
            FIELD_USERNAME,
            constants::ERR_MISSING_USERNAME,
        )?)?;
        let proof = cipher.decrypt(required(
            message,
            FIELD_CLIENT_PASSWORD,
            constants::ERR_MISSING_PROOF,
        )?)?;
        debug!("Opened ECDH client key");
        Ok(ClientKey {
            username: utf8(username)?,
            proof,
            cipher,
        })
    }

    #[instrument(skip_all)]
    fn seal_client_key(
        &mut self,
        spec: &Arc<Specification>,
        server_public: &[u8],
        symmetric: SymmetricCipher,
        username: &str,
        proof: &[u8],
    ) -> Result<(Message, SessionCipher)> {
        let shared = self.agree(server_public)?;
        let key = derive_key_from_shared_secret(&shared, &self.public, server_public);
        let iv = random_bytes::<IV_LEN>()?;
        let cipher = SessionCipher::new(symmetric, key.as_slice(), &iv)?;

        let message = Message::new(spec, CLIENT_KEY)?
            .with(FIELD_CIPHER_KEY, self.public.to_vec())?
            .with(FIELD_CIPHER_IV, iv.to_vec())?
            .with(FIELD_USERNAME, cipher.encrypt(username.as_bytes())?)?
            .with(FIELD_CLIENT_PASSWORD, cipher.encrypt(proof)?)?;
        Ok((message, cipher))
    }
}
