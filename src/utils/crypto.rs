//! Session ciphers.
//!
//! Frames are sealed with an AEAD whose key comes out of the key exchange. Every frame
//! carries a fresh random nonce in front of the ciphertext; the session IV is bound in
//! as associated data.
//!
//! ```text
//! [nonce (12 bytes AES-GCM / 24 bytes XChaCha20)] [ciphertext + 16-byte tag]
//! ```

use crate::error::{ProtocolError, Result};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

/// Symmetric key length for every suite.
pub const KEY_LEN: usize = 32;

/// Session IV length.
pub const IV_LEN: usize = 16;

/// How the symmetric key is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyExchangeKind {
    /// Client-chosen key sealed under the server's RSA public key.
    RsaKeyTransport,
    /// Ephemeral X25519 agreement.
    EcdhKeyAgreement,
}

/// Frame AEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymmetricCipher {
    Aes256Gcm,
    XChaCha20Poly1305,
}

impl SymmetricCipher {
    pub fn nonce_len(self) -> usize {
        match self {
            SymmetricCipher::Aes256Gcm => 12,
            SymmetricCipher::XChaCha20Poly1305 => 24,
        }
    }
}

/// Cipher suite negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherSuite {
    #[default]
    None,
    RsaAes256,
    #[serde(rename = "rsa_chacha20")]
    RsaChaCha20,
    EcdhAes256,
    #[serde(rename = "ecdh_chacha20")]
    EcdhChaCha20,
}

impl CipherSuite {
    pub fn constant(self) -> Option<&'static str> {
        match self {
            CipherSuite::None => None,
            CipherSuite::RsaAes256 => Some("p7.handshake.encryption.rsa_aes256_sha256"),
            CipherSuite::RsaChaCha20 => Some("p7.handshake.encryption.rsa_chacha20_sha256"),
            CipherSuite::EcdhAes256 => Some("p7.handshake.encryption.ecdh_aes256_sha256"),
            CipherSuite::EcdhChaCha20 => Some("p7.handshake.encryption.ecdh_chacha20_sha256"),
        }
    }

    pub fn from_constant(name: &str) -> Option<Self> {
        match name {
            "p7.handshake.encryption.rsa_aes256_sha256" => Some(CipherSuite::RsaAes256),
            "p7.handshake.encryption.rsa_chacha20_sha256" => Some(CipherSuite::RsaChaCha20),
            "p7.handshake.encryption.ecdh_aes256_sha256" => Some(CipherSuite::EcdhAes256),
            "p7.handshake.encryption.ecdh_chacha20_sha256" => Some(CipherSuite::EcdhChaCha20),
            _ => None,
        }
    }

    pub fn is_none(self) -> bool {
        self == CipherSuite::None
    }

    pub fn key_exchange(self) -> Option<KeyExchangeKind> {
        match self {
            CipherSuite::None => None,
            CipherSuite::RsaAes256 | CipherSuite::RsaChaCha20 => {
                Some(KeyExchangeKind::RsaKeyTransport)
            }
            CipherSuite::EcdhAes256 | CipherSuite::EcdhChaCha20 => {
                Some(KeyExchangeKind::EcdhKeyAgreement)
            }
        }
    }

    pub fn symmetric(self) -> Option<SymmetricCipher> {
        match self {
            CipherSuite::None => None,
            CipherSuite::RsaAes256 | CipherSuite::EcdhAes256 => Some(SymmetricCipher::Aes256Gcm),
            CipherSuite::RsaChaCha20 | CipherSuite::EcdhChaCha20 => {
                Some(SymmetricCipher::XChaCha20Poly1305)
            }
        }
    }
}

/// Fill a buffer from the operating system RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes).map_err(|_| ProtocolError::EncryptionFailure)?;
    Ok(bytes)
}

enum Engine {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<XChaCha20Poly1305>),
}

/// The symmetric half of an established session.
pub struct SessionCipher {
    kind: SymmetricCipher,
    engine: Engine,
    iv: Zeroizing<Vec<u8>>,
}

impl SessionCipher {
    /// Build a cipher. The caller's key buffer is left untouched; zeroize it after use.
    pub fn new(kind: SymmetricCipher, key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(ProtocolError::HandshakeError(format!(
                "session key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let engine = match kind {
            SymmetricCipher::Aes256Gcm => Engine::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| ProtocolError::EncryptionFailure)?,
            )),
            SymmetricCipher::XChaCha20Poly1305 => Engine::ChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| ProtocolError::EncryptionFailure)?,
            )),
        };
        Ok(Self {
            kind,
            engine,
            iv: Zeroizing::new(iv.to_vec()),
        })
    }

    pub fn kind(&self) -> SymmetricCipher {
        self.kind
    }

    /// Seal `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad: &self.iv,
        };
        let (mut nonce, ciphertext) = match &self.engine {
            Engine::Aes(cipher) => {
                let nonce = random_bytes::<12>()?;
                let sealed = cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| ProtocolError::EncryptionFailure)?;
                (nonce.to_vec(), sealed)
            }
            Engine::ChaCha(cipher) => {
                let nonce = random_bytes::<24>()?;
                let sealed = cipher
                    .encrypt(chacha20poly1305::XNonce::from_slice(&nonce), payload)
                    .map_err(|_| ProtocolError::EncryptionFailure)?;
                (nonce.to_vec(), sealed)
            }
        };

        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        nonce.zeroize();
        Ok(out)
    }

    /// Open a sealed buffer produced by [`SessionCipher::encrypt`].
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let nonce_len = self.kind.nonce_len();
        if sealed.len() < nonce_len {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = sealed.split_at(nonce_len);
        let payload = Payload {
            msg: ciphertext,
            aad: &self.iv,
        };
        match &self.engine {
            Engine::Aes(cipher) => cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Engine::ChaCha(cipher) => {
                cipher.decrypt(chacha20poly1305::XNonce::from_slice(nonce), payload)
            }
        }
        .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_both_ciphers() {
        let key = [7u8; KEY_LEN];
        let iv = [9u8; IV_LEN];
        for kind in [SymmetricCipher::Aes256Gcm, SymmetricCipher::XChaCha20Poly1305] {
            let cipher = SessionCipher::new(kind, &key, &iv).unwrap();
            let sealed = cipher.encrypt(b"wired.chat.say").unwrap();
            assert_eq!(sealed.len(), kind.nonce_len() + 14 + 16);
            assert_eq!(cipher.decrypt(&sealed).unwrap(), b"wired.chat.say");
        }
    }

    #[test]
    fn test_nonces_differ_per_frame() {
        let cipher =
            SessionCipher::new(SymmetricCipher::Aes256Gcm, &[1u8; KEY_LEN], &[0u8; IV_LEN])
                .unwrap();
        assert_ne!(cipher.encrypt(b"x").unwrap(), cipher.encrypt(b"x").unwrap());
    }

    #[test]
    fn test_tampering_and_wrong_iv_fail() {
        let key = [3u8; KEY_LEN];
        let sender =
            SessionCipher::new(SymmetricCipher::XChaCha20Poly1305, &key, &[1u8; IV_LEN]).unwrap();
        let mut sealed = sender.encrypt(b"secret").unwrap();

        let other_iv =
            SessionCipher::new(SymmetricCipher::XChaCha20Poly1305, &key, &[2u8; IV_LEN]).unwrap();
        assert!(matches!(
            other_iv.decrypt(&sealed),
            Err(ProtocolError::DecryptionFailure)
        ));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(sender.decrypt(&sealed).is_err());
        assert!(sender.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_suite_mapping() {
        assert_eq!(
            CipherSuite::EcdhChaCha20.key_exchange(),
            Some(KeyExchangeKind::EcdhKeyAgreement)
        );
        assert_eq!(
            CipherSuite::RsaAes256.symmetric(),
            Some(SymmetricCipher::Aes256Gcm)
        );
        assert_eq!(CipherSuite::None.symmetric(), None);
        for suite in [
            CipherSuite::RsaAes256,
            CipherSuite::RsaChaCha20,
            CipherSuite::EcdhAes256,
            CipherSuite::EcdhChaCha20,
        ] {
            assert_eq!(
                CipherSuite::from_constant(suite.constant().unwrap()),
                Some(suite)
            );
        }
        assert!(SessionCipher::new(SymmetricCipher::Aes256Gcm, &[0u8; 16], &[]).is_err());
    }
}
