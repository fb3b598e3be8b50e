//! Frame checksums and the password-proof hash.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

/// Checksum algorithm negotiated during the handshake.
///
/// Each algorithm implies a fixed trailer length appended to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    #[default]
    None,
    Sha1,
    Sha256,
    Sha512,
}

impl Checksum {
    /// Trailer length in bytes.
    pub fn trailer_len(self) -> usize {
        match self {
            Checksum::None => 0,
            Checksum::Sha1 => 20,
            Checksum::Sha256 => 32,
            Checksum::Sha512 => 64,
        }
    }

    pub fn is_none(self) -> bool {
        self == Checksum::None
    }

    pub fn constant(self) -> Option<&'static str> {
        match self {
            Checksum::None => None,
            Checksum::Sha1 => Some("p7.handshake.checksum.sha1"),
            Checksum::Sha256 => Some("p7.handshake.checksum.sha256"),
            Checksum::Sha512 => Some("p7.handshake.checksum.sha512"),
        }
    }

    pub fn from_constant(name: &str) -> Option<Self> {
        match name {
            "p7.handshake.checksum.sha1" => Some(Checksum::Sha1),
            "p7.handshake.checksum.sha256" => Some(Checksum::Sha256),
            "p7.handshake.checksum.sha512" => Some(Checksum::Sha512),
            _ => None,
        }
    }

    /// Digest of the concatenated parts. Empty for [`Checksum::None`].
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            Checksum::None => Vec::new(),
            Checksum::Sha1 => run::<Sha1>(parts),
            Checksum::Sha256 => run::<Sha256>(parts),
            Checksum::Sha512 => run::<Sha512>(parts),
        }
    }

    /// The hash used for password proofs: the negotiated checksum, SHA-256 without one.
    pub fn proof_hash(self) -> Checksum {
        match self {
            Checksum::None => Checksum::Sha256,
            other => other,
        }
    }
}

/// Compare two digests in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailer_lengths_match_digests() {
        for checksum in [
            Checksum::None,
            Checksum::Sha1,
            Checksum::Sha256,
            Checksum::Sha512,
        ] {
            assert_eq!(checksum.digest(&[b"frame"]).len(), checksum.trailer_len());
        }
    }

    #[test]
    fn test_digest_over_parts_equals_whole() {
        assert_eq!(
            Checksum::Sha256.digest(&[b"ab", b"cd"]),
            Checksum::Sha256.digest(&[b"abcd"])
        );
    }

    #[test]
    fn test_known_sha256_of_empty() {
        assert_eq!(
            hex::encode(Checksum::Sha256.digest(&[b""])),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
