//! Remote peer identity (public key only, no signing capability).

use secp256k1::schnorr::Signature;
use secp256k1::{Parity, PublicKey, Secp256k1, XOnlyPublicKey};
use std::fmt;

use super::{sha256, IdentityError, PUB_KEY_SIZE};

/// A peer's identity: the 32-byte x-only public key.
///
/// Two identities match iff their public keys are equal. The first byte of
/// SHA-256(public key) is precomputed as a cheap routing prefix; datagram
/// payloads carry it so receivers can shortlist decryption candidates
/// without trial-decrypting against every contact.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pubkey: XOnlyPublicKey,
    bytes: [u8; PUB_KEY_SIZE],
    hash_prefix: u8,
}

impl PeerIdentity {
    /// Create a peer identity from 32 raw public key bytes.
    pub fn from_bytes(bytes: &[u8; PUB_KEY_SIZE]) -> Result<Self, IdentityError> {
        let pubkey =
            XOnlyPublicKey::from_slice(bytes).map_err(IdentityError::InvalidPublicKey)?;
        let hash_prefix = sha256(bytes)[0];
        Ok(Self {
            pubkey,
            bytes: *bytes,
            hash_prefix,
        })
    }

    /// Create a peer identity from a byte slice of any length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; PUB_KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| IdentityError::InvalidKeyLength {
                    expected: PUB_KEY_SIZE,
                    got: bytes.len(),
                })?;
        Self::from_bytes(&arr)
    }

    /// Return the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PUB_KEY_SIZE] {
        &self.bytes
    }

    /// Check whether this is the same identity (public key equality).
    pub fn matches(&self, other: &PeerIdentity) -> bool {
        self.bytes == other.bytes
    }

    /// First byte of SHA-256(public key).
    pub fn hash_prefix(&self) -> u8 {
        self.hash_prefix
    }

    /// Check whether a wire hash prefix could refer to this identity.
    pub fn hash_matches(&self, prefix: u8) -> bool {
        self.hash_prefix == prefix
    }

    /// Return the full public key for ECDH (even-parity convention).
    ///
    /// Local identities normalize to even parity at construction, so both
    /// ends of a pairwise derivation reconstruct the same point.
    pub fn full_pubkey(&self) -> PublicKey {
        self.pubkey.public_key(Parity::Even)
    }

    /// Verify a BIP340 Schnorr signature from this peer over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        let secp = Secp256k1::new();
        let digest = sha256(data);
        secp.verify_schnorr(&signature, &digest, &self.pubkey).is_ok()
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("pub_key", &hex::encode(self.bytes))
            .field("hash_prefix", &format_args!("{:02x}", self.hash_prefix))
            .finish()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}
