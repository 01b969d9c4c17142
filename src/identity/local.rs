//! Local node identity with signing and key-agreement capability.

use rand::RngCore;
use secp256k1::ecdh;
use secp256k1::{Keypair, Parity, Secp256k1, SecretKey};
use std::fmt;

use super::{sha256, IdentityError, PeerIdentity, SharedSecret};

/// A node's long-term identity: a secp256k1 keypair plus derived lookups.
///
/// The keypair is normalized to even parity at construction so that x-only
/// ECDH between two nodes agrees regardless of which side computes it. The
/// same key signs advertisements and derives pairwise secrets.
pub struct LocalIdentity {
    keypair: Keypair,
    peer: PeerIdentity,
}

impl LocalIdentity {
    /// Create a new random identity.
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut secret_bytes);
        let secret_key = SecretKey::from_slice(&secret_bytes)
            .expect("32 random bytes is a valid secret key");
        Self::from_secret_key(secret_key)
    }

    /// Create an identity from a secret key, normalizing to even parity.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let mut keypair = Keypair::from_secret_key(&secp, &secret_key);
        if keypair.x_only_public_key().1 == Parity::Odd {
            // Negating the secret flips the y parity; the x coordinate (and
            // therefore the wire identity) is unchanged.
            keypair = Keypair::from_secret_key(&secp, &secret_key.negate());
        }
        let peer = PeerIdentity::from_bytes(&keypair.x_only_public_key().0.serialize())
            .expect("serialized x-only key is valid");
        Self { keypair, peer }
    }

    /// Create an identity from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret_key =
            SecretKey::from_slice(bytes).map_err(IdentityError::InvalidSecretKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create an identity from a hex-encoded secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })?;
        Self::from_secret_bytes(&arr)
    }

    /// Return the secret key bytes (for persistent storage).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.keypair.secret_key().secret_bytes()
    }

    /// Return the public half of this identity.
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Return the 32-byte x-only public key.
    pub fn pub_key(&self) -> &[u8; 32] {
        self.peer.as_bytes()
    }

    /// First byte of SHA-256(public key), used as the relay id on paths and
    /// as the destination/source prefix inside datagram payloads.
    pub fn hash_prefix(&self) -> u8 {
        self.peer.hash_prefix()
    }

    /// Sign arbitrary data with this identity's secret key.
    ///
    /// The data is hashed with SHA-256 and signed with BIP340 Schnorr.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        let secp = Secp256k1::new();
        let digest = sha256(data);
        *secp.sign_schnorr(&digest, &self.keypair).as_ref()
    }

    /// Derive the 32-byte pairwise secret with a peer (ECDH).
    ///
    /// Pure function of (our secret key, their public key); callers cache
    /// the result per contact.
    pub fn shared_secret(&self, peer: &PeerIdentity) -> SharedSecret {
        let shared = ecdh::SharedSecret::new(&peer.full_pubkey(), &self.keypair.secret_key());
        shared.secret_bytes()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("pub_key", &hex::encode(self.pub_key()))
            .finish_non_exhaustive()
    }
}
