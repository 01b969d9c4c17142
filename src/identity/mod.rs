//! SkyMesh Identity System
//!
//! Node identity based on secp256k1 keypairs. The same key signs
//! advertisements (BIP340 Schnorr) and derives pairwise symmetric secrets
//! (ECDH), so a node is fully described by its 32-byte x-only public key.
//! A one-byte hash prefix of the public key is exposed for cheap routing
//! lookups on the wire.

mod local;
mod peer;
mod store;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use local::LocalIdentity;
pub use peer::PeerIdentity;
pub use store::IdentityStore;

/// Size of a public key on the wire (x-only secp256k1).
pub const PUB_KEY_SIZE: usize = 32;

/// Size of an advertisement signature (BIP340 Schnorr).
pub const SIGNATURE_SIZE: usize = 64;

/// A cached pairwise symmetric secret (ECDH output).
pub type SharedSecret = [u8; 32];

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(secp256k1::Error),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(secp256k1::Error),

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("identity '{0}' not found in store")]
    Missing(String),

    #[error("identity store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute SHA-256 hash of data.
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}
