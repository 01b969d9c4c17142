//! Symmetric datagram crypto for the session layer.
//!
//! Datagrams between peers are sealed with ChaCha20-Poly1305 under the
//! cached pairwise ECDH secret; group-channel frames use a key derived from
//! the channel PSK with HKDF-SHA256 (PSKs may be 16 or 32 bytes, the AEAD
//! key is always 32). The sealed wire form is:
//!
//! ```text
//! [ nonce(12) | ciphertext | tag(16) ]
//! ```
//!
//! Plaintexts always begin with a 4-byte little-endian sender timestamp;
//! the session layer uses it for replay defense.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::identity::{sha256, SharedSecret, PUB_KEY_SIZE};

/// Size of the AEAD nonce prepended to every sealed datagram.
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag.
pub const TAG_SIZE: usize = 16;

/// Bytes added to a plaintext by [`seal`].
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// HKDF info string for group-channel key derivation.
const CHANNEL_KEY_INFO: &[u8] = b"skymesh group channel v1";

/// Errors from datagram crypto operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthFail,

    #[error("sealed datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("encryption failed")]
    EncryptionFailed,
}

/// Seal a plaintext under a 32-byte symmetric secret.
///
/// A fresh random nonce is generated per datagram and prepended to the
/// ciphertext.
pub fn seal(secret: &SharedSecret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(secret));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed datagram under a 32-byte symmetric secret.
///
/// Returns [`CryptoError::AuthFail`] if the tag does not verify, which is
/// also how receivers discover a datagram was not meant for them.
pub fn open(secret: &SharedSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::TooShort(sealed.len()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(secret));
    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &sealed[NONCE_SIZE..])
        .map_err(|_| CryptoError::AuthFail)
}

/// Derive the 32-byte AEAD key for a group channel from its PSK.
pub fn derive_channel_key(psk: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, psk);
    let mut key = [0u8; 32];
    hk.expand(CHANNEL_KEY_INFO, &mut key)
        .expect("32 bytes is a valid HKDF output length");
    key
}

/// Truncated acknowledgement hash for a text message.
///
/// `msg` is the message plaintext prefix `timestamp(4) ‖ flags(1) ‖ text`;
/// the hash binds it to the author's public key so a forged ACK
/// cannot be minted without seeing the message. Both ends compute the same
/// value: the sender at compose time (to recognize the future ACK), the
/// receiver at delivery time (to prove receipt).
pub fn ack_hash(msg: &[u8], sender_pub: &[u8; PUB_KEY_SIZE]) -> u32 {
    let mut input = Vec::with_capacity(msg.len() + PUB_KEY_SIZE);
    input.extend_from_slice(msg);
    input.extend_from_slice(sender_pub);
    let digest = sha256(&input);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Constant-time byte comparison for password checks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
