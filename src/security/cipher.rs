//! Payload confidentiality
//!
//! Two modes share the 256-bit device secret and a 96-bit nonce:
//!
//! - [`CipherMode::Stream`]: plain ChaCha20, ciphertext length equals
//!   plaintext length, no integrity beyond the frame signature.
//! - [`CipherMode::Aead`]: ChaCha20-Poly1305. The first keystream block
//!   keys Poly1305, which covers the associated data, the ciphertext and
//!   both lengths. A 16-byte tag is appended and checked in constant time;
//!   nothing is decrypted unless it matches.
//!
//! Nonces are derived from `(unit_id, timestamp, ctr)` and never repeat for
//! a key as long as the sender's counter is monotonic.

use super::{DeviceSecret, SecurityError};
use alloc::vec::Vec;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use sha2::{Digest, Sha256};

/// ChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length in bytes
pub const TAG_LEN: usize = 16;

pub type CipherNonce = [u8; NONCE_LEN];

/// Payload protection applied to frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherMode {
    /// Data travels in the clear (still signed when signing is enabled)
    None,
    Stream,
    #[default]
    Aead,
}

/// Deterministic nonce for a frame
///
/// `SHA-256(unit_id || 0x00 || timestamp_be || ctr_be)[..12]`; the sender id
/// keeps the two directions of a link from sharing nonces.
pub fn derive_nonce(unit_id: &str, timestamp: u64, ctr: u32) -> CipherNonce {
    let mut hasher = Sha256::new();
    hasher.update(unit_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(timestamp.to_be_bytes());
    hasher.update(ctr.to_be_bytes());
    let digest = hasher.finalize();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

/// Nonce from raw bytes, rejecting the wrong length
pub fn nonce_from_slice(bytes: &[u8]) -> Result<CipherNonce, SecurityError> {
    debug_assert_eq!(bytes.len(), NONCE_LEN, "nonce must be 96 bits");
    bytes.try_into().map_err(|_| SecurityError::InvalidNonceLength)
}

fn keystream(payload: &[u8], secret: &DeviceSecret, nonce: &CipherNonce) -> Vec<u8> {
    let mut buf = payload.to_vec();
    let mut cipher = ChaCha20::new(Key::from_slice(secret.as_bytes()), Nonce::from_slice(nonce));
    cipher.apply_keystream(&mut buf);
    buf
}

/// Encrypt `payload` under `mode`
///
/// `aad` is only authenticated in [`CipherMode::Aead`].
pub fn encrypt(
    mode: CipherMode,
    payload: &[u8],
    aad: &[u8],
    secret: &DeviceSecret,
    nonce: &CipherNonce,
) -> Result<Vec<u8>, SecurityError> {
    match mode {
        CipherMode::None => Ok(payload.to_vec()),
        CipherMode::Stream => Ok(keystream(payload, secret, nonce)),
        CipherMode::Aead => {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
            cipher
                .encrypt(Nonce::from_slice(nonce), Payload { msg: payload, aad })
                .map_err(|_| SecurityError::AuthFailure)
        }
    }
}

/// Decrypt `ciphertext` under `mode`
///
/// In AEAD mode a tag mismatch returns [`SecurityError::AuthFailure`] and no
/// plaintext.
pub fn decrypt(
    mode: CipherMode,
    ciphertext: &[u8],
    aad: &[u8],
    secret: &DeviceSecret,
    nonce: &CipherNonce,
) -> Result<Vec<u8>, SecurityError> {
    match mode {
        CipherMode::None => Ok(ciphertext.to_vec()),
        CipherMode::Stream => Ok(keystream(ciphertext, secret, nonce)),
        CipherMode::Aead => {
            if ciphertext.len() < TAG_LEN {
                return Err(SecurityError::AuthFailure);
            }
            let cipher = ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
            cipher
                .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
                .map_err(|_| SecurityError::AuthFailure)
        }
    }
}

/// Bytes added to each chunk by `mode`
pub fn overhead(mode: CipherMode) -> usize {
    match mode {
        CipherMode::Aead => TAG_LEN,
        CipherMode::None | CipherMode::Stream => 0,
    }
}
