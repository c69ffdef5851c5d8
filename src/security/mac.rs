//! Frame signatures
//!
//! HMAC-SHA256 over the counter (big-endian) followed by the canonical frame
//! bytes, truncated to [`SIG_LEN`] bytes to fit the radio frame budget.

use super::{DeviceSecret, KEY_LEN};
use crate::config::protocol::SIG_LEN;
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Truncated frame signature
pub type Signature = [u8; SIG_LEN];

fn keyed(secret: &DeviceSecret, ctr: u32, frame_bytes: &[u8]) -> HmacSha256 {
    // Zero padding to the block size is what HMAC does with a short key
    let mut key = Key::<HmacSha256>::default();
    key[..KEY_LEN].copy_from_slice(secret.as_bytes());
    let mut mac = <HmacSha256 as KeyInit>::new(&key);
    key.as_mut_slice().zeroize();
    mac.update(&ctr.to_be_bytes());
    mac.update(frame_bytes);
    mac
}

/// Sign `frame_bytes` sent with counter `ctr`
pub fn sign(frame_bytes: &[u8], secret: &DeviceSecret, ctr: u32) -> Signature {
    let tag = keyed(secret, ctr, frame_bytes).finalize().into_bytes();
    let mut sig = [0u8; SIG_LEN];
    sig.copy_from_slice(&tag[..SIG_LEN]);
    sig
}

/// Constant-time check of a received signature
pub fn verify(frame_bytes: &[u8], sig: &[u8], secret: &DeviceSecret, ctr: u32) -> bool {
    if sig.len() != SIG_LEN {
        return false;
    }
    keyed(secret, ctr, frame_bytes)
        .verify_truncated_left(sig)
        .is_ok()
}
