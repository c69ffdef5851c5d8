//! Frame authentication, confidentiality and replay protection
//!
//! [`FrameGuard`] is the single entry point used by the transfer protocol:
//! [`FrameGuard::seal`] on the way out (counter, encryption, signature) and
//! [`FrameGuard::open`] on the way in (signature, replay check, decryption).
//! Anything that fails on the way in is dropped by the caller; the guard only
//! counts it and logs the reason.

pub mod cipher;
pub mod mac;
pub mod replay;

use crate::protocol::{Frame, FrameError, FrameType};
use crate::storage::{Storage, StorageError};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use cipher::CipherMode;
pub use replay::{PeerCounters, TxCounter};

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// Errors raised by the security layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityError {
    InvalidKeyLength,
    InvalidNonceLength,
    /// No shared secret for the sender or destination
    UnknownPeer,
    /// Frame carries no signature and policy requires one
    Unsigned,
    BadSignature,
    /// Counter not greater than the last accepted one
    Replay,
    /// AEAD tag mismatch
    AuthFailure,
    /// Transmit counter reached its maximum
    CounterExhausted,
    Frame(FrameError),
    Storage(StorageError),
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::InvalidKeyLength => f.write_str("invalid key length"),
            SecurityError::InvalidNonceLength => f.write_str("invalid nonce length"),
            SecurityError::UnknownPeer => f.write_str("no key for peer"),
            SecurityError::Unsigned => f.write_str("unsigned frame"),
            SecurityError::BadSignature => f.write_str("bad signature"),
            SecurityError::Replay => f.write_str("replayed counter"),
            SecurityError::AuthFailure => f.write_str("authentication failure"),
            SecurityError::CounterExhausted => f.write_str("transmit counter exhausted"),
            SecurityError::Frame(e) => write!(f, "frame: {}", e),
            SecurityError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl From<FrameError> for SecurityError {
    fn from(e: FrameError) -> Self {
        SecurityError::Frame(e)
    }
}

impl From<StorageError> for SecurityError {
    fn from(e: StorageError) -> Self {
        SecurityError::Storage(e)
    }
}

/// 256-bit secret shared between a remote and the base
///
/// Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceSecret([u8; KEY_LEN]);

impl DeviceSecret {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Secret from provisioning data, rejecting the wrong length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SecurityError> {
        debug_assert_eq!(bytes.len(), KEY_LEN, "device secret must be 256 bits");
        let raw: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SecurityError::InvalidKeyLength)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceSecret(..)")
    }
}

/// Security policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityConfig {
    /// Sign outgoing frames
    pub sign: bool,
    /// Drop incoming frames without a signature (only when `sign` is set)
    pub reject_unsigned: bool,
    /// Protection applied to telemetry chunk data
    pub cipher: CipherMode,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        use crate::config::security;

        Self {
            sign: security::SIGN_FRAMES,
            reject_unsigned: security::REJECT_UNSIGNED,
            cipher: CipherMode::default(),
        }
    }
}

/// Shared secrets by unit id
///
/// A remote holds its own secret; a base holds one per remote.
#[derive(Debug, Default, Clone)]
pub struct Keyring {
    keys: BTreeMap<String, DeviceSecret>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit_id: &str, secret: DeviceSecret) {
        self.keys.insert(String::from(unit_id), secret);
    }

    pub fn get(&self, unit_id: &str) -> Option<&DeviceSecret> {
        self.keys.get(unit_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keyring holding a single secret
    pub fn single(unit_id: &str, secret: DeviceSecret) -> Self {
        let mut keyring = Self::new();
        keyring.insert(unit_id, secret);
        keyring
    }
}

/// Associated data binding a chunk to its position in a message
fn chunk_aad(frame: &Frame) -> Vec<u8> {
    format!(
        "{}|{}|{}|{}",
        frame.unit_id,
        frame.mid,
        frame.chunk_idx.unwrap_or(0),
        frame.chunks.unwrap_or(0)
    )
    .into_bytes()
}

/// Per-device security state
pub struct FrameGuard {
    unit_id: String,
    config: SecurityConfig,
    keyring: Keyring,
    peers: PeerCounters,
    tx: TxCounter,
    security_events: u32,
}

impl FrameGuard {
    /// Restore counters from `storage`
    pub fn load<S: Storage + ?Sized>(
        unit_id: &str,
        config: SecurityConfig,
        keyring: Keyring,
        storage: &mut S,
    ) -> Result<Self, StorageError> {
        let peers = PeerCounters::load(storage)?;
        let tx = TxCounter::load(storage)?;
        log::debug!(
            "security: {} peer counters, next ctr {}",
            peers.len(),
            tx.peek()
        );
        Ok(Self {
            unit_id: String::from(unit_id),
            config,
            keyring,
            peers,
            tx,
            security_events: 0,
        })
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Frames dropped for signature, replay or decryption failures
    pub fn security_events(&self) -> u32 {
        self.security_events
    }

    /// Last counter accepted from `unit_id`
    pub fn peer_counter(&self, unit_id: &str) -> Option<u32> {
        self.peers.last(unit_id)
    }

    /// The sender's key, else the destination's when the frame is addressed
    fn secret_for(&self, frame: &Frame) -> Option<&DeviceSecret> {
        self.keyring
            .get(&frame.unit_id)
            .or_else(|| frame.dst.as_deref().and_then(|dst| self.keyring.get(dst)))
    }

    fn needs_key(&self) -> bool {
        self.config.sign || self.config.cipher != CipherMode::None
    }

    /// Assign a counter, encrypt chunk data and sign `frame` in place
    pub fn seal<S: Storage + ?Sized>(
        &mut self,
        frame: &mut Frame,
        storage: &mut S,
    ) -> Result<(), SecurityError> {
        let secret = match self.secret_for(frame) {
            Some(secret) => Some(secret.clone()),
            None if self.needs_key() => return Err(SecurityError::UnknownPeer),
            None => None,
        };

        let ctr = self.tx.next(storage)?;
        frame.ctr = Some(ctr);
        frame.sig = None;

        if let Some(secret) = &secret {
            if frame.kind == FrameType::Telemetry && self.config.cipher != CipherMode::None {
                let nonce = cipher::derive_nonce(&frame.unit_id, frame.mid, ctr);
                let plain = frame.data_bytes()?;
                let sealed = cipher::encrypt(
                    self.config.cipher,
                    &plain,
                    &chunk_aad(frame),
                    secret,
                    &nonce,
                )?;
                frame.set_data(&sealed);
            }
            if self.config.sign {
                let sig = mac::sign(&frame.canonical()?, secret, ctr);
                frame.set_sig(&sig);
            }
        }
        Ok(())
    }

    /// Authenticate and decrypt a received frame
    ///
    /// The returned frame carries plaintext data. The sender's counter is
    /// persisted only once every check has passed.
    pub fn open<S: Storage + ?Sized>(
        &mut self,
        frame: Frame,
        storage: &mut S,
    ) -> Result<Frame, SecurityError> {
        let sender = frame.unit_id.clone();
        match self.check(frame, storage) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                if !matches!(e, SecurityError::Storage(_)) {
                    self.security_events = self.security_events.saturating_add(1);
                }
                log::warn!("security: dropped frame from {}: {}", sender, e);
                Err(e)
            }
        }
    }

    fn check<S: Storage + ?Sized>(
        &mut self,
        mut frame: Frame,
        storage: &mut S,
    ) -> Result<Frame, SecurityError> {
        let secret = self.secret_for(&frame).cloned();

        match frame.sig_bytes()? {
            Some(sig) => {
                let secret = secret.as_ref().ok_or(SecurityError::UnknownPeer)?;
                let ctr = frame.ctr.ok_or(SecurityError::BadSignature)?;
                if !mac::verify(&frame.canonical()?, &sig, secret, ctr) {
                    return Err(SecurityError::BadSignature);
                }
            }
            None if self.config.sign && self.config.reject_unsigned => {
                return Err(SecurityError::Unsigned);
            }
            None => {}
        }

        // Without a counter there is nothing to order the frame against
        let ctr = frame.ctr.ok_or(SecurityError::Replay)?;
        self.peers.check(&frame.unit_id, ctr)?;

        if frame.kind == FrameType::Telemetry && self.config.cipher != CipherMode::None {
            let secret = secret.as_ref().ok_or(SecurityError::UnknownPeer)?;
            let nonce = cipher::derive_nonce(&frame.unit_id, frame.mid, ctr);
            let sealed = frame.data_bytes()?;
            let plain = cipher::decrypt(
                self.config.cipher,
                &sealed,
                &chunk_aad(&frame),
                secret,
                &nonce,
            )?;
            frame.set_data(&plain);
        }

        self.peers.accept(&frame.unit_id, ctr, storage)?;
        Ok(frame)
    }
}
