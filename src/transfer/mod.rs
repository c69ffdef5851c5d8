//! Chunked reliable transfer
//!
//! A message is split into chunks, each sent as a `telemetry` frame and
//! individually acknowledged with a `chunk_ack`. Once every chunk is
//! acknowledged the receiver sends an end-to-end `ack` for the message id.
//! A missing final ack restarts the whole message from chunk 0; the
//! receiver recognises the retransmission and acknowledges it without
//! delivering the message twice.

pub mod archive;
pub mod backoff;
pub mod receiver;
pub mod sender;


use crate::lora::RadioError;
use crate::protocol::{Frame, FrameError};
use crate::security::{FrameGuard, Keyring, SecurityConfig, SecurityError};
use crate::storage::{Storage, StorageError};
use alloc::vec::Vec;
use core::fmt;

pub use archive::{Archive, ArchivedMessage};
pub use backoff::Backoff;
pub use receiver::{MessageSink, Reception, Receiver};
pub use sender::{Delivery, MidGenerator, Sender};

/// Errors raised while moving a frame between the radio and the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    Radio(RadioError),
    Frame(FrameError),
    Security(SecurityError),
    Storage(StorageError),
    /// Frame addressed to another unit, or our own transmission
    NotForUs,
    /// CAD kept reporting activity
    ChannelBusy,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Radio(e) => write!(f, "radio: {}", e),
            TransferError::Frame(e) => write!(f, "frame: {}", e),
            TransferError::Security(e) => write!(f, "security: {}", e),
            TransferError::Storage(e) => write!(f, "storage: {}", e),
            TransferError::NotForUs => f.write_str("frame not addressed to this unit"),
            TransferError::ChannelBusy => f.write_str("channel busy"),
        }
    }
}

impl From<RadioError> for TransferError {
    fn from(e: RadioError) -> Self {
        TransferError::Radio(e)
    }
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        TransferError::Frame(e)
    }
}

impl From<SecurityError> for TransferError {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::Frame(e) => TransferError::Frame(e),
            SecurityError::Storage(e) => TransferError::Storage(e),
            other => TransferError::Security(other),
        }
    }
}

impl From<StorageError> for TransferError {
    fn from(e: StorageError) -> Self {
        TransferError::Storage(e)
    }
}

/// Transfer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Raw bytes per chunk before encryption and base64
    pub chunk_size: usize,
    /// Oversize shrinking stops here
    pub min_chunk_size: usize,
    /// Retransmissions of one chunk before the attempt is abandoned
    pub chunk_retries: u8,
    pub chunk_ack_timeout_ms: u32,
    pub final_ack_timeout_ms: u32,
    pub assembly_timeout_ms: u64,
    pub max_open_assemblies: usize,
    pub completed_history: usize,
    /// Archived messages retained on storage
    pub keep_n: usize,
    /// Busy CAD results tolerated before a transmission counts as failed
    pub max_cad_attempts: u8,
}

impl Default for TransferConfig {
    fn default() -> Self {
        use crate::config::{session, transfer};

        Self {
            chunk_size: transfer::CHUNK_SIZE,
            min_chunk_size: transfer::MIN_CHUNK_SIZE,
            chunk_retries: transfer::CHUNK_RETRIES,
            chunk_ack_timeout_ms: transfer::CHUNK_ACK_TIMEOUT_MS,
            final_ack_timeout_ms: transfer::FINAL_ACK_TIMEOUT_MS,
            assembly_timeout_ms: transfer::ASSEMBLY_TIMEOUT_MS,
            max_open_assemblies: transfer::MAX_OPEN_ASSEMBLIES,
            completed_history: transfer::COMPLETED_HISTORY,
            keep_n: transfer::KEEP_N,
            max_cad_attempts: session::MAX_CAD_ATTEMPTS,
        }
    }
}

/// One device's security state and persistent storage
///
/// Both directions of a link go through here: outgoing frames are sealed and
/// encoded, incoming bytes are decoded, address-checked and opened.
pub struct Endpoint<S> {
    guard: FrameGuard,
    storage: S,
}

impl<S: Storage> Endpoint<S> {
    pub fn new(guard: FrameGuard, storage: S) -> Self {
        Self { guard, storage }
    }

    /// Restore counters from `storage` and take ownership of it
    pub fn load(
        unit_id: &str,
        config: SecurityConfig,
        keyring: Keyring,
        mut storage: S,
    ) -> Result<Self, StorageError> {
        let guard = FrameGuard::load(unit_id, config, keyring, &mut storage)?;
        Ok(Self::new(guard, storage))
    }

    pub fn unit_id(&self) -> &str {
        self.guard.unit_id()
    }

    pub fn guard(&self) -> &FrameGuard {
        &self.guard
    }

    pub fn storage(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Seal `frame` and serialise it for the radio
    pub fn seal(&mut self, mut frame: Frame) -> Result<Vec<u8>, TransferError> {
        self.guard.seal(&mut frame, &mut self.storage)?;
        Ok(frame.encode()?)
    }

    /// Decode received bytes and run them through the security checks
    pub fn open(&mut self, bytes: &[u8]) -> Result<Frame, TransferError> {
        let frame = Frame::decode(bytes)?;
        if frame.unit_id == self.guard.unit_id() || !frame.is_for(self.guard.unit_id()) {
            return Err(TransferError::NotForUs);
        }
        Ok(self.guard.open(frame, &mut self.storage)?)
    }
}
