//! Radio transport trait for abstraction and testability
//!
//! This trait defines the four primitives the transfer protocol consumes
//! (send, receive, channel-clear check, signal strength) plus power control,
//! allowing the SX1262 driver to be swapped with a mock for testing.

use crate::config::protocol::MAX_LORA_PAYLOAD;
use core::fmt;
use core::future::Future;
use heapless::Vec;

/// Errors that can occur during radio operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Operation timed out
    Timeout,
    /// CRC error in received packet
    CrcMismatch,
    /// Packet exceeds what the modem accepts
    Oversize,
    /// Transmission or reception failed for a reason worth retrying
    Transient,
    /// Radio not initialised
    NotInitialised,
    /// Radio busy timeout or SPI failure
    Hardware,
    /// Invalid configuration
    InvalidConfig,
}

/// How the transfer protocol reacts to a radio error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry the same frame
    Retry,
    /// Shrink the chunk size and resplit
    Shrink,
    /// Counts towards the session failure threshold
    Wedge,
}

impl RadioError {
    /// Classify the error for the retry/shrink logic
    pub fn kind(&self) -> ErrorKind {
        match self {
            RadioError::Timeout | RadioError::CrcMismatch | RadioError::Transient => {
                ErrorKind::Retry
            }
            RadioError::Oversize => ErrorKind::Shrink,
            RadioError::NotInitialised | RadioError::Hardware | RadioError::InvalidConfig => {
                ErrorKind::Wedge
            }
        }
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RadioError::Timeout => "timeout",
            RadioError::CrcMismatch => "crc mismatch",
            RadioError::Oversize => "packet too long",
            RadioError::Transient => "transient radio error",
            RadioError::NotInitialised => "radio not initialised",
            RadioError::Hardware => "radio hardware fault",
            RadioError::InvalidConfig => "invalid radio configuration",
        };
        f.write_str(text)
    }
}

/// Result of a clear-channel (CAD) check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Free,
    Busy,
    Error,
}

/// Configuration for LoRa modulation
#[derive(Debug, Clone)]
pub struct LoraConfig {
    /// Centre frequency in Hz
    pub frequency_hz: u32,
    /// Spreading factor (7-12)
    pub spreading_factor: u8,
    /// Bandwidth in kHz (7.8, 10.4, 15.6, 20.8, 31.25, 41.7, 62.5, 125, 250, 500)
    pub bandwidth_khz: u32,
    /// Coding rate denominator (5-8 for 4/5 to 4/8)
    pub coding_rate: u8,
    /// Transmit power in dBm
    pub tx_power_dbm: i8,
}

impl Default for LoraConfig {
    fn default() -> Self {
        use crate::config::lora_defaults;

        Self {
            frequency_hz: lora_defaults::FREQUENCY_HZ,
            spreading_factor: lora_defaults::SPREADING_FACTOR,
            bandwidth_khz: lora_defaults::BANDWIDTH_KHZ,
            coding_rate: lora_defaults::CODING_RATE,
            tx_power_dbm: lora_defaults::TX_POWER_DBM,
        }
    }
}

/// Received packet with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Received data
    pub data: Vec<u8, MAX_LORA_PAYLOAD>,
    /// Received Signal Strength Indicator in dBm
    pub rssi: i16,
    /// Signal-to-Noise Ratio in dB
    pub snr: i8,
}

/// Radio transport consumed by the transfer protocol
///
/// Implementations must bound every operation: `recv` returns
/// [`RadioError::Timeout`] once `timeout_ms` elapses without a packet.
pub trait RadioTransport {
    /// Bring the radio out of sleep and apply the modem configuration
    fn init(&mut self) -> impl Future<Output = Result<(), RadioError>>;

    /// Put the radio into its lowest-power state
    fn deinit(&mut self) -> impl Future<Output = Result<(), RadioError>>;

    /// Transmit one frame, returning the number of bytes written
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<usize, RadioError>>;

    /// Receive one frame, waiting at most `timeout_ms`
    fn recv(&mut self, timeout_ms: u32) -> impl Future<Output = Result<RxPacket, RadioError>>;

    /// Run a channel activity detection cycle
    fn channel_clear(&mut self) -> impl Future<Output = ChannelState>;

    /// Instantaneous RSSI in dBm
    fn rssi(&mut self) -> impl Future<Output = i16>;
}
