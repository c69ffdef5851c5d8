//! Hardware and protocol configuration constants for the ESP32-S3 with WIO-SX1262

/// LED pin (actuated by the `led_*` commands)
pub mod led {
    pub const PIN: u8 = 48;
}

/// SPI pins for LoRa module
pub mod spi {
    pub const SCLK: u8 = 7;
    pub const MISO: u8 = 8;
    pub const MOSI: u8 = 9;
}

/// LoRa control pins
pub mod lora_pins {
    pub const NSS: u8 = 41;
    pub const DIO1: u8 = 39;
    pub const NRST: u8 = 42;
    pub const BUSY: u8 = 40;
}

/// TCXO configuration
pub mod tcxo {
    /// TCXO voltage code for SX1262 register
    /// 0x02 = 1.8V
    pub const VOLTAGE_CODE: u8 = 0x02;
}

/// Default LoRa configuration
pub mod lora_defaults {
    /// EU ISM band frequency
    pub const FREQUENCY_HZ: u32 = 868_000_000;
    pub const SPREADING_FACTOR: u8 = 9;
    pub const BANDWIDTH_KHZ: u32 = 125;
    /// Coding rate 4/5
    pub const CODING_RATE: u8 = 5;
    pub const TX_POWER_DBM: i8 = 14;
}

/// Wire protocol constants
pub mod protocol {
    /// Schema tag carried in every frame (increment when the frame format changes)
    pub const SCHEMA_VERSION: u8 = 1;

    /// Hard packet-length ceiling of the radio
    pub const MAX_LORA_PAYLOAD: usize = 255;

    /// Truncated HMAC tag length in bytes
    pub const SIG_LEN: usize = 16;

    /// Longest accepted unit identifier
    pub const MAX_UNIT_ID_LEN: usize = 16;

    /// Broadcast target for commands
    pub const BROADCAST: &str = "*";
}

/// Frame security policy
pub mod security {
    /// Sign outgoing frames with the device secret
    pub const SIGN_FRAMES: bool = true;

    /// Drop unsigned frames; clear only on bench/debug builds
    pub const REJECT_UNSIGNED: bool = true;
}

/// Chunked transfer tuning
pub mod transfer {
    /// Raw chunk size; base64, JSON keys and the signature must still fit in
    /// `MAX_LORA_PAYLOAD`
    pub const CHUNK_SIZE: usize = 40;

    /// Floor for oversize-driven chunk shrinking
    pub const MIN_CHUNK_SIZE: usize = 16;

    /// Retransmissions per chunk before the message attempt is abandoned
    pub const CHUNK_RETRIES: u8 = 3;

    /// Whole-message attempts when the final ack is missing
    pub const MAX_RETRIES: u8 = 2;

    pub const CHUNK_ACK_TIMEOUT_MS: u32 = 2_500;
    pub const FINAL_ACK_TIMEOUT_MS: u32 = 4_000;

    /// Incomplete assemblies older than this are evicted
    pub const ASSEMBLY_TIMEOUT_MS: u64 = 120_000;

    /// Concurrent partial messages held by a receiver
    pub const MAX_OPEN_ASSEMBLIES: usize = 8;

    /// Completed `(unit_id, mid)` pairs remembered for idempotent retransmits
    pub const COMPLETED_HISTORY: usize = 32;

    /// Archived assembly records retained on storage
    pub const KEEP_N: usize = 5;
}

/// Session state machine tuning
pub mod session {
    /// Remote reporting interval
    pub const REPORT_INTERVAL_MS: u64 = 60_000;

    /// Window after a delivered message in which a command may arrive
    pub const RESPONSE_WINDOW_MS: u32 = 3_000;

    /// Base receive poll interval
    pub const RX_POLL_INTERVAL_MS: u32 = 1_000;

    /// Radio is powered down after this much inactivity
    pub const IDLE_TIMEOUT_MS: u64 = 30_000;

    /// Consecutive init/CAD/receive failures before a hard reset
    pub const FAILURE_THRESHOLD: u8 = 10;

    /// CAD backoff bounds
    pub const BACKOFF_MIN_MS: u32 = 100;
    pub const BACKOFF_MAX_MS: u32 = 3_000;

    /// Busy-channel checks before a send attempt counts as failed
    pub const MAX_CAD_ATTEMPTS: u8 = 8;

    /// Remotes tracked by a base station
    pub const MAX_PEERS: usize = 16;

    /// Commands queued at a base station awaiting delivery
    pub const MAX_PENDING_COMMANDS: usize = 8;
}

/// Command channel limits
pub mod commands {
    /// Registered handlers per device
    pub const MAX_HANDLERS: usize = 8;
    pub const MAX_ARGS: usize = 4;
    pub const MAX_NAME_LEN: usize = 24;
    pub const MAX_ARG_LEN: usize = 24;
}

/// Persistent storage layout
pub mod storage {
    use super::session::MAX_PEERS;
    use super::transfer::KEEP_N;

    /// `sys/node`, `sys/reset` and both copies of `ctr/tx`, `ctr/peers`
    /// and `mid/high`
    pub const FIXED_RECORDS: u32 = 8;

    /// Slots left free beyond the worst case
    pub const SPARE_SLOTS: u32 = 4;

    /// Fixed records, one secret per peer and the archive with the extra
    /// record it holds while rotating
    pub const SLOT_COUNT: u32 = FIXED_RECORDS + MAX_PEERS as u32 + KEEP_N as u32 + 1 + SPARE_SLOTS;

    /// Bytes per slot (header + key + value)
    pub const SLOT_SIZE: u32 = 4096;

    /// End of the 4 MB flash
    pub const FLASH_END: u32 = 0x40_0000;

    /// Flash offset of the key/value partition, placed against the end
    pub const PARTITION_OFFSET: u32 = FLASH_END - SLOT_COUNT * SLOT_SIZE;

    /// Largest value stored in one slot
    pub const MAX_VALUE_LEN: usize = 4000;
}
