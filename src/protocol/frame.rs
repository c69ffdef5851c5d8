//! Radio frame wire format
//!
//! Frames are compact JSON objects. Optional keys are omitted when absent so
//! a telemetry frame carries only what the receiver needs:
//!
//! ```text
//! {"schema":1,"type":"telemetry","unit_id":"r1","mid":1234,"chunk_idx":0,
//!  "chunks":3,"data":"<base64>","ctr":17,"sig":"<base64>"}
//! ```
//!
//! | type        | required keys                         |
//! |-------------|---------------------------------------|
//! | `telemetry` | `chunk_idx`, `chunks`, `data`         |
//! | `chunk_ack` | `chunk_idx`, `result`                 |
//! | `ack`       | `result` (optionally `cmd`)           |
//! | `cmd`       | `cmd`                                 |
//! | `ack_cmd`   | `result`                              |
//!
//! The signature covers the canonical form: the same object serialised
//! with `sig` removed. Field order is fixed by the struct definition.

use crate::config::protocol::{MAX_LORA_PAYLOAD, MAX_UNIT_ID_LEN, SCHEMA_VERSION};
use alloc::string::String;
use alloc::vec::Vec;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Result text carried by positive acknowledgements
pub const RESULT_OK: &str = "ok";

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Telemetry,
    ChunkAck,
    Ack,
    Cmd,
    AckCmd,
}

/// Errors raised while encoding or decoding frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Not valid JSON, or wrong field types
    Malformed,
    /// Schema tag this firmware does not speak
    UnsupportedSchema,
    /// A key required by the frame type is absent
    MissingField(&'static str),
    /// `chunks == 0` or `chunk_idx >= chunks`
    InvalidChunk,
    /// Empty or over-long unit id
    InvalidUnitId,
    /// `data` or `sig` is not valid base64
    BadEncoding,
    /// Serialised frame exceeds the radio ceiling
    TooLong(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed => f.write_str("malformed frame"),
            FrameError::UnsupportedSchema => f.write_str("unsupported schema"),
            FrameError::MissingField(name) => write!(f, "missing field '{}'", name),
            FrameError::InvalidChunk => f.write_str("invalid chunk index"),
            FrameError::InvalidUnitId => f.write_str("invalid unit id"),
            FrameError::BadEncoding => f.write_str("bad base64 encoding"),
            FrameError::TooLong(len) => write!(f, "frame of {} bytes exceeds radio limit", len),
        }
    }
}

/// One radio frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub schema: u8,
    #[serde(rename = "type")]
    pub kind: FrameType,
    /// Sender identity
    pub unit_id: String,
    /// Destination of a reply; absent on uplink frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    pub mid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_idx: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<u16>,
    /// Base64 chunk payload, possibly encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Command envelope text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctr: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Frame {
    fn base(kind: FrameType, unit_id: &str, mid: u64) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            kind,
            unit_id: String::from(unit_id),
            dst: None,
            mid,
            chunk_idx: None,
            chunks: None,
            data: None,
            result: None,
            cmd: None,
            ctr: None,
            sig: None,
        }
    }

    /// One chunk of a telemetry message
    pub fn telemetry(unit_id: &str, mid: u64, chunk_idx: u16, chunks: u16, data: &[u8]) -> Self {
        let mut frame = Self::base(FrameType::Telemetry, unit_id, mid);
        frame.chunk_idx = Some(chunk_idx);
        frame.chunks = Some(chunks);
        frame.set_data(data);
        frame
    }

    /// Per-chunk acknowledgement addressed to `dst`
    pub fn chunk_ack(unit_id: &str, dst: &str, mid: u64, chunk_idx: u16) -> Self {
        let mut frame = Self::base(FrameType::ChunkAck, unit_id, mid);
        frame.dst = Some(String::from(dst));
        frame.chunk_idx = Some(chunk_idx);
        frame.result = Some(String::from(RESULT_OK));
        frame
    }

    /// End-to-end acknowledgement for a reassembled message
    pub fn ack(unit_id: &str, dst: &str, mid: u64) -> Self {
        let mut frame = Self::base(FrameType::Ack, unit_id, mid);
        frame.dst = Some(String::from(dst));
        frame.result = Some(String::from(RESULT_OK));
        frame
    }

    /// Standalone command frame
    pub fn command(unit_id: &str, dst: &str, mid: u64, envelope: &str) -> Self {
        let mut frame = Self::base(FrameType::Cmd, unit_id, mid);
        frame.dst = Some(String::from(dst));
        frame.cmd = Some(String::from(envelope));
        frame
    }

    /// Result of executing a command
    pub fn command_result(unit_id: &str, dst: &str, mid: u64, result: &str) -> Self {
        let mut frame = Self::base(FrameType::AckCmd, unit_id, mid);
        frame.dst = Some(String::from(dst));
        frame.result = Some(String::from(result));
        frame
    }

    /// Replace the payload with the base64 encoding of `data`
    pub fn set_data(&mut self, data: &[u8]) {
        self.data = Some(BASE64.encode(data));
    }

    /// Decoded payload bytes (empty when the frame has none)
    pub fn data_bytes(&self) -> Result<Vec<u8>, FrameError> {
        match &self.data {
            Some(text) => BASE64.decode(text).map_err(|_| FrameError::BadEncoding),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_sig(&mut self, sig: &[u8]) {
        self.sig = Some(BASE64.encode(sig));
    }

    /// Decoded signature, if the frame is signed
    pub fn sig_bytes(&self) -> Result<Option<Vec<u8>>, FrameError> {
        match &self.sig {
            Some(text) => BASE64
                .decode(text)
                .map(Some)
                .map_err(|_| FrameError::BadEncoding),
            None => Ok(None),
        }
    }

    /// Whether this frame is addressed to `unit_id` (or to nobody in particular)
    pub fn is_for(&self, unit_id: &str) -> bool {
        match &self.dst {
            Some(dst) => dst == unit_id,
            None => true,
        }
    }

    /// Byte representation covered by the signature
    pub fn canonical(&self) -> Result<Vec<u8>, FrameError> {
        let mut unsigned = self.clone();
        unsigned.sig = None;
        serde_json::to_vec(&unsigned).map_err(|_| FrameError::Malformed)
    }

    /// Serialise for transmission, enforcing the radio ceiling
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let bytes = serde_json::to_vec(self).map_err(|_| FrameError::Malformed)?;
        if bytes.len() > MAX_LORA_PAYLOAD {
            return Err(FrameError::TooLong(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parse and validate a received frame
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let frame: Frame = serde_json::from_slice(bytes).map_err(|_| FrameError::Malformed)?;
        frame.validate()?;
        Ok(frame)
    }

    /// Check the per-type required keys and chunk invariants
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.schema != SCHEMA_VERSION {
            return Err(FrameError::UnsupportedSchema);
        }
        if self.unit_id.is_empty() || self.unit_id.len() > MAX_UNIT_ID_LEN {
            return Err(FrameError::InvalidUnitId);
        }

        match self.kind {
            FrameType::Telemetry => {
                let idx = self.chunk_idx.ok_or(FrameError::MissingField("chunk_idx"))?;
                let chunks = self.chunks.ok_or(FrameError::MissingField("chunks"))?;
                if self.data.is_none() {
                    return Err(FrameError::MissingField("data"));
                }
                if chunks == 0 || idx >= chunks {
                    return Err(FrameError::InvalidChunk);
                }
            }
            FrameType::ChunkAck => {
                self.chunk_idx.ok_or(FrameError::MissingField("chunk_idx"))?;
                self.result.as_ref().ok_or(FrameError::MissingField("result"))?;
            }
            FrameType::Ack | FrameType::AckCmd => {
                self.result.as_ref().ok_or(FrameError::MissingField("result"))?;
            }
            FrameType::Cmd => {
                self.cmd.as_ref().ok_or(FrameError::MissingField("cmd"))?;
            }
        }
        Ok(())
    }
}
