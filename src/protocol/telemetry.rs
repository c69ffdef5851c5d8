//! Telemetry payload carried by a remote's periodic report

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// One sensor sample
///
/// Sensors a board does not fit are left out of the serialised object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub uptime_ms: u64,
    /// Consecutive report number since boot
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_hpa: Option<f32>,
    /// Noise floor seen by the radio just before the report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<i16>,
}

impl Reading {
    pub fn to_json(&self) -> Vec<u8> {
        // Plain numbers and options cannot fail to serialise
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_sensors_are_omitted() {
        let reading = Reading {
            uptime_ms: 61_000,
            seq: 2,
            temperature_c: Some(21.5),
            ..Default::default()
        };
        let json = String::from_utf8(reading.to_json()).unwrap();

        assert_eq!(json, r#"{"uptime_ms":61000,"seq":2,"temperature_c":21.5}"#);
        assert_eq!(Reading::from_json(json.as_bytes()), Some(reading));
    }
}
