//! Persisted record of failure-driven resets

use crate::storage::{Storage, StorageError};
use alloc::string::String;
use serde::{Deserialize, Serialize};

const RESET_KEY: &str = "sys/reset";
const MAX_REASON_LEN: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRecord {
    pub reboot_count: u32,
    pub last_error: String,
}

impl ResetRecord {
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Option<Self>, StorageError> {
        match storage.read(RESET_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|_| StorageError::Corrupt),
            None => Ok(None),
        }
    }

    /// Bump the reboot count and store `reason` as the last error
    pub fn record<S: Storage + ?Sized>(storage: &mut S, reason: &str) -> Result<Self, StorageError> {
        // A corrupt record is replaced rather than blocking the reset
        let mut record = Self::load(storage).ok().flatten().unwrap_or_default();
        record.reboot_count = record.reboot_count.saturating_add(1);
        record.last_error = truncate(reason, MAX_REASON_LEN);

        let bytes = serde_json::to_vec(&record).map_err(|_| StorageError::Corrupt)?;
        storage.write(RESET_KEY, &bytes)?;
        Ok(record)
    }
}

fn truncate(text: &str, max: usize) -> String {
    let mut end = text.len().min(max);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_count_survives_reboots() {
        let mut storage = MemoryStorage::new();
        assert_eq!(ResetRecord::load(&mut storage), Ok(None));

        ResetRecord::record(&mut storage, "radio init failed").unwrap();
        let record = ResetRecord::record(&mut storage, "receive failed").unwrap();

        assert_eq!(record.reboot_count, 2);
        assert_eq!(ResetRecord::load(&mut storage), Ok(Some(record)));
    }

    #[test]
    fn test_corrupt_record_is_replaced() {
        let mut storage = MemoryStorage::new();
        storage.write(RESET_KEY, b"{not json").unwrap();

        assert_eq!(ResetRecord::load(&mut storage), Err(StorageError::Corrupt));
        let record = ResetRecord::record(&mut storage, &"x".repeat(100)).unwrap();
        assert_eq!(record.reboot_count, 1);
        assert_eq!(record.last_error.len(), MAX_REASON_LEN);
    }
}
