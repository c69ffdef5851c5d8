//! Rotating archive of reassembled messages
//!
//! Every completed message is written under `asm/<seq>` with a zero-padded
//! sequence number so lexical key order is arrival order. Only the newest
//! `keep_n` records are kept.
//!
//! Records are binary so a payload costs its own size on flash:
//!
//! ```text
//! [version: u8][unit_len: u8][unit_id][mid: u64 LE][received_ms: u64 LE][payload]
//! ```

use crate::storage::{Storage, StorageError};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

const PREFIX: &str = "asm/";
const VERSION: u8 = 1;

/// One archived message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedMessage {
    pub unit_id: String,
    pub mid: u64,
    pub payload: Vec<u8>,
    pub received_ms: u64,
}

impl ArchivedMessage {
    pub fn new(unit_id: &str, mid: u64, payload: &[u8], received_ms: u64) -> Self {
        Self {
            unit_id: String::from(unit_id),
            mid,
            payload: payload.to_vec(),
            received_ms,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let unit_len = u8::try_from(self.unit_id.len()).map_err(|_| StorageError::TooLarge)?;
        let mut bytes = Vec::with_capacity(18 + self.unit_id.len() + self.payload.len());
        bytes.push(VERSION);
        bytes.push(unit_len);
        bytes.extend_from_slice(self.unit_id.as_bytes());
        bytes.extend_from_slice(&self.mid.to_le_bytes());
        bytes.extend_from_slice(&self.received_ms.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let (&version, rest) = bytes.split_first()?;
        if version != VERSION {
            return None;
        }
        let (&unit_len, rest) = rest.split_first()?;
        let unit_len = unit_len as usize;
        if rest.len() < unit_len + 16 {
            return None;
        }
        let (unit_id, rest) = rest.split_at(unit_len);
        let (mid, rest) = rest.split_at(8);
        let (received_ms, payload) = rest.split_at(8);
        Some(Self {
            unit_id: String::from(core::str::from_utf8(unit_id).ok()?),
            mid: u64::from_le_bytes(mid.try_into().ok()?),
            payload: payload.to_vec(),
            received_ms: u64::from_le_bytes(received_ms.try_into().ok()?),
        })
    }
}

fn key(seq: u32) -> String {
    format!("{}{:08}", PREFIX, seq)
}

fn seq_of(key: &str) -> Option<u32> {
    key.strip_prefix(PREFIX)?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct Archive {
    next_seq: u32,
    keep_n: usize,
}

impl Archive {
    /// Continue numbering after the newest stored record
    pub fn load<S: Storage + ?Sized>(storage: &mut S, keep_n: usize) -> Result<Self, StorageError> {
        let next_seq = storage
            .keys(PREFIX)?
            .iter()
            .filter_map(|k| seq_of(k))
            .max()
            .map_or(0, |seq| seq.wrapping_add(1));
        Ok(Self { next_seq, keep_n })
    }

    /// Store `record` and drop anything older than the newest `keep_n`
    pub fn store<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        record: &ArchivedMessage,
    ) -> Result<(), StorageError> {
        storage.write(&key(self.next_seq), &record.encode()?)?;
        self.next_seq = self.next_seq.wrapping_add(1);

        let keys = storage.keys(PREFIX)?;
        if keys.len() > self.keep_n {
            for old in &keys[..keys.len() - self.keep_n] {
                log::trace!("archive: rotating out {}", old);
                storage.remove(old)?;
            }
        }
        Ok(())
    }

    /// Stored records, oldest first
    pub fn records<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
    ) -> Result<Vec<ArchivedMessage>, StorageError> {
        let mut records = Vec::new();
        for k in storage.keys(PREFIX)? {
            if let Some(bytes) = storage.read(&k)? {
                records.push(ArchivedMessage::decode(&bytes).ok_or(StorageError::Corrupt)?);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::storage::FLASH_END;
    use crate::config::transfer::KEEP_N;
    use crate::storage::slots::mock::MemFlash;
    use crate::storage::{MemoryStorage, SlotStorage};

    #[test]
    fn test_keeps_newest_n() {
        let mut storage = MemoryStorage::new();
        let mut archive = Archive::load(&mut storage, 3).unwrap();
        for mid in 1..=5u64 {
            archive
                .store(&mut storage, &ArchivedMessage::new("r1", mid, b"x", mid * 10))
                .unwrap();
        }

        let mids: Vec<u64> = archive
            .records(&mut storage)
            .unwrap()
            .iter()
            .map(|r| r.mid)
            .collect();
        assert_eq!(mids, vec![3, 4, 5]);
    }

    #[test]
    fn test_numbering_resumes_after_reload() {
        let mut storage = MemoryStorage::new();
        let mut archive = Archive::load(&mut storage, 5).unwrap();
        archive
            .store(&mut storage, &ArchivedMessage::new("r1", 1, b"a", 0))
            .unwrap();

        let mut archive = Archive::load(&mut storage, 5).unwrap();
        archive
            .store(&mut storage, &ArchivedMessage::new("r1", 2, b"b", 0))
            .unwrap();

        let records = archive.records(&mut storage).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, b"b");
        assert_eq!(storage.keys("asm/").unwrap(), vec!["asm/00000000", "asm/00000001"]);
    }

    #[test]
    fn test_large_message_fits_one_flash_slot() {
        let mut storage = SlotStorage::with_default_layout(MemFlash::new(FLASH_END as usize));
        let mut archive = Archive::load(&mut storage, KEEP_N).unwrap();
        let payload: Vec<u8> = (0..1500u32).map(|n| (n % 251) as u8).collect();

        archive
            .store(&mut storage, &ArchivedMessage::new("r1", 42, &payload, 9_000))
            .unwrap();

        let records = archive.records(&mut storage).unwrap();
        assert_eq!(records, vec![ArchivedMessage::new("r1", 42, &payload, 9_000)]);
    }

    #[test]
    fn test_unreadable_record_reported() {
        let mut storage = MemoryStorage::new();
        let archive = Archive::load(&mut storage, 5).unwrap();
        storage.write("asm/00000000", &[VERSION, 9, b'r']).unwrap();

        assert_eq!(archive.records(&mut storage), Err(StorageError::Corrupt));
    }
}
