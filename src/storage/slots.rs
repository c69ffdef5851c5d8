//! Key/value records in fixed flash slots
//!
//! The partition is divided into equal slots. Each slot holds at most one
//! record:
//!
//! ```text
//! [magic: u16 LE][key_len: u8][rsvd: u8][value_len: u16 LE][crc16: u16 LE][key][value]
//! ```
//!
//! Erased flash reads as `0xFF`, so a slot is free unless it starts with
//! [`MAGIC`]. Deleting overwrites the magic with [`TOMBSTONE`]. The CRC
//! (CRC-16-XMODEM) covers key and value.

use super::{Storage, StorageError};
use crate::config::storage::MAX_VALUE_LEN;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use crc::{Crc, CRC_16_XMODEM};
use embedded_storage::{ReadStorage, Storage as FlashStorage};

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const MAGIC: u16 = 0x5AFE;
const TOMBSTONE: u16 = 0x0000;
const HEADER_LEN: usize = 8;
const MAX_KEY_LEN: usize = 32;

struct Header {
    magic: u16,
    key_len: usize,
    value_len: usize,
    crc: u16,
}

impl Header {
    fn parse(raw: &[u8; HEADER_LEN]) -> Self {
        Self {
            magic: u16::from_le_bytes([raw[0], raw[1]]),
            key_len: raw[2] as usize,
            value_len: u16::from_le_bytes([raw[4], raw[5]]) as usize,
            crc: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }
}

/// Slot store over any byte-addressable flash device
pub struct SlotStorage<F> {
    flash: F,
    base: u32,
    slot_size: u32,
    slot_count: u32,
}

impl<F> SlotStorage<F>
where
    F: FlashStorage,
{
    /// Use `slot_count` slots of `slot_size` bytes starting at `base`
    pub fn new(flash: F, base: u32, slot_size: u32, slot_count: u32) -> Self {
        Self {
            flash,
            base,
            slot_size,
            slot_count,
        }
    }

    /// Layout from `config::storage`
    pub fn with_default_layout(flash: F) -> Self {
        use crate::config::storage;
        Self::new(
            flash,
            storage::PARTITION_OFFSET,
            storage::SLOT_SIZE,
            storage::SLOT_COUNT,
        )
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.base + slot * self.slot_size
    }

    fn max_value_len(&self) -> usize {
        (self.slot_size as usize)
            .saturating_sub(HEADER_LEN + MAX_KEY_LEN)
            .min(MAX_VALUE_LEN)
    }

    fn read_header(&mut self, slot: u32) -> Result<Header, StorageError> {
        let mut raw = [0u8; HEADER_LEN];
        self.flash
            .read(self.slot_offset(slot), &mut raw)
            .map_err(|_| StorageError::Io)?;
        Ok(Header::parse(&raw))
    }

    /// Key stored in `slot`, or `None` if the slot is free
    fn slot_key(&mut self, slot: u32) -> Result<Option<String>, StorageError> {
        let header = self.read_header(slot)?;
        if header.magic != MAGIC || header.key_len == 0 || header.key_len > MAX_KEY_LEN {
            return Ok(None);
        }
        let mut key = vec![0u8; header.key_len];
        self.flash
            .read(self.slot_offset(slot) + HEADER_LEN as u32, &mut key)
            .map_err(|_| StorageError::Io)?;
        Ok(String::from_utf8(key).ok())
    }

    fn find(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        for slot in 0..self.slot_count {
            if self.slot_key(slot)?.as_deref() == Some(key) {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn find_free(&mut self) -> Result<Option<u32>, StorageError> {
        for slot in 0..self.slot_count {
            if self.slot_key(slot)?.is_none() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Release the flash device
    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F> Storage for SlotStorage<F>
where
    F: FlashStorage,
{
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(slot) = self.find(key)? else {
            return Ok(None);
        };
        let header = self.read_header(slot)?;
        if header.value_len > self.max_value_len() {
            return Err(StorageError::Corrupt);
        }

        let mut body = vec![0u8; header.key_len + header.value_len];
        self.flash
            .read(self.slot_offset(slot) + HEADER_LEN as u32, &mut body)
            .map_err(|_| StorageError::Io)?;

        if CRC.checksum(&body) != header.crc {
            log::warn!("storage: crc mismatch in slot {} ({})", slot, key);
            return Err(StorageError::Corrupt);
        }
        Ok(Some(body.split_off(header.key_len)))
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN || value.len() > self.max_value_len() {
            return Err(StorageError::TooLarge);
        }
        let slot = match self.find(key)? {
            Some(slot) => slot,
            None => self.find_free()?.ok_or(StorageError::Full)?,
        };

        let mut record = Vec::with_capacity(HEADER_LEN + key.len() + value.len());
        record.extend_from_slice(&MAGIC.to_le_bytes());
        record.push(key.len() as u8);
        record.push(0xFF);
        record.extend_from_slice(&(value.len() as u16).to_le_bytes());
        record.extend_from_slice(&[0, 0]);
        record.extend_from_slice(key.as_bytes());
        record.extend_from_slice(value);
        let crc = CRC.checksum(&record[HEADER_LEN..]);
        record[6..8].copy_from_slice(&crc.to_le_bytes());

        self.flash
            .write(self.slot_offset(slot), &record)
            .map_err(|_| StorageError::Io)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        if let Some(slot) = self.find(key)? {
            self.flash
                .write(self.slot_offset(slot), &TOMBSTONE.to_le_bytes())
                .map_err(|_| StorageError::Io)?;
        }
        Ok(())
    }

    fn keys(&mut self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for slot in 0..self.slot_count {
            if let Some(key) = self.slot_key(slot)? {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
pub mod mock {
    //! RAM-backed flash device for testing

    use embedded_storage::{ReadStorage, Storage};

    /// Flash that starts erased (all `0xFF`)
    pub struct MemFlash {
        pub bytes: std::vec::Vec<u8>,
    }

    impl MemFlash {
        pub fn new(capacity: usize) -> Self {
            Self {
                bytes: std::vec![0xFF; capacity],
            }
        }
    }

    impl ReadStorage for MemFlash {
        type Error = ();

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), ()> {
            let start = offset as usize;
            let src = self.bytes.get(start..start + bytes.len()).ok_or(())?;
            bytes.copy_from_slice(src);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl Storage for MemFlash {
        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), ()> {
            let start = offset as usize;
            let dst = self.bytes.get_mut(start..start + bytes.len()).ok_or(())?;
            dst.copy_from_slice(bytes);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MemFlash;
    use super::*;

    fn store() -> SlotStorage<MemFlash> {
        SlotStorage::new(MemFlash::new(4 * 256), 0, 256, 4)
    }

    #[test]
    fn test_write_read_replace() {
        let mut storage = store();
        storage.write("ctr/tx", &[1, 2, 3, 4]).unwrap();
        assert_eq!(storage.read("ctr/tx").unwrap(), Some(vec![1, 2, 3, 4]));

        storage.write("ctr/tx", &[9]).unwrap();
        assert_eq!(storage.read("ctr/tx").unwrap(), Some(vec![9]));
        assert_eq!(storage.keys("").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_key() {
        let mut storage = store();
        assert_eq!(storage.read("nope").unwrap(), None);
        storage.remove("nope").unwrap();
    }

    #[test]
    fn test_full_and_reuse_after_remove() {
        let mut storage = store();
        for i in 0..4 {
            storage.write(&format!("k{}", i), &[i as u8]).unwrap();
        }
        assert_eq!(storage.write("k4", &[4]), Err(StorageError::Full));

        storage.remove("k1").unwrap();
        storage.write("k4", &[4]).unwrap();
        assert_eq!(
            storage.keys("k").unwrap(),
            vec!["k0".to_string(), "k2".to_string(), "k3".to_string(), "k4".to_string()]
        );
    }

    #[test]
    fn test_corruption_detected() {
        let mut storage = store();
        storage.write("sys/reset", b"hello").unwrap();

        let mut flash = storage.into_inner();
        flash.bytes[HEADER_LEN + "sys/reset".len()] ^= 0x01;
        let mut storage = SlotStorage::new(flash, 0, 256, 4);

        assert_eq!(storage.read("sys/reset"), Err(StorageError::Corrupt));
    }

    #[test]
    fn test_records_survive_reopen() {
        let mut storage = store();
        storage.write("ctr/tx/a", &5u64.to_le_bytes()).unwrap();

        let mut reopened = SlotStorage::new(storage.into_inner(), 0, 256, 4);
        let value = reopened.read("ctr/tx/a").unwrap().unwrap();
        assert_eq!(super::super::decode_u64(&value), Some(5));
    }

    #[test]
    fn test_value_too_large() {
        let mut storage = store();
        assert_eq!(storage.write("big", &[0u8; 250]), Err(StorageError::TooLarge));
    }
}
