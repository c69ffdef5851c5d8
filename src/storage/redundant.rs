//! Records kept as two alternating copies
//!
//! Counters must survive a write that is cut short by a reset. Each update
//! goes to `<key>/a` or `<key>/b` in turn, prefixed with a little-endian
//! `u32` generation, so the copy not being written always holds the previous
//! value. Loading picks the newest copy that passes its integrity check.

use super::{Storage, StorageError};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

const GEN_LEN: usize = 4;
const COPIES: [&str; 2] = ["a", "b"];

/// Value restored by [`RedundantRecord::load`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered<T> {
    pub value: T,
    /// A copy was damaged; `value` may be one write behind
    pub degraded: bool,
}

/// Write side of a two-copy record
#[derive(Debug, Clone)]
pub struct RedundantRecord {
    key: &'static str,
    generation: u32,
}

fn copy_key(key: &str, copy: &str) -> String {
    format!("{}/{}", key, copy)
}

fn read_copy<S: Storage + ?Sized>(
    storage: &mut S,
    key: &str,
) -> Result<Option<(u32, Vec<u8>)>, StorageError> {
    let Some(mut bytes) = storage.read(key)? else {
        return Ok(None);
    };
    if bytes.len() < GEN_LEN {
        return Err(StorageError::Corrupt);
    }
    let value = bytes.split_off(GEN_LEN);
    let generation = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok(Some((generation, value)))
}

impl RedundantRecord {
    /// Record that has never been written
    pub fn new(key: &'static str) -> Self {
        Self { key, generation: 0 }
    }

    /// Restore the newest intact copy
    ///
    /// `parse` rejects a copy whose value is malformed. Fails with
    /// [`StorageError::Corrupt`] only when copies exist and none is usable.
    pub fn load<S, T, P>(
        storage: &mut S,
        key: &'static str,
        parse: P,
    ) -> Result<(Self, Option<Recovered<T>>), StorageError>
    where
        S: Storage + ?Sized,
        P: Fn(&[u8]) -> Option<T>,
    {
        let mut record = Self::new(key);
        let mut newest: Option<(u32, T)> = None;
        let mut degraded = false;

        for copy in COPIES {
            match read_copy(storage, &copy_key(key, copy)) {
                Ok(Some((generation, bytes))) => {
                    record.generation = record.generation.max(generation);
                    match parse(&bytes) {
                        Some(value) if newest.as_ref().map_or(true, |(g, _)| generation > *g) => {
                            newest = Some((generation, value));
                        }
                        Some(_) => {}
                        None => degraded = true,
                    }
                }
                Ok(None) => {}
                Err(StorageError::Corrupt) => degraded = true,
                Err(e) => return Err(e),
            }
        }

        match newest {
            Some((generation, value)) => {
                if degraded {
                    log::warn!("storage: {} restored from generation {}", key, generation);
                }
                Ok((record, Some(Recovered { value, degraded })))
            }
            None if degraded => {
                log::error!("storage: no intact copy of {}", key);
                Err(StorageError::Corrupt)
            }
            None => Ok((record, None)),
        }
    }

    /// Write `value` over the older copy
    pub fn store<S: Storage + ?Sized>(&mut self, storage: &mut S, value: &[u8]) -> Result<(), StorageError> {
        let generation = self.generation.wrapping_add(1);
        let mut bytes = Vec::with_capacity(GEN_LEN + value.len());
        bytes.extend_from_slice(&generation.to_le_bytes());
        bytes.extend_from_slice(value);

        let copy = COPIES[(generation % 2) as usize];
        storage.write(&copy_key(self.key, copy), &bytes)?;
        self.generation = generation;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{decode_u64, MemoryStorage};
    use super::*;

    fn load(storage: &mut MemoryStorage) -> Result<(RedundantRecord, Option<Recovered<u64>>), StorageError> {
        RedundantRecord::load(storage, "ctr/tx", decode_u64)
    }

    #[test]
    fn test_alternates_copies() {
        let mut storage = MemoryStorage::new();
        let (mut record, value) = load(&mut storage).unwrap();
        assert_eq!(value, None);

        for n in 1..=3u64 {
            record.store(&mut storage, &n.to_le_bytes()).unwrap();
        }

        assert_eq!(storage.keys("ctr/tx").unwrap(), vec!["ctr/tx/a", "ctr/tx/b"]);
        let (_, value) = load(&mut storage).unwrap();
        assert_eq!(value, Some(Recovered { value: 3, degraded: false }));
    }

    #[test]
    fn test_torn_write_keeps_previous_value() {
        let mut storage = MemoryStorage::new();
        let (mut record, _) = load(&mut storage).unwrap();
        record.store(&mut storage, &64u64.to_le_bytes()).unwrap();
        record.store(&mut storage, &128u64.to_le_bytes()).unwrap();

        // Generation 2 went to copy `a`; cut it short
        storage.write("ctr/tx/a", &[2, 0]).unwrap();

        let (mut record, value) = load(&mut storage).unwrap();
        assert_eq!(value, Some(Recovered { value: 64, degraded: true }));

        // The next write replaces the damaged copy, not the good one
        record.store(&mut storage, &192u64.to_le_bytes()).unwrap();
        let (_, value) = load(&mut storage).unwrap();
        assert_eq!(value, Some(Recovered { value: 192, degraded: false }));
    }

    #[test]
    fn test_malformed_value_falls_back() {
        let mut storage = MemoryStorage::new();
        let (mut record, _) = load(&mut storage).unwrap();
        record.store(&mut storage, &7u64.to_le_bytes()).unwrap();
        record.store(&mut storage, b"xyz").unwrap();

        let (_, value) = load(&mut storage).unwrap();
        assert_eq!(value, Some(Recovered { value: 7, degraded: true }));
    }

    #[test]
    fn test_both_copies_damaged() {
        let mut storage = MemoryStorage::new();
        storage.write("ctr/tx/a", &[1]).unwrap();
        storage.write("ctr/tx/b", &[1, 0, 0, 0, 9]).unwrap();

        assert_eq!(load(&mut storage).err(), Some(StorageError::Corrupt));
    }
}
