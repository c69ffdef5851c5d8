//! Persistent key/value storage
//!
//! The protocol persists a handful of small records: replay counters, the
//! message-id high-water mark, archived assemblies and the reset record.
//! Keys are short `/`-separated strings, values are opaque bytes.

pub mod redundant;
pub mod slots;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

pub use redundant::{Recovered, RedundantRecord};
pub use slots::SlotStorage;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying device reported a failure
    Io,
    /// No free slot for a new key
    Full,
    /// Key or value exceeds the slot layout
    TooLarge,
    /// Stored record failed its integrity check
    Corrupt,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StorageError::Io => "storage i/o error",
            StorageError::Full => "storage full",
            StorageError::TooLarge => "record too large",
            StorageError::Corrupt => "corrupt record",
        };
        f.write_str(text)
    }
}

/// Key/value store surviving reboots
pub trait Storage {
    /// Value stored under `key`, if any
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or replace `key`
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete `key`; deleting a missing key is not an error
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in ascending order
    fn keys(&mut self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Parse a little-endian `u64` value
pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_le_bytes)
}

/// Volatile storage
///
/// Used by tests and by boards without a flash partition; contents are lost
/// on power cycle.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(String::from(key), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&mut self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).read(key)
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        (**self).write(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }

    fn keys(&mut self, prefix: &str) -> Result<Vec<String>, StorageError> {
        (**self).keys(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_prefix_listing() {
        let mut storage = MemoryStorage::new();
        storage.write("key/r2", &[2]).unwrap();
        storage.write("key/r1", &[1]).unwrap();
        storage.write("ctr/tx/a", &[0]).unwrap();

        assert_eq!(
            storage.keys("key/").unwrap(),
            vec![String::from("key/r1"), String::from("key/r2")]
        );
    }

    #[test]
    fn test_decode_u64() {
        assert_eq!(decode_u64(&1_730_000_000_123u64.to_le_bytes()), Some(1_730_000_000_123));
        assert_eq!(decode_u64(&[1, 2, 3]), None);
    }
}
