//! Replay protection counters
//!
//! Receivers keep the last accepted counter per sender and reject anything
//! not strictly greater. Senders draw from a counter that must never go
//! backwards, even across a reboot; it is persisted in reserved blocks so the
//! flash sees one write per [`TX_RESERVE`] frames instead of one per frame.
//!
//! Both tables live in two-copy records. The peer table is a single JSON
//! object so it costs the same two slots however many remotes report.

use super::SecurityError;
use crate::storage::{decode_u64, RedundantRecord, Storage, StorageError};
use alloc::collections::BTreeMap;
use alloc::string::String;

const PEERS_KEY: &str = "ctr/peers";
const TX_KEY: &str = "ctr/tx";

/// Counter values reserved per persisted write
pub const TX_RESERVE: u32 = 64;

/// Last accepted counter for every known peer
#[derive(Debug, Clone)]
pub struct PeerCounters {
    last: BTreeMap<String, u32>,
    record: RedundantRecord,
}

impl Default for PeerCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerCounters {
    pub fn new() -> Self {
        Self {
            last: BTreeMap::new(),
            record: RedundantRecord::new(PEERS_KEY),
        }
    }

    /// Restore the table persisted by [`PeerCounters::accept`]
    ///
    /// A table restored from its older copy may miss the last accepted
    /// counter of one peer; that frame could be accepted once more.
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, StorageError> {
        let (record, stored) = RedundantRecord::load(storage, PEERS_KEY, |bytes| {
            serde_json::from_slice::<BTreeMap<String, u32>>(bytes).ok()
        })?;
        let last = match stored {
            Some(recovered) => {
                if recovered.degraded {
                    log::warn!("security: peer counters restored from spare copy");
                }
                recovered.value
            }
            None => BTreeMap::new(),
        };
        Ok(Self { last, record })
    }

    /// Last counter accepted from `unit_id`
    pub fn last(&self, unit_id: &str) -> Option<u32> {
        self.last.get(unit_id).copied()
    }

    /// Reject `ctr` unless it is strictly greater than the last accepted one
    pub fn check(&self, unit_id: &str, ctr: u32) -> Result<(), SecurityError> {
        match self.last(unit_id) {
            Some(last) if ctr <= last => Err(SecurityError::Replay),
            _ => Ok(()),
        }
    }

    /// Record `ctr` as accepted and persist the table
    pub fn accept<S: Storage + ?Sized>(
        &mut self,
        unit_id: &str,
        ctr: u32,
        storage: &mut S,
    ) -> Result<(), SecurityError> {
        self.check(unit_id, ctr)?;
        let previous = self.last.insert(String::from(unit_id), ctr);
        let persisted = serde_json::to_vec(&self.last)
            .map_err(|_| StorageError::Corrupt)
            .and_then(|bytes| self.record.store(storage, &bytes));
        if let Err(e) = persisted {
            match previous {
                Some(prev) => self.last.insert(String::from(unit_id), prev),
                None => self.last.remove(unit_id),
            };
            return Err(SecurityError::Storage(e));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Monotonic transmit counter
#[derive(Debug, Clone)]
pub struct TxCounter {
    next: u32,
    reserved: u32,
    record: RedundantRecord,
}

impl TxCounter {
    /// Resume after the last reserved block; starts at 1 on a fresh device
    ///
    /// When only the older copy survived, the lost write reserved at most
    /// one more block, so counting resumes past it.
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, StorageError> {
        let (record, stored) = RedundantRecord::load(storage, TX_KEY, decode_u64)?;
        let reserved = match stored {
            Some(recovered) if recovered.degraded => {
                let resumed = (recovered.value as u32).saturating_add(TX_RESERVE);
                log::warn!("security: tx counter resumes at {}", resumed);
                resumed
            }
            Some(recovered) => recovered.value as u32,
            None => 0,
        };
        Ok(Self {
            next: reserved.max(1),
            reserved,
            record,
        })
    }

    /// Draw the next counter value
    pub fn next<S: Storage + ?Sized>(&mut self, storage: &mut S) -> Result<u32, SecurityError> {
        if self.next == u32::MAX {
            return Err(SecurityError::CounterExhausted);
        }
        if self.next >= self.reserved {
            let reserved = self.next.saturating_add(TX_RESERVE);
            self.record
                .store(storage, &(reserved as u64).to_le_bytes())
                .map_err(SecurityError::Storage)?;
            self.reserved = reserved;
        }
        let ctr = self.next;
        self.next += 1;
        Ok(ctr)
    }

    /// Value the next call to [`TxCounter::next`] returns
    pub fn peek(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use proptest::prelude::*;

    #[test]
    fn test_first_frame_from_new_peer_accepted() {
        let counters = PeerCounters::new();
        assert_eq!(counters.check("r1", 1), Ok(()));
    }

    #[test]
    fn test_five_then_three_then_six() {
        let mut storage = MemoryStorage::new();
        let mut counters = PeerCounters::new();

        counters.accept("r1", 5, &mut storage).unwrap();
        assert_eq!(counters.accept("r1", 3, &mut storage), Err(SecurityError::Replay));
        assert_eq!(counters.accept("r1", 5, &mut storage), Err(SecurityError::Replay));
        counters.accept("r1", 6, &mut storage).unwrap();

        // Counters are per peer
        counters.accept("r2", 3, &mut storage).unwrap();
        assert_eq!(counters.last("r1"), Some(6));
    }

    #[test]
    fn test_peer_counters_survive_reload() {
        let mut storage = MemoryStorage::new();
        let mut counters = PeerCounters::new();
        counters.accept("r1", 41, &mut storage).unwrap();
        counters.accept("base", 7, &mut storage).unwrap();

        let reloaded = PeerCounters::load(&mut storage).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.check("r1", 41), Err(SecurityError::Replay));
        assert_eq!(reloaded.check("r1", 42), Ok(()));
    }

    #[test]
    fn test_tx_counter_monotonic_across_reboot() {
        let mut storage = MemoryStorage::new();
        let mut tx = TxCounter::load(&mut storage).unwrap();
        let a = tx.next(&mut storage).unwrap();
        let b = tx.next(&mut storage).unwrap();
        assert_eq!((a, b), (1, 2));

        // Reboot without using the whole reserved block
        let mut tx = TxCounter::load(&mut storage).unwrap();
        let c = tx.next(&mut storage).unwrap();
        assert!(c > b);
        assert_eq!(c, 1 + TX_RESERVE);
    }

    #[test]
    fn test_tx_counter_writes_once_per_block() {
        let mut storage = MemoryStorage::new();
        let mut tx = TxCounter::load(&mut storage).unwrap();
        for _ in 0..TX_RESERVE - 1 {
            tx.next(&mut storage).unwrap();
        }
        assert_eq!(storage.keys(TX_KEY).unwrap(), vec!["ctr/tx/b"]);
        let (_, stored) = RedundantRecord::load(&mut storage, TX_KEY, decode_u64).unwrap();
        assert_eq!(stored.unwrap().value, (1 + TX_RESERVE) as u64);
    }

    #[test]
    fn test_peer_table_is_one_record() {
        let mut storage = MemoryStorage::new();
        let mut counters = PeerCounters::new();
        for n in 0..40u32 {
            counters.accept(&format!("r{}", n), n + 1, &mut storage).unwrap();
        }

        assert_eq!(storage.len(), 2);
        let reloaded = PeerCounters::load(&mut storage).unwrap();
        assert_eq!(reloaded.len(), 40);
        assert_eq!(reloaded.last("r39"), Some(40));
    }

    #[test]
    fn test_damaged_tx_copy_never_reuses_a_counter() {
        let mut storage = MemoryStorage::new();
        let mut tx = TxCounter::load(&mut storage).unwrap();
        let mut issued = 0;
        // Two reserved blocks: copies b then a
        for _ in 0..TX_RESERVE + 1 {
            issued = tx.next(&mut storage).unwrap();
        }

        // Newest copy half written when power failed
        storage.write("ctr/tx/a", &[2, 0, 0]).unwrap();

        let mut tx = TxCounter::load(&mut storage).unwrap();
        let resumed = tx.next(&mut storage).unwrap();
        assert!(resumed > issued);

        // Both copies are intact again afterwards
        let mut tx = TxCounter::load(&mut storage).unwrap();
        assert!(tx.next(&mut storage).unwrap() > resumed);
    }

    #[test]
    fn test_damaged_peer_copy_recovers_older_table() {
        let mut storage = MemoryStorage::new();
        let mut counters = PeerCounters::new();
        counters.accept("r1", 10, &mut storage).unwrap();
        counters.accept("r1", 11, &mut storage).unwrap();

        storage.write("ctr/peers/a", b"\x02\x00\x00\x00{\"r1\":").unwrap();

        let reloaded = PeerCounters::load(&mut storage).unwrap();
        assert_eq!(reloaded.last("r1"), Some(10));
        assert_eq!(reloaded.check("r1", 10), Err(SecurityError::Replay));
    }

    proptest! {
        #[test]
        fn prop_stale_counters_rejected(accepted in 1u32..u32::MAX, older in any::<u32>()) {
            let mut storage = MemoryStorage::new();
            let mut counters = PeerCounters::new();
            counters.accept("r1", accepted, &mut storage).unwrap();

            let stale = older % (accepted + 1);
            prop_assert_eq!(counters.check("r1", stale), Err(SecurityError::Replay));
        }
    }
}
