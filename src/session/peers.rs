//! Remotes heard by a base station

use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub unit_id: String,
    pub last_seen_ms: u64,
    pub last_rssi: i16,
    /// Messages fully received
    pub messages: u32,
    /// Result of the last command this remote ran
    pub last_result: Option<String>,
}

/// Bounded peer table; the least recently heard remote makes room
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: Vec<PeerInfo>,
    capacity: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an authenticated frame from `unit_id`
    pub fn seen(&mut self, unit_id: &str, now_ms: u64, rssi: i16, completed: bool) {
        let peer = match self.peers.iter().position(|p| p.unit_id == unit_id) {
            Some(i) => &mut self.peers[i],
            None => {
                if self.peers.len() >= self.capacity {
                    self.evict_oldest();
                }
                log::info!("session: new peer {}", unit_id);
                self.peers.push(PeerInfo {
                    unit_id: String::from(unit_id),
                    last_seen_ms: now_ms,
                    last_rssi: rssi,
                    messages: 0,
                    last_result: None,
                });
                let last = self.peers.len() - 1;
                &mut self.peers[last]
            }
        };
        peer.last_seen_ms = now_ms;
        peer.last_rssi = rssi;
        if completed {
            peer.messages = peer.messages.saturating_add(1);
        }
    }

    pub fn record_result(&mut self, unit_id: &str, result: &str) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.unit_id == unit_id) {
            peer.last_result = Some(String::from(result));
        }
    }

    pub fn get(&self, unit_id: &str) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.unit_id == unit_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .peers
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.last_seen_ms)
            .map(|(i, _)| i);
        if let Some(i) = oldest {
            let peer = self.peers.swap_remove(i);
            log::info!("session: peer table full, forgetting {}", peer.unit_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_contacts() {
        let mut peers = PeerTable::new(4);
        peers.seen("r1", 100, -80, false);
        peers.seen("r1", 200, -75, true);
        peers.record_result("r1", "ok");
        peers.record_result("r9", "ok");

        let r1 = peers.get("r1").unwrap();
        assert_eq!(r1.last_seen_ms, 200);
        assert_eq!(r1.last_rssi, -75);
        assert_eq!(r1.messages, 1);
        assert_eq!(r1.last_result.as_deref(), Some("ok"));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_full_table_forgets_least_recent() {
        let mut peers = PeerTable::new(2);
        peers.seen("r1", 100, -80, false);
        peers.seen("r2", 50, -80, false);
        peers.seen("r3", 300, -80, false);

        assert!(peers.get("r2").is_none());
        assert!(peers.get("r1").is_some());
        assert!(peers.get("r3").is_some());
    }
}
