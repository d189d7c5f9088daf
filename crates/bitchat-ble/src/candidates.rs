//! Candidate cache for the central role.
//!
//! Tracks every device seen advertising the chat service: its address, last
//! RSSI (0 when the stack did not report one), and when it was last seen.
//! Entries are refreshed by scan hits and the periodic cold scan, and evicted
//! once they go stale.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bluer::Address;

/// Entries older than this are evicted.
pub const CANDIDATE_TTL: Duration = Duration::from_secs(120);

/// One discovered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub addr: Address,
    pub rssi: i16,
    pub last_seen: Instant,
}

/// Address-keyed candidate map with TTL eviction.
#[derive(Debug, Default)]
pub struct CandidateCache {
    map: HashMap<Address, Candidate>,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a candidate. A missing RSSI keeps the previous
    /// reading, or 0 for a brand-new entry.
    pub fn upsert(&mut self, addr: Address, rssi: Option<i16>, now: Instant) {
        let entry = self.map.entry(addr).or_insert(Candidate {
            addr,
            rssi: 0,
            last_seen: now,
        });
        if let Some(rssi) = rssi {
            entry.rssi = rssi;
        }
        entry.last_seen = now;
    }

    /// Drop entries not seen within [`CANDIDATE_TTL`].
    pub fn evict_stale(&mut self, now: Instant) {
        self.map
            .retain(|_, c| now.duration_since(c.last_seen) <= CANDIDATE_TTL);
    }

    /// Candidates ordered by descending RSSI.
    pub fn sorted(&self) -> Vec<Candidate> {
        let mut list: Vec<Candidate> = self.map.values().copied().collect();
        list.sort_by(|a, b| b.rssi.cmp(&a.rssi).then(a.addr.cmp(&b.addr)));
        list
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
