//! Duplicate suppression for packets delivered by more than one transport.
//!
//! The same physical packet routinely arrives over both the broker and the
//! multicast group. Entries are keyed by `(from << 32) | packet_id` and expire
//! after a fixed TTL; expired entries are swept by the client's maintenance task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::meshid::NodeId;

pub struct DeduplicationFilter {
    seen: DashMap<u64, Instant>,
    ttl: Duration,
}

impl DeduplicationFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    fn key(from: NodeId, packet_id: u32) -> u64 {
        ((from.0 as u64) << 32) | packet_id as u64
    }

    /// Check if a packet was already seen and record it.
    /// Returns true for duplicates. Packet ID 0 is never tracked.
    pub fn check_and_insert(&self, from: NodeId, packet_id: u32) -> bool {
        if packet_id == 0 {
            return false;
        }
        let now = Instant::now();
        // The entry guard holds the shard lock, so two transports racing on the
        // same key cannot both observe "not seen"
        match self.seen.entry(Self::key(from, packet_id)) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) < self.ttl {
                    true
                } else {
                    e.insert(now);
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                false
            }
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
