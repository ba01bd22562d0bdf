//! Packet-ID allocation.
//!
//! Mirrors the firmware scheme: the low bits come from a rolling counter so
//! IDs stay locally monotonic, the high bits are re-randomized on every
//! allocation so IDs do not collide across restarts.

use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::constants::packet_id::{COUNTER_BITS, COUNTER_MASK};

pub struct PacketIdGenerator {
    counter: AtomicU32,
}

impl PacketIdGenerator {
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            counter: AtomicU32::new(seed),
        }
    }

    /// Allocate the next packet ID. Never returns 0.
    pub fn next_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let high: u32 = rng.gen::<u32>() >> COUNTER_BITS;
            let id = (counter & COUNTER_MASK) | (high << COUNTER_BITS);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_consecutive_ids_differ() {
        let gen = PacketIdGenerator::new();
        let mut prev = gen.next_id();
        for _ in 0..10_000 {
            let next = gen.next_id();
            assert_ne!(prev, next);
            prev = next;
        }
    }

    #[test]
    fn test_low_bits_follow_counter() {
        let gen = PacketIdGenerator::with_seed(41);
        assert_eq!(gen.next_id() & COUNTER_MASK, 42);
        assert_eq!(gen.next_id() & COUNTER_MASK, 43);
    }

    #[test]
    fn test_counter_wraps_within_mask() {
        let gen = PacketIdGenerator::with_seed(COUNTER_MASK - 1);
        assert_eq!(gen.next_id() & COUNTER_MASK, COUNTER_MASK);
        assert_eq!(gen.next_id() & COUNTER_MASK, 0);
    }

    #[test]
    fn test_never_zero() {
        // Counter low bits hit 0 every 1024 allocations
        let gen = PacketIdGenerator::with_seed(u32::MAX);
        let ids: HashSet<u32> = (0..4096).map(|_| gen.next_id()).collect();
        assert!(!ids.contains(&0));
    }
}
