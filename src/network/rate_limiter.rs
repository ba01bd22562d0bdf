//! Anti-flood throttles for automatic responses and traceroutes.
//!
//! The mesh firmware enforces its own cooldowns; sending faster than it
//! accepts only burns airtime, so we apply the same limits locally.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::events::PendingTraceroute;
use crate::meshid::NodeId;

/// Gates automatic telemetry and neighbor-info responses per managed node
pub struct RequestThrottle {
    period: Duration,
    last_telemetry: Mutex<HashMap<NodeId, Instant>>,
    last_neighbor: Mutex<HashMap<NodeId, Instant>>,
}

impl RequestThrottle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_telemetry: Mutex::new(HashMap::new()),
            last_neighbor: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, map: &Mutex<HashMap<NodeId, Instant>>, node: NodeId) -> bool {
        let mut map = map.lock();
        let now = Instant::now();
        if let Some(last) = map.get(&node) {
            if now.duration_since(*last) < self.period {
                return false;
            }
        }
        map.insert(node, now);
        true
    }

    /// Returns true (and starts a new cooldown) if `node` may answer a telemetry request
    pub fn can_respond_telemetry(&self, node: NodeId) -> bool {
        self.check(&self.last_telemetry, node)
    }

    /// Returns true (and starts a new cooldown) if `node` may answer a neighbor-info request
    pub fn can_respond_neighbor(&self, node: NodeId) -> bool {
        self.check(&self.last_neighbor, node)
    }

    /// Forget nodes whose cooldown has elapsed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for map in [&self.last_telemetry, &self.last_neighbor] {
            let mut map = map.lock();
            let before = map.len();
            map.retain(|_, last| now.duration_since(*last) < self.period);
            removed += before - map.len();
        }
        removed
    }
}

/// Traceroute cooldown per (source, destination) and pending-request tracking
pub struct TracerouteTracker {
    cooldown: Duration,
    response_timeout: Duration,
    last_sent: Mutex<HashMap<(NodeId, NodeId), Instant>>,
    pending: Mutex<HashMap<u32, PendingTraceroute>>,
}

impl TracerouteTracker {
    pub fn new(cooldown: Duration, response_timeout: Duration) -> Self {
        Self {
            cooldown,
            response_timeout,
            last_sent: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining cooldown for this pair, if any
    pub fn remaining_cooldown(&self, from: NodeId, to: NodeId) -> Option<Duration> {
        let last_sent = self.last_sent.lock();
        let elapsed = last_sent.get(&(from, to))?.elapsed();
        self.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Claim the send slot for this pair, or return how long to wait
    pub fn try_acquire(&self, from: NodeId, to: NodeId) -> Result<(), Duration> {
        let mut last_sent = self.last_sent.lock();
        let now = Instant::now();
        if let Some(last) = last_sent.get(&(from, to)) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.cooldown {
                return Err(self.cooldown - elapsed);
            }
        }
        last_sent.insert((from, to), now);
        Ok(())
    }

    /// Give back a slot claimed by `try_acquire` when the send failed
    pub fn release(&self, from: NodeId, to: NodeId) {
        self.last_sent.lock().remove(&(from, to));
    }

    pub fn add_request(&self, packet_id: u32, request: PendingTraceroute) {
        self.pending.lock().insert(packet_id, request);
    }

    /// Remove and return the pending request a response correlates to
    pub fn take_request(&self, packet_id: u32) -> Option<PendingTraceroute> {
        self.pending.lock().remove(&packet_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop unanswered requests past the response timeout and rate records
    /// older than twice the cooldown. Returns (requests, records) removed.
    pub fn cleanup_expired(&self) -> (usize, usize) {
        let now = Instant::now();

        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, req| now.duration_since(req.sent_at) < self.response_timeout);
        let requests = before - pending.len();
        drop(pending);

        let mut last_sent = self.last_sent.lock();
        let before = last_sent.len();
        let max_age = self.cooldown * 2;
        last_sent.retain(|_, sent| now.duration_since(*sent) < max_age);
        let records = before - last_sent.len();

        (requests, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(target: NodeId) -> PendingTraceroute {
        PendingTraceroute {
            from: NodeId(1),
            target,
            channel: "LongFast".into(),
            context: "room".into(),
            sent_at: Instant::now(),
        }
    }

    #[test]
    fn test_throttle_blocks_within_period() {
        let throttle = RequestThrottle::new(Duration::from_secs(180));
        assert!(throttle.can_respond_telemetry(NodeId(5)));
        assert!(!throttle.can_respond_telemetry(NodeId(5)));
        // Independent per node and per request type
        assert!(throttle.can_respond_telemetry(NodeId(6)));
        assert!(throttle.can_respond_neighbor(NodeId(5)));
        assert!(!throttle.can_respond_neighbor(NodeId(5)));
    }

    #[test]
    fn test_throttle_reopens_after_period() {
        let throttle = RequestThrottle::new(Duration::from_millis(20));
        assert!(throttle.can_respond_telemetry(NodeId(5)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(throttle.cleanup_expired(), 1);
        assert!(throttle.can_respond_telemetry(NodeId(5)));
    }

    #[test]
    fn test_traceroute_cooldown() {
        let tracker = TracerouteTracker::new(Duration::from_secs(30), Duration::from_secs(60));
        assert!(tracker.try_acquire(NodeId(1), NodeId(2)).is_ok());
        let wait = tracker.try_acquire(NodeId(1), NodeId(2)).unwrap_err();
        assert!(wait > Duration::from_secs(29) && wait <= Duration::from_secs(30));
        assert!(tracker.remaining_cooldown(NodeId(1), NodeId(2)).is_some());
        // Other pairs are unaffected
        assert!(tracker.try_acquire(NodeId(1), NodeId(3)).is_ok());
        assert!(tracker.remaining_cooldown(NodeId(2), NodeId(1)).is_none());
    }

    #[test]
    fn test_release_reopens_slot() {
        let tracker = TracerouteTracker::new(Duration::from_secs(30), Duration::from_secs(60));
        assert!(tracker.try_acquire(NodeId(1), NodeId(2)).is_ok());
        tracker.release(NodeId(1), NodeId(2));
        assert!(tracker.try_acquire(NodeId(1), NodeId(2)).is_ok());
    }

    #[test]
    fn test_take_request_once() {
        let tracker = TracerouteTracker::new(Duration::from_secs(30), Duration::from_secs(60));
        tracker.add_request(99, pending(NodeId(2)));
        assert_eq!(tracker.take_request(99).unwrap().target, NodeId(2));
        assert!(tracker.take_request(99).is_none());
    }

    #[test]
    fn test_cleanup_drops_stale_state() {
        let tracker =
            TracerouteTracker::new(Duration::from_millis(10), Duration::from_millis(20));
        tracker.add_request(1, pending(NodeId(2)));
        assert!(tracker.try_acquire(NodeId(1), NodeId(2)).is_ok());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(tracker.cleanup_expired(), (1, 1));
        assert_eq!(tracker.pending_count(), 0);
    }
}
