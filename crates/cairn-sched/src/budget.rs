//! Per-client outbound byte budget.
//!
//! The send scheduler bounds how many blocks leave per tick; this tracker
//! bounds how many bytes each client receives per tick so one client with
//! large blocks cannot starve the others.

use std::collections::VecDeque;

use crate::client::ClientId;

/// Ticks of history kept for [`ClientBandwidthTracker::average_usage`].
const DEFAULT_HISTORY: usize = 200;

/// Tracks how much of its per-tick byte budget one client has consumed.
#[derive(Debug, Clone)]
pub struct ClientBandwidthTracker {
    /// Which client this tracker belongs to.
    pub client_id: ClientId,
    /// Bytes the client may receive per tick.
    pub bytes_per_tick: usize,
    /// Bytes already sent during the current tick.
    pub bytes_sent_this_tick: usize,
    /// Per-tick send history, most recent at the back.
    pub bytes_sent_history: VecDeque<usize>,
    /// Maximum entries retained in the history ring.
    pub max_history: usize,
}

impl ClientBandwidthTracker {
    /// Creates a tracker with an empty history.
    pub fn new(client_id: ClientId, bytes_per_tick: usize) -> Self {
        Self {
            client_id,
            bytes_per_tick,
            bytes_sent_this_tick: 0,
            bytes_sent_history: VecDeque::new(),
            max_history: DEFAULT_HISTORY,
        }
    }

    /// How many bytes remain in this tick's budget.
    pub fn remaining_budget(&self) -> usize {
        self.bytes_per_tick
            .saturating_sub(self.bytes_sent_this_tick)
    }

    /// Whether a payload of `bytes` fits this tick.
    ///
    /// The first payload of a tick always fits, so a block larger than the
    /// whole budget still goes out eventually.
    pub fn allows(&self, bytes: usize) -> bool {
        self.bytes_sent_this_tick == 0 || bytes <= self.remaining_budget()
    }

    /// Records that `bytes` were sent.
    pub fn consume(&mut self, bytes: usize) {
        self.bytes_sent_this_tick += bytes;
    }

    /// Finishes the current tick: archives usage and resets the counter.
    pub fn end_tick(&mut self) {
        self.bytes_sent_history.push_back(self.bytes_sent_this_tick);
        if self.bytes_sent_history.len() > self.max_history {
            self.bytes_sent_history.pop_front();
        }
        self.bytes_sent_this_tick = 0;
    }

    /// Mean bytes sent per tick over the recorded history.
    pub fn average_usage(&self) -> f64 {
        if self.bytes_sent_history.is_empty() {
            return 0.0;
        }
        let sum: usize = self.bytes_sent_history.iter().sum();
        sum as f64 / self.bytes_sent_history.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_consumption() {
        let mut t = ClientBandwidthTracker::new(ClientId(1), 1000);
        assert_eq!(t.remaining_budget(), 1000);
        t.consume(400);
        assert_eq!(t.remaining_budget(), 600);
        assert!(t.allows(600));
        assert!(!t.allows(601));
        t.consume(700);
        assert_eq!(t.remaining_budget(), 0);
    }

    #[test]
    fn test_oversized_first_payload_allowed() {
        let mut t = ClientBandwidthTracker::new(ClientId(1), 100);
        assert!(t.allows(5000));
        t.consume(5000);
        assert!(!t.allows(1));
        t.end_tick();
        assert!(t.allows(5000));
    }

    #[test]
    fn test_end_tick_resets_and_records() {
        let mut t = ClientBandwidthTracker::new(ClientId(1), 1000);
        t.consume(300);
        t.end_tick();
        t.consume(100);
        t.end_tick();
        assert_eq!(t.bytes_sent_this_tick, 0);
        assert_eq!(t.bytes_sent_history.len(), 2);
        assert!((t.average_usage() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_ring_bounded() {
        let mut t = ClientBandwidthTracker::new(ClientId(1), 10);
        t.max_history = 3;
        for i in 0..10 {
            t.consume(i);
            t.end_tick();
        }
        assert_eq!(t.bytes_sent_history.len(), 3);
        assert_eq!(t.bytes_sent_history.front(), Some(&7));
    }
}
