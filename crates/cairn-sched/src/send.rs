//! Which blocks to transmit to which client next.
//!
//! Entries are keyed by `(client, position)`. Each carries a deadline on
//! the scheduler's own clock, which the server loop advances once per
//! tick. Deadlines never expire entries; they only let a re-offer promote
//! an overdue entry (see [`PriorityTimeoutQueue::upsert`]).

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::client::ClientId;
use crate::coords::BlockPos;
use crate::queue::{PriorityTimeoutQueue, UpsertOutcome};

/// A block chosen for transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendRequest {
    /// Recipient.
    pub client: ClientId,
    /// Block to send.
    pub pos: BlockPos,
    /// Priority it was queued with.
    pub priority: f32,
    /// Absolute deadline on the scheduler clock.
    pub deadline: f64,
}

/// How much one [`SendScheduler::drain`] may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBudget {
    /// Requests across all clients.
    pub max_total: usize,
    /// Requests for any single client.
    pub max_per_client: usize,
}

impl DrainBudget {
    /// No limit beyond the queue length.
    pub const UNLIMITED: Self = Self {
        max_total: usize::MAX,
        max_per_client: usize::MAX,
    };
}

#[derive(Debug, Default)]
struct SendInner {
    queue: PriorityTimeoutQueue<(ClientId, BlockPos)>,
    clock: f64,
}

/// Thread-safe send queue, unique by `(client, position)`.
#[derive(Debug, Default)]
pub struct SendScheduler {
    inner: Mutex<SendInner>,
}

impl SendScheduler {
    /// Creates an empty scheduler with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `pos` for `client`, due within `timeout` seconds.
    pub fn offer(
        &self,
        client: ClientId,
        pos: BlockPos,
        priority: f32,
        timeout: f32,
    ) -> UpsertOutcome {
        let mut inner = self.inner.lock();
        let now = inner.clock;
        let deadline = now + timeout.max(0.0) as f64;
        inner
            .queue
            .upsert((client, pos), priority, Some(deadline), now)
    }

    /// Advances the internal clock. Only the server loop calls this.
    pub fn advance_clock(&self, dtime: f32) {
        self.inner.lock().clock += dtime.max(0.0) as f64;
    }

    /// Current clock reading in seconds.
    pub fn now(&self) -> f64 {
        self.inner.lock().clock
    }

    /// Pops the most urgent requests within `budget`.
    ///
    /// Once a client reaches `max_per_client`, its remaining entries are
    /// skipped in place so lower-priority entries of other clients can
    /// still be served this call. Highest-first order then holds within
    /// each client only: a capped client's more urgent entries stay queued
    /// while less urgent ones for others go out. With an unlimited
    /// per-client cap the result is highest-first across all clients.
    pub fn drain(&self, budget: DrainBudget) -> Vec<SendRequest> {
        let mut per_client: FxHashMap<ClientId, usize> = FxHashMap::default();
        let mut inner = self.inner.lock();
        inner
            .queue
            .pop_where(budget.max_total, |entry| {
                let count = per_client.entry(entry.key.0).or_default();
                if *count >= budget.max_per_client {
                    return false;
                }
                *count += 1;
                true
            })
            .into_iter()
            .map(|e| SendRequest {
                client: e.key.0,
                pos: e.key.1,
                priority: e.priority,
                deadline: e.deadline.unwrap_or_default(),
            })
            .collect()
    }

    /// Removes every entry for `client`. Returns how many were removed.
    pub fn purge_client(&self, client: ClientId) -> usize {
        self.inner.lock().queue.retain(|(c, _)| *c != client)
    }

    /// Whether `pos` is queued for `client`.
    pub fn is_queued(&self, client: ClientId, pos: BlockPos) -> bool {
        self.inner.lock().queue.contains(&(client, pos))
    }

    /// The queued request for `(client, pos)`, if any.
    pub fn get(&self, client: ClientId, pos: BlockPos) -> Option<SendRequest> {
        self.inner.lock().queue.get(&(client, pos)).map(|e| SendRequest {
            client,
            pos,
            priority: e.priority,
            deadline: e.deadline.unwrap_or_default(),
        })
    }

    /// Number of queued requests.
    pub fn size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Drops every queued request.
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C1: ClientId = ClientId(1);
    const C2: ClientId = ClientId(2);

    fn pos(x: i16) -> BlockPos {
        BlockPos::new(x, 0, 0)
    }

    #[test]
    fn test_offer_then_drain() {
        let s = SendScheduler::new();
        s.offer(C1, pos(1), 1.0, 5.0);
        s.offer(C1, pos(2), 3.0, 5.0);
        let out = s.drain(DrainBudget::UNLIMITED);
        let positions: Vec<_> = out.iter().map(|r| r.pos).collect();
        assert_eq!(positions, vec![pos(2), pos(1)]);
        assert_eq!(out[0].deadline, 5.0);
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn test_same_key_for_different_clients_is_distinct() {
        let s = SendScheduler::new();
        s.offer(C1, pos(1), 1.0, 5.0);
        s.offer(C2, pos(1), 1.0, 5.0);
        s.offer(C1, pos(1), 0.0, 5.0);
        assert_eq!(s.size(), 2);
    }

    #[test]
    fn test_overdue_offer_promotes_entry() {
        let s = SendScheduler::new();
        assert_eq!(s.offer(C1, pos(1), 3.0, 5.0), UpsertOutcome::Inserted);
        s.advance_clock(10.0);
        assert_eq!(s.offer(C1, pos(1), 1.0, 5.0), UpsertOutcome::Promoted);

        let req = s.get(C1, pos(1)).unwrap();
        assert_eq!(req.priority, 3.0);
        assert_eq!(req.deadline, 15.0);
        assert_eq!(s.size(), 1);
    }

    #[test]
    fn test_fresh_entry_ignores_lower_offer() {
        let s = SendScheduler::new();
        s.offer(C1, pos(1), 3.0, 5.0);
        s.advance_clock(1.0);
        assert_eq!(s.offer(C1, pos(1), 1.0, 5.0), UpsertOutcome::Kept);
        assert_eq!(s.get(C1, pos(1)).unwrap().deadline, 5.0);
    }

    #[test]
    fn test_equal_priority_refresh_extends_deadline() {
        let s = SendScheduler::new();
        s.offer(C1, pos(1), 2.0, 5.0);
        s.advance_clock(1.0);
        assert_eq!(s.offer(C1, pos(1), 2.0, 5.0), UpsertOutcome::Superseded);
        assert_eq!(s.get(C1, pos(1)).unwrap().deadline, 6.0);
    }

    #[test]
    fn test_per_client_cap_lets_other_clients_through() {
        let s = SendScheduler::new();
        for x in 0..5 {
            s.offer(C1, pos(x), 10.0 - x as f32, 5.0);
        }
        s.offer(C2, pos(0), 0.0, 5.0);

        let out = s.drain(DrainBudget {
            max_total: 10,
            max_per_client: 2,
        });
        let got: Vec<_> = out.iter().map(|r| (r.client, r.pos)).collect();
        assert_eq!(got, vec![(C1, pos(0)), (C1, pos(1)), (C2, pos(0))]);
        assert_eq!(s.size(), 3);
    }

    #[test]
    fn test_total_cap() {
        let s = SendScheduler::new();
        for x in 0..5 {
            s.offer(C1, pos(x), 1.0, 5.0);
        }
        let out = s.drain(DrainBudget {
            max_total: 3,
            max_per_client: 10,
        });
        assert_eq!(out.len(), 3);
        assert_eq!(s.size(), 2);
    }

    #[test]
    fn test_purge_client() {
        let s = SendScheduler::new();
        for x in 0..3 {
            s.offer(C1, pos(x), 1.0, 5.0);
        }
        s.offer(C2, pos(9), 1.0, 5.0);
        assert_eq!(s.purge_client(C1), 3);
        let out = s.drain(DrainBudget::UNLIMITED);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].client, C2);
    }

    #[test]
    fn test_drain_never_returns_lower_than_remaining() {
        let s = SendScheduler::new();
        for x in 0..30 {
            let client = if x % 3 == 0 { C2 } else { C1 };
            s.offer(client, pos(x), ((x * 17) % 7) as f32, 5.0);
        }
        let mut last = f32::INFINITY;
        loop {
            let batch = s.drain(DrainBudget {
                max_total: 1,
                max_per_client: 1,
            });
            let Some(req) = batch.first() else { break };
            assert!(req.priority <= last);
            last = req.priority;
        }
    }
}
