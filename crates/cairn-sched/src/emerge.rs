//! Which blocks to load or generate next.

use parking_lot::Mutex;

use crate::coords::BlockPos;
use crate::queue::{PriorityTimeoutQueue, UpsertOutcome};

/// A block waiting to be emerged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmergeRequest {
    /// Block to load or generate.
    pub pos: BlockPos,
    /// Larger is more urgent.
    pub priority: f32,
}

/// Thread-safe emerge queue, unique by position.
///
/// Pure queue: starting or waking the worker is the caller's business.
#[derive(Debug, Default)]
pub struct EmergeScheduler {
    queue: Mutex<PriorityTimeoutQueue<BlockPos>>,
}

impl EmergeScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `pos`. Repeats at equal or lower priority are no-ops; a
    /// higher priority re-ranks the queued request.
    pub fn request_emerge(&self, pos: BlockPos, priority: f32) -> UpsertOutcome {
        self.queue.lock().upsert(pos, priority, None, 0.0)
    }

    /// Pops the most urgent position.
    pub fn next_emerge(&self) -> Option<BlockPos> {
        self.next_request().map(|r| r.pos)
    }

    /// Pops the most urgent request with its priority.
    pub fn next_request(&self) -> Option<EmergeRequest> {
        self.queue.lock().pop().map(|e| EmergeRequest {
            pos: e.key,
            priority: e.priority,
        })
    }

    /// Whether `pos` is waiting.
    pub fn is_queued(&self, pos: BlockPos) -> bool {
        self.queue.lock().contains(&pos)
    }

    /// Number of waiting requests.
    pub fn size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drops every waiting request. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}
