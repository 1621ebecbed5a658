//! Keyed priority queue with supersede-on-upsert and optional deadlines.
//!
//! Both schedulers are built on [`PriorityTimeoutQueue`]. Larger priority
//! values are more urgent. Ties are served in insertion order. A key is
//! queued at most once; re-submitting it either supersedes, promotes, or
//! leaves the queued entry alone (see [`PriorityTimeoutQueue::upsert`]).
//!
//! The queue itself is not synchronized. The schedulers wrap it in a mutex.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::Hash;

use rustc_hash::FxHashMap;

/// A queued entry as returned by [`PriorityTimeoutQueue::pop`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedEntry<K> {
    /// The entry's key.
    pub key: K,
    /// Scheduling priority; larger is more urgent.
    pub priority: f32,
    /// Absolute deadline on the owner's clock, if the entry has one.
    pub deadline: Option<f64>,
}

/// What [`PriorityTimeoutQueue::upsert`] did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was not queued; a new entry was added.
    Inserted,
    /// The submission dominated the queued entry and replaced it.
    Superseded,
    /// The queued entry was overdue: it kept its priority, took the new
    /// deadline, and moved to the head of its priority band.
    Promoted,
    /// The queued entry dominated; nothing changed.
    Kept,
}

impl UpsertOutcome {
    /// Whether the queue changed.
    pub fn changed(self) -> bool {
        !matches!(self, Self::Kept)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    priority: f32,
    deadline: Option<f64>,
    seq: i64,
}

/// Ordering key: priority descending, then sequence ascending.
#[derive(Debug, Clone, Copy)]
struct Rank {
    priority: f32,
    seq: i64,
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rank {}

/// Highest-priority-first queue, unique by key.
#[derive(Debug)]
pub struct PriorityTimeoutQueue<K> {
    slots: FxHashMap<K, Slot>,
    order: BTreeMap<Rank, K>,
    /// Next sequence number for entries joining the back of their band.
    next_back: i64,
    /// Next sequence number for promoted entries joining the front.
    next_front: i64,
}

impl<K: Copy + Eq + Hash> PriorityTimeoutQueue<K> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            slots: FxHashMap::default(),
            order: BTreeMap::new(),
            next_back: 0,
            next_front: -1,
        }
    }

    /// Inserts `key` or resolves a collision with the queued entry.
    ///
    /// A submission supersedes the queued entry when its priority is
    /// strictly higher, or when priorities are equal and both carry
    /// deadlines with the new one later. Otherwise, if the queued entry's
    /// deadline is at or before `now`, the entry is promoted: it keeps its
    /// (higher or equal) priority, takes the new deadline and moves ahead
    /// of every other entry of that priority. In all remaining cases the
    /// call is a no-op.
    ///
    /// NaN priorities are treated as the lowest possible priority.
    pub fn upsert(
        &mut self,
        key: K,
        priority: f32,
        deadline: Option<f64>,
        now: f64,
    ) -> UpsertOutcome {
        let priority = normalize(priority);
        let Some(slot) = self.slots.get(&key).copied() else {
            self.push_back(key, priority, deadline);
            return UpsertOutcome::Inserted;
        };

        let later_deadline = matches!((deadline, slot.deadline), (Some(new), Some(old)) if new > old);
        if priority > slot.priority || (priority == slot.priority && later_deadline) {
            self.order.remove(&slot.rank());
            self.push_back(key, priority, deadline);
            return UpsertOutcome::Superseded;
        }

        if slot.deadline.is_some_and(|d| d <= now) {
            self.order.remove(&slot.rank());
            let seq = self.next_front;
            self.next_front -= 1;
            let promoted = Slot {
                priority: slot.priority,
                deadline,
                seq,
            };
            self.order.insert(promoted.rank(), key);
            self.slots.insert(key, promoted);
            return UpsertOutcome::Promoted;
        }

        UpsertOutcome::Kept
    }

    /// Removes and returns the most urgent entry.
    pub fn pop(&mut self) -> Option<QueuedEntry<K>> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some(slot.entry(key))
    }

    /// Returns the most urgent entry without removing it.
    pub fn peek(&self) -> Option<QueuedEntry<K>> {
        let (_, key) = self.order.first_key_value()?;
        self.get(key)
    }

    /// Walks entries from most to least urgent and removes up to `limit`
    /// of those accepted by `accept`. Rejected entries stay queued in place.
    pub fn pop_where(
        &mut self,
        limit: usize,
        mut accept: impl FnMut(&QueuedEntry<K>) -> bool,
    ) -> Vec<QueuedEntry<K>> {
        if limit == 0 {
            return Vec::new();
        }
        let mut taken: Vec<(Rank, QueuedEntry<K>)> = Vec::new();
        for (rank, key) in &self.order {
            let slot = &self.slots[key];
            let entry = slot.entry(*key);
            if accept(&entry) {
                taken.push((*rank, entry));
                if taken.len() == limit {
                    break;
                }
            }
        }
        taken
            .into_iter()
            .map(|(rank, entry)| {
                self.order.remove(&rank);
                self.slots.remove(&entry.key);
                entry
            })
            .collect()
    }

    /// Returns the queued entry for `key`.
    pub fn get(&self, key: &K) -> Option<QueuedEntry<K>> {
        self.slots.get(key).map(|slot| slot.entry(*key))
    }

    /// Whether `key` is queued.
    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Removes `key`, returning its entry if it was queued.
    pub fn remove(&mut self, key: &K) -> Option<QueuedEntry<K>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.rank());
        Some(slot.entry(*key))
    }

    /// Removes every entry whose key fails `keep`. Returns how many were removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let before = self.slots.len();
        self.order.retain(|_, key| keep(key));
        let order = &self.order;
        self.slots
            .retain(|_, slot| order.contains_key(&slot.rank()));
        before - self.slots.len()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }

    fn push_back(&mut self, key: K, priority: f32, deadline: Option<f64>) {
        let slot = Slot {
            priority,
            deadline,
            seq: self.next_back,
        };
        self.next_back += 1;
        self.order.insert(slot.rank(), key);
        self.slots.insert(key, slot);
    }
}

impl<K: Copy + Eq + Hash> Default for PriorityTimeoutQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    fn rank(&self) -> Rank {
        Rank {
            priority: self.priority,
            seq: self.seq,
        }
    }

    fn entry<K>(&self, key: K) -> QueuedEntry<K> {
        QueuedEntry {
            key,
            priority: self.priority,
            deadline: self.deadline,
        }
    }
}

fn normalize(priority: f32) -> f32 {
    if priority.is_nan() {
        f32::NEG_INFINITY
    } else {
        // Folds -0.0 into 0.0 so both compare and order identically.
        priority + 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_keys(q: &mut PriorityTimeoutQueue<u32>) -> Vec<u32> {
        std::iter::from_fn(|| q.pop()).map(|e| e.key).collect()
    }

    #[test]
    fn test_pop_returns_highest_priority_first() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 1.0, None, 0.0);
        q.upsert(2, 5.0, None, 0.0);
        q.upsert(3, -2.0, None, 0.0);
        q.upsert(4, 3.0, None, 0.0);
        assert_eq!(drain_keys(&mut q), vec![2, 4, 1, 3]);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_equal_priorities_pop_in_insertion_order() {
        let mut q = PriorityTimeoutQueue::new();
        for key in [7, 3, 9, 1] {
            q.upsert(key, 2.0, None, 0.0);
        }
        assert_eq!(drain_keys(&mut q), vec![7, 3, 9, 1]);
    }

    #[test]
    fn test_lower_or_equal_resubmission_is_kept() {
        let mut q = PriorityTimeoutQueue::new();
        assert_eq!(q.upsert(1, 5.0, None, 0.0), UpsertOutcome::Inserted);
        assert_eq!(q.upsert(1, 2.0, None, 0.0), UpsertOutcome::Kept);
        assert_eq!(q.upsert(1, 5.0, None, 0.0), UpsertOutcome::Kept);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().priority, 5.0);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_higher_resubmission_supersedes_and_reranks() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 1.0, None, 0.0);
        q.upsert(2, 3.0, None, 0.0);
        assert_eq!(q.upsert(1, 4.0, None, 0.0), UpsertOutcome::Superseded);
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek().unwrap().key, 1);
        assert_eq!(drain_keys(&mut q), vec![1, 2]);
    }

    #[test]
    fn test_equal_priority_later_deadline_supersedes() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 2.0, Some(5.0), 0.0);
        q.upsert(2, 2.0, Some(5.0), 0.0);
        assert_eq!(q.upsert(1, 2.0, Some(8.0), 1.0), UpsertOutcome::Superseded);
        assert_eq!(q.get(&1).unwrap().deadline, Some(8.0));
        // The replacement joins the back of its band.
        assert_eq!(drain_keys(&mut q), vec![2, 1]);
    }

    #[test]
    fn test_equal_priority_earlier_deadline_is_kept() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 2.0, Some(9.0), 0.0);
        assert_eq!(q.upsert(1, 2.0, Some(4.0), 0.0), UpsertOutcome::Kept);
        assert_eq!(q.get(&1).unwrap().deadline, Some(9.0));
    }

    #[test]
    fn test_overdue_entry_is_promoted_by_lower_resubmission() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 3.0, Some(5.0), 0.0);
        q.upsert(2, 3.0, None, 0.0);
        q.upsert(3, 3.0, Some(50.0), 0.0);

        // Not yet overdue: lower priority changes nothing.
        assert_eq!(q.upsert(3, 1.0, Some(60.0), 10.0), UpsertOutcome::Kept);

        // Overdue: promoted to the head of the 3.0 band, priority kept.
        assert_eq!(q.upsert(3, 1.0, Some(15.0), 60.0), UpsertOutcome::Promoted);
        let promoted = q.get(&3).unwrap();
        assert_eq!(promoted.priority, 3.0);
        assert_eq!(promoted.deadline, Some(15.0));
        assert_eq!(drain_keys(&mut q), vec![3, 1, 2]);
    }

    #[test]
    fn test_promotion_does_not_jump_higher_bands() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 9.0, None, 0.0);
        q.upsert(2, 1.0, Some(1.0), 0.0);
        assert_eq!(q.upsert(2, 0.5, Some(20.0), 10.0), UpsertOutcome::Promoted);
        assert_eq!(drain_keys(&mut q), vec![1, 2]);
    }

    #[test]
    fn test_pop_where_skips_rejected_entries() {
        let mut q = PriorityTimeoutQueue::new();
        for (key, p) in [(1, 5.0), (2, 4.0), (3, 3.0), (4, 2.0), (5, 1.0)] {
            q.upsert(key, p, None, 0.0);
        }
        let taken = q.pop_where(2, |e| e.key % 2 == 1);
        let keys: Vec<_> = taken.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 3]);
        assert_eq!(drain_keys(&mut q), vec![2, 4, 5]);
    }

    #[test]
    fn test_pop_where_zero_limit_takes_nothing() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, 1.0, None, 0.0);
        assert!(q.pop_where(0, |_| true).is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_retain_and_remove() {
        let mut q = PriorityTimeoutQueue::new();
        for key in 0..10u32 {
            q.upsert(key, key as f32, None, 0.0);
        }
        assert_eq!(q.retain(|k| k % 3 != 0), 4);
        assert_eq!(q.len(), 6);
        assert!(!q.contains(&3));
        assert_eq!(q.remove(&8).unwrap().priority, 8.0);
        assert!(q.remove(&8).is_none());
        assert_eq!(drain_keys(&mut q), vec![7, 5, 4, 2, 1]);
    }

    #[test]
    fn test_nan_and_negative_zero_priorities() {
        let mut q = PriorityTimeoutQueue::new();
        q.upsert(1, f32::NAN, None, 0.0);
        q.upsert(2, -0.0, None, 0.0);
        q.upsert(3, 0.0, None, 0.0);
        q.upsert(4, -100.0, None, 0.0);
        assert_eq!(q.upsert(2, 0.0, None, 0.0), UpsertOutcome::Kept);
        assert_eq!(drain_keys(&mut q), vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_keys_stay_unique_under_churn() {
        let mut q = PriorityTimeoutQueue::new();
        let mut now = 0.0;
        for round in 0..50u32 {
            for key in 0..20u32 {
                let p = ((key * 7 + round * 13) % 11) as f32 - 5.0;
                q.upsert(key, p, Some(now + 2.0), now);
            }
            now += 1.0;
        }
        assert_eq!(q.len(), 20);

        let mut last = f32::INFINITY;
        let mut seen = std::collections::HashSet::new();
        while let Some(e) = q.pop() {
            assert!(e.priority <= last, "priority went up while draining");
            assert!(seen.insert(e.key), "key {} popped twice", e.key);
            last = e.priority;
        }
    }
}
