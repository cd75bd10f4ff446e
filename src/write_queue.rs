//! Bounded queue of writes awaiting retry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use crate::graph::WriteChange;

struct PendingWrite {
    change: WriteChange,
    #[allow(dead_code)]
    queued_at: Instant,
}

/// FIFO ring of pending property writes.
///
/// The queue never exceeds its capacity: enqueueing into a full queue
/// evicts the oldest entry and counts the loss. Only snapshots are
/// handed out; the flush gate in the write pipeline is what keeps
/// drain/refill sequences single-writer.
pub struct WriteQueue {
    entries: Mutex<VecDeque<PendingWrite>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl WriteQueue {
    /// A capacity of zero disables queueing entirely: every enqueue is
    /// counted as dropped.
    pub fn new(capacity: usize) -> Self {
        WriteQueue {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, change: WriteChange) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(PendingWrite {
            change,
            queued_at: Instant::now(),
        });
        let mut evicted = 0u64;
        while entries.len() > self.capacity {
            entries.pop_front();
            evicted += 1;
        }
        drop(entries);
        if evicted > 0 {
            let total =
                self.dropped.fetch_add(evicted, Ordering::AcqRel) + evicted;
            warn!(evicted, total, "write queue overflow, dropped oldest");
        }
    }

    pub fn enqueue_batch(
        &self,
        changes: impl IntoIterator<Item = WriteChange>,
    ) {
        for change in changes {
            self.enqueue(change);
        }
    }

    /// Take everything currently queued, oldest first.
    pub fn dequeue_all(&self) -> Vec<WriteChange> {
        self.entries
            .lock()
            .unwrap()
            .drain(..)
            .map(|entry| entry.change)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Writes lost to overflow since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PropertyRef, SubjectId, Value};
    use std::time::SystemTime;

    fn change(step: i64) -> WriteChange {
        WriteChange {
            property: PropertyRef::property(SubjectId(0), "Speed"),
            value: Value::Int(step),
            changed_at: SystemTime::now(),
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue = WriteQueue::new(2);
        queue.enqueue(change(1));
        queue.enqueue(change(2));
        queue.enqueue(change(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);

        let drained = queue.dequeue_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].value, Value::Int(2));
        assert_eq!(drained[1].value, Value::Int(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_disables_queueing() {
        let queue = WriteQueue::new(0);
        queue.enqueue_batch([change(1), change(2)]);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped_count(), 2);
    }
}
