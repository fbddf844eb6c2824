//! Bounded snapshot history shared between the sampler (writer) and REST readers.

use parking_lot::RwLock;
use std::collections::VecDeque;

use crate::types::Snapshot;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while dq.len() >= cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

// FIFO ring of the last `cap` snapshots, oldest first
pub struct History {
    entries: RwLock<VecDeque<Snapshot>>,
    cap: usize,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn push(&self, snapshot: Snapshot) {
        let mut entries = self.entries.write();
        push_capped(&mut entries, snapshot, self.cap);
    }

    /// Most recent snapshot, or a zeroed one before the first tick.
    pub fn latest(&self) -> Snapshot {
        self.entries.read().back().cloned().unwrap_or_default()
    }

    pub fn last_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.entries.read().back().map(|s| s.timestamp)
    }

    pub fn snapshot(&self) -> Vec<Snapshot> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
