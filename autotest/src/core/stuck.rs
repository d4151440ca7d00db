//! Bounded page-snapshot history and stuck detection.

use std::collections::VecDeque;

use crate::core::types::PageSnapshot;

/// Sliding window of the most recent page snapshots. Oldest entries are evicted.
#[derive(Debug, Clone)]
pub struct SnapshotWindow {
    capacity: usize,
    entries: VecDeque<PageSnapshot>,
}

impl SnapshotWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, snapshot: PageSnapshot) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<&PageSnapshot> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PageSnapshot> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Flags a page that has not changed across `threshold` consecutive observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckDetector {
    threshold: usize,
}

impl Default for StuckDetector {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

impl StuckDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(2),
        }
    }

    /// True when the newest `threshold` snapshots share url and fingerprint.
    pub fn is_stuck(&self, window: &SnapshotWindow) -> bool {
        if window.len() < self.threshold {
            return false;
        }
        let mut recent = window.iter().rev().take(self.threshold);
        let Some(newest) = recent.next() else {
            return false;
        };
        recent.all(|snapshot| snapshot.same_page(newest))
    }
}
