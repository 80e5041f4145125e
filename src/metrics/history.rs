//! Bounded in-memory history of metric snapshots

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::snapshot::MetricsSnapshot;

/// Fixed-capacity, insertion-ordered snapshot store.
///
/// Snapshots are held behind `Arc` so readers get immutable handles that stay
/// valid after the writer evicts them.
#[derive(Debug)]
pub struct MetricsHistory {
    snapshots: RwLock<VecDeque<Arc<MetricsSnapshot>>>,
    capacity: usize,
}

impl MetricsHistory {
    /// Create a history holding at most `capacity` snapshots (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a snapshot, evicting the oldest when full
    pub fn append(&self, snapshot: MetricsSnapshot) -> Arc<MetricsSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut snapshots = self.snapshots.write();
        while snapshots.len() >= self.capacity {
            snapshots.pop_front();
        }
        snapshots.push_back(Arc::clone(&snapshot));
        snapshot
    }

    /// Most recently appended snapshot
    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.snapshots.read().back().cloned()
    }

    /// Snapshots with `timestamp >= since`, in insertion order
    pub fn window(&self, since: DateTime<Utc>) -> MetricsWindow {
        let snapshots = self.snapshots.read();
        MetricsWindow {
            snapshots: snapshots
                .iter()
                .filter(|s| s.timestamp >= since)
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.snapshots.write().clear();
    }
}

impl Default for MetricsHistory {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Point-in-time view over a range of snapshots.
///
/// Iterating does not consume the window, so it can be walked any number of
/// times without touching the history lock again.
#[derive(Debug, Clone, Default)]
pub struct MetricsWindow {
    snapshots: Vec<Arc<MetricsSnapshot>>,
}

impl MetricsWindow {
    pub fn iter(&self) -> impl Iterator<Item = &MetricsSnapshot> + '_ {
        self.snapshots.iter().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn first(&self) -> Option<&MetricsSnapshot> {
        self.snapshots.first().map(|s| s.as_ref())
    }

    pub fn last(&self) -> Option<&MetricsSnapshot> {
        self.snapshots.last().map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::thread;

    fn snap_at(base: DateTime<Utc>, minutes: i64) -> MetricsSnapshot {
        MetricsSnapshot::new(base + Duration::minutes(minutes))
    }

    #[test]
    fn test_bounded_history_evicts_oldest() {
        let history = MetricsHistory::new(5);
        let base = Utc::now();

        for i in 0..8 {
            history.append(snap_at(base, i));
        }

        assert_eq!(history.len(), 5);
        let window = history.window(base);
        let times: Vec<_> = window.iter().map(|s| s.timestamp).collect();
        // Oldest three are gone
        assert_eq!(times.first(), Some(&(base + Duration::minutes(3))));
        assert_eq!(times.last(), Some(&(base + Duration::minutes(7))));
        assert!(history.window(base).iter().all(|s| s.timestamp >= base + Duration::minutes(3)));
    }

    #[test]
    fn test_latest() {
        let history = MetricsHistory::new(3);
        assert!(history.latest().is_none());

        let base = Utc::now();
        history.append(snap_at(base, 0));
        history.append(snap_at(base, 1));
        assert_eq!(history.latest().unwrap().timestamp, base + Duration::minutes(1));
    }

    #[test]
    fn test_window_is_restartable() {
        let history = MetricsHistory::new(10);
        let base = Utc::now();
        for i in 0..6 {
            history.append(snap_at(base, i));
        }

        let window = history.window(base + Duration::minutes(2));
        assert_eq!(window.len(), 4);
        let first_pass: Vec<_> = window.iter().map(|s| s.timestamp).collect();
        let second_pass: Vec<_> = window.iter().map(|s| s.timestamp).collect();
        assert_eq!(first_pass, second_pass);

        // Later writes do not change an existing window
        history.append(snap_at(base, 6));
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let history = Arc::new(MetricsHistory::new(50));
        let base = Utc::now();

        let writer = {
            let history = Arc::clone(&history);
            thread::spawn(move || {
                for i in 0..500 {
                    history.append(snap_at(base, i));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let history = Arc::clone(&history);
                thread::spawn(move || {
                    for _ in 0..200 {
                        assert!(history.len() <= 50);
                        let window = history.window(base);
                        assert!(window.len() <= 50);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(history.len(), 50);
    }
}
