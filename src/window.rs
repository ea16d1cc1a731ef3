//! Per-frame snapshots and the sliding detection window.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, VecDeque};

use crate::detect::Detection;

/// Label counts for a single frame. The empty snapshot is an empty cart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameSnapshot {
    counts: BTreeMap<String, u32>,
}

impl FrameSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Count detections per label.
    pub fn from_detections<'a, I>(detections: I) -> Self
    where
        I: IntoIterator<Item = &'a Detection>,
    {
        let mut counts = BTreeMap::new();
        for detection in detections {
            *counts.entry(detection.label.clone()).or_insert(0) += 1;
        }
        Self { counts }
    }

    /// Build from explicit counts. Zero counts are dropped; repeated labels add up.
    pub fn from_counts<S, I>(counts: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, u32)>,
    {
        let mut map = BTreeMap::new();
        for (label, count) in counts {
            if count > 0 {
                *map.entry(label.into()).or_insert(0) += count;
            }
        }
        Self { counts: map }
    }

    pub fn count(&self, label: &str) -> u32 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Label-sorted `(label, count)` tuple used as the consensus key.
    pub fn canonical(&self) -> CanonicalState {
        CanonicalState::from_sorted_counts(self.counts.clone())
    }
}

/// Canonical, hashable form of a snapshot: `(label, count)` pairs sorted by label.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalState(Vec<(String, u32)>);

impl CanonicalState {
    pub(crate) fn from_sorted_counts(counts: BTreeMap<String, u32>) -> Self {
        Self(counts.into_iter().filter(|(_, count)| *count > 0).collect())
    }

    pub fn entries(&self) -> &[(String, u32)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fixed-capacity ring of the most recent snapshots.
///
/// Once full, every push evicts the oldest entry.
#[derive(Clone, Debug)]
pub struct DetectionWindow {
    snapshots: VecDeque<FrameSnapshot>,
    capacity: usize,
}

impl DetectionWindow {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("detection window size must be at least 1"));
        }
        Ok(Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn push(&mut self, snapshot: FrameSnapshot) {
        while self.snapshots.len() >= self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.snapshots.len() == self.capacity
    }

    /// Snapshots from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &FrameSnapshot> + '_ {
        self.snapshots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_labels() {
        let dets = vec![
            Detection::new("apple", 0.9, [0.0; 4]),
            Detection::new("spam", 0.8, [0.0; 4]),
            Detection::new("apple", 0.7, [0.0; 4]),
        ];
        let snapshot = FrameSnapshot::from_detections(&dets);
        assert_eq!(snapshot.count("apple"), 2);
        assert_eq!(snapshot.count("spam"), 1);
        assert_eq!(snapshot.count("milk"), 0);
        assert!(FrameSnapshot::from_detections(Vec::<Detection>::new().iter()).is_empty());
    }

    #[test]
    fn canonical_state_is_label_sorted_and_ignores_zero_counts() {
        let a = FrameSnapshot::from_counts([("spam", 2), ("apple", 1), ("milk", 0)]);
        let b = FrameSnapshot::from_counts([("apple", 1), ("spam", 2)]);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            a.canonical().entries(),
            &[("apple".to_string(), 1), ("spam".to_string(), 2)]
        );
        assert!(FrameSnapshot::from_counts([("apple", 0)]).canonical().is_empty());
    }

    #[test]
    fn window_evicts_oldest_when_full() {
        let mut window = DetectionWindow::new(3).unwrap();
        for n in 1..=5u32 {
            window.push(FrameSnapshot::from_counts([("apple", n)]));
        }
        assert!(window.is_full());
        let counts: Vec<u32> = window.iter().map(|s| s.count("apple")).collect();
        assert_eq!(counts, vec![3, 4, 5]);
    }

    #[test]
    fn window_rejects_zero_capacity() {
        assert!(DetectionWindow::new(0).is_err());
    }
}
