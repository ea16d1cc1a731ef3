//! Whole-snapshot majority consensus over the detection window.
//!
//! Every snapshot in a full window is reduced to its canonical state and the
//! most frequent state wins if it holds at least `threshold` of the window.
//! Consensus is never computed per label: a cart mid-transition (one item out,
//! another in) shows several distinct states and stays unstable instead of
//! producing a spliced inventory. The winner is always a state that actually
//! occurred in the window.
//!
//! Ties go to the state whose first occurrence is oldest in the window.

use anyhow::{anyhow, Result};
use std::collections::HashMap;

use crate::inventory::StabilizedInventory;
use crate::window::{CanonicalState, DetectionWindow};

/// Outcome of one stabilization pass.
#[derive(Clone, Debug, PartialEq)]
pub enum Stabilization {
    /// The window is not full yet; no decision is made.
    Filling { have: usize, need: usize },
    /// The leading state holds less than the threshold.
    Unstable { score: f64 },
    /// The leading state passed the threshold.
    Stable {
        inventory: StabilizedInventory,
        score: f64,
    },
}

impl Stabilization {
    pub fn inventory(&self) -> Option<&StabilizedInventory> {
        match self {
            Stabilization::Stable { inventory, .. } => Some(inventory),
            _ => None,
        }
    }
}

/// Consensus threshold holder.
#[derive(Clone, Copy, Debug)]
pub struct Stabilizer {
    threshold: f64,
}

impl Stabilizer {
    /// `threshold` is the minimum share of the window, in (0, 1].
    pub fn new(threshold: f64) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!(
                "stability threshold must be in (0, 1], got {}",
                threshold
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn stabilize(&self, window: &DetectionWindow) -> Stabilization {
        if !window.is_full() {
            return Stabilization::Filling {
                have: window.len(),
                need: window.capacity(),
            };
        }

        let Some((state, count)) = most_frequent_state(window) else {
            return Stabilization::Unstable { score: 0.0 };
        };
        let score = count as f64 / window.len() as f64;
        if score >= self.threshold {
            Stabilization::Stable {
                inventory: StabilizedInventory::from_state(&state),
                score,
            }
        } else {
            Stabilization::Unstable { score }
        }
    }
}

/// Most frequent canonical state and its count; ties resolve to the earliest first occurrence.
pub fn most_frequent_state(window: &DetectionWindow) -> Option<(CanonicalState, usize)> {
    let mut order: Vec<(CanonicalState, usize)> = Vec::new();
    let mut index: HashMap<CanonicalState, usize> = HashMap::new();
    for snapshot in window.iter() {
        let state = snapshot.canonical();
        match index.get(&state) {
            Some(&slot) => order[slot].1 += 1,
            None => {
                index.insert(state.clone(), order.len());
                order.push((state, 1));
            }
        }
    }

    let mut best: Option<(CanonicalState, usize)> = None;
    for (state, count) in order {
        // Strictly greater keeps the earlier state on ties.
        if best.as_ref().map_or(true, |(_, top)| count > *top) {
            best = Some((state, count));
        }
    }
    best
}
