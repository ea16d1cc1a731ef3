//! Settled cart contents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::window::CanonicalState;

/// One product line of a settled inventory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub product_name: String,
    pub quantity: u32,
}

/// Cart contents reconstructed from a winning window state.
///
/// Items are ordered by product name. Equality for publish decisions is
/// [`StabilizedInventory::same_contents`], which ignores item order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StabilizedInventory {
    items: Vec<InventoryItem>,
}

impl StabilizedInventory {
    pub fn from_state(state: &CanonicalState) -> Self {
        let items = state
            .entries()
            .iter()
            .map(|(label, count)| InventoryItem {
                product_name: label.clone(),
                quantity: *count,
            })
            .collect();
        Self { items }
    }

    /// Wrap arbitrary items, e.g. ones received over the wire.
    pub fn from_items(items: Vec<InventoryItem>) -> Self {
        Self { items }
    }

    /// Canonical comparison key. Duplicate product lines are merged; zero quantities dropped.
    pub fn to_state(&self) -> CanonicalState {
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.product_name.clone()).or_insert(0) += item.quantity;
        }
        CanonicalState::from_sorted_counts(counts)
    }

    /// Order-independent multiset equality.
    pub fn same_contents(&self, other: &StabilizedInventory) -> bool {
        self.to_state() == other.to_state()
    }

    pub fn items(&self) -> &[InventoryItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_quantity(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}

impl fmt::Display for StabilizedInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.items.is_empty() {
            return write!(f, "(empty)");
        }
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}x{}", item.product_name, item.quantity)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::FrameSnapshot;

    fn item(name: &str, quantity: u32) -> InventoryItem {
        InventoryItem {
            product_name: name.to_string(),
            quantity,
        }
    }

    #[test]
    fn reconstruction_round_trip_preserves_multiset() {
        let inventory =
            StabilizedInventory::from_items(vec![item("spam", 2), item("apple", 1), item("milk", 3)]);
        let rebuilt = StabilizedInventory::from_state(&inventory.to_state());

        assert!(rebuilt.same_contents(&inventory));
        let names: Vec<&str> = rebuilt
            .items()
            .iter()
            .map(|i| i.product_name.as_str())
            .collect();
        assert_eq!(names, vec!["apple", "milk", "spam"]);
    }

    #[test]
    fn same_contents_ignores_order_but_not_quantity() {
        let a = StabilizedInventory::from_items(vec![item("apple", 1), item("spam", 2)]);
        let b = StabilizedInventory::from_items(vec![item("spam", 2), item("apple", 1)]);
        let c = StabilizedInventory::from_items(vec![item("spam", 1), item("apple", 1)]);
        assert!(a.same_contents(&b));
        assert!(!a.same_contents(&c));
    }

    #[test]
    fn from_state_matches_snapshot_counts() {
        let snapshot = FrameSnapshot::from_counts([("apple", 1), ("spam", 2)]);
        let inventory = StabilizedInventory::from_state(&snapshot.canonical());
        assert_eq!(inventory.items(), &[item("apple", 1), item("spam", 2)]);
        assert_eq!(inventory.total_quantity(), 3);
        assert_eq!(inventory.to_string(), "applex1, spamx2");
    }

    #[test]
    fn serializes_as_item_array() {
        let inventory = StabilizedInventory::from_items(vec![item("apple", 1)]);
        let json = serde_json::to_string(&inventory).unwrap();
        assert_eq!(json, r#"[{"product_name":"apple","quantity":1}]"#);
    }
}
