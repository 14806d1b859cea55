// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The ordered-collection helper (C8): maintains an `order` field on each
//! child of a mapping façade, using gap-based insertion so most inserts cost
//! a single write (§4.1 "ordered collection").

use crate::access::Node;
use crate::error::UsageError;
use crate::path::Key;
use crate::store::Store;
use crate::value::Value;

const DEFAULT_ORDER_PROPERTY: &str = "order";
const DEFAULT_INCREMENT: f64 = 10.0;

/// Wraps a mapping façade, keeping every child's `order` field consistent
/// as items are added, moved, deleted, or sorted.
pub struct OrderedCollection<S: Store> {
    node: Node<S>,
    order_property: String,
    increment: f64,
}

impl<S: Store> OrderedCollection<S> {
    /// Wraps `node`, assigning an `order` field to any child that doesn't
    /// already have one, in its current iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if `node`'s value is not
    /// a mapping.
    pub fn new(node: Node<S>, order_property: Option<String>, increment: Option<f64>) -> Result<Self, UsageError> {
        let order_property = order_property.unwrap_or_else(|| DEFAULT_ORDER_PROPERTY.to_owned());
        let increment = increment.unwrap_or(DEFAULT_INCREMENT);
        match node.materialize() {
            Value::Map(_) | Value::Null => {}
            _ => {
                return Err(UsageError::PropertyOfPrimitive {
                    target: node.target().to_string(),
                    key: order_property,
                })
            }
        }

        let collection = Self { node, order_property, increment };
        for (i, key) in collection.node.keys().into_iter().enumerate() {
            let child = collection.node.child(key);
            if !collection.has_order(&child) {
                #[allow(clippy::cast_precision_loss)]
                let order = i as f64 * collection.increment;
                child.set(collection.order_property.clone(), Value::Number(order))?;
            }
        }
        Ok(collection)
    }

    fn has_order(&self, child: &Node<S>) -> bool {
        matches!(child.materialize(), Value::Map(m) if m.contains_key(&self.order_property))
    }

    fn order_of(&self, child: &Node<S>) -> f64 {
        match child.materialize() {
            Value::Map(m) => match m.get(&self.order_property) {
                Some(Value::Number(n)) => *n,
                _ => 0.0,
            },
            _ => 0.0,
        }
    }

    /// Every child's key and current `order` value, sorted ascending.
    fn sorted(&self) -> Vec<(Key, f64)> {
        let mut items: Vec<(Key, f64)> = self
            .node
            .keys()
            .into_iter()
            .map(|k| {
                let child = self.node.child(k.clone());
                let order = self.order_of(&child);
                (k, order)
            })
            .collect();
        items.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        items
    }

    /// The collection's children, as façades, in order (`getArray()`, §4.1).
    #[must_use]
    pub fn get_array(&self) -> Vec<Node<S>> {
        self.sorted().into_iter().map(|(k, _)| self.node.child(k)).collect()
    }

    fn set_order(&self, key: &Key, order: f64) -> Result<(), UsageError> {
        self.node.child(key.clone()).set(self.order_property.clone(), Value::Number(order))
    }

    /// Inserts `item` at `index` (end, if `None`), returning the key it was
    /// stored under. If `from` is given and the move is to an adjacent
    /// position, only the two affected children's `order` fields are
    /// swapped — a single pair of writes rather than a full renumber (§4.1
    /// "moves of exactly one position").
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Node::push`] or [`Node::set`] returns.
    pub fn add(&self, item: Value, index: Option<usize>, from: Option<usize>) -> Result<Key, UsageError> {
        let sorted = self.sorted();
        let len = sorted.len();

        if let (Some(from_idx), Some(to_idx)) = (from, index) {
            if from_idx < len
                && to_idx < len
                && (isize::try_from(to_idx).unwrap_or(0) - isize::try_from(from_idx).unwrap_or(0)).abs() == 1
            {
                let (key_a, order_a) = sorted[from_idx].clone();
                let (key_b, order_b) = sorted[to_idx].clone();
                self.set_order(&key_a, order_b)?;
                self.set_order(&key_b, order_a)?;
                return Ok(key_a);
            }
        }

        let insert_at = index.unwrap_or(len);
        let order = if len == 0 {
            0.0
        } else if insert_at == 0 {
            sorted[0].1 - self.increment
        } else if insert_at >= len {
            sorted[len - 1].1 + self.increment
        } else {
            let lower = sorted[insert_at - 1].1;
            let upper = sorted[insert_at].1;
            let gap = upper - lower;
            if gap.abs() <= 1.0 {
                return self.add_with_renumber(item, insert_at);
            }
            lower + gap / 2.0
        };

        let key = self.node.push(item)?;
        self.set_order(&key, order)?;
        Ok(key)
    }

    /// Inserts `item` at `insert_at` and renumbers every child (including
    /// the new one) to `i * increment`, used when the gap either side of an
    /// insertion point has collapsed below `1.0` (§4.1 "renumber on gap").
    fn add_with_renumber(&self, item: Value, insert_at: usize) -> Result<Key, UsageError> {
        let key = self.node.push(item)?;
        let mut keys: Vec<Key> = self.sorted().into_iter().map(|(k, _)| k).filter(|k| k != &key).collect();
        let at = insert_at.min(keys.len());
        keys.insert(at, key.clone());
        for (i, k) in keys.into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let order = i as f64 * self.increment;
            self.set_order(&k, order)?;
        }
        Ok(key)
    }

    /// Removes the child currently at sorted position `index`.
    ///
    /// # Errors
    ///
    /// Propagates whatever the underlying delete does; a no-op if `index` is
    /// out of range.
    pub fn delete(&self, index: usize) -> Result<(), UsageError> {
        let sorted = self.sorted();
        let Some((key, _)) = sorted.get(index) else {
            return Ok(());
        };
        self.node.delete(key.clone())
    }

    /// Renumbers every child by `cmp` order, one write per child whose
    /// position actually changed.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Node::set`] returns.
    pub fn sort(&self, cmp: impl Fn(&Value, &Value) -> std::cmp::Ordering) -> Result<(), UsageError> {
        let mut keys = self.node.keys();
        let values: std::collections::HashMap<String, Value> = keys
            .iter()
            .filter_map(|k| k.as_str().map(|s| (s.to_owned(), self.node.child(k.clone()).materialize())))
            .collect();
        keys.sort_by(|a, b| {
            let (Some(sa), Some(sb)) = (a.as_str(), b.as_str()) else {
                return std::cmp::Ordering::Equal;
            };
            let (va, vb) = (values.get(sa), values.get(sb));
            match (va, vb) {
                (Some(va), Some(vb)) => cmp(va, vb),
                _ => std::cmp::Ordering::Equal,
            }
        });
        for (i, key) in keys.into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let order = i as f64 * self.increment;
            self.set_order(&key, order)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::idgen::MonotonicIdGenerator;
    use crate::memory::MemoryStore;
    use crate::proxy::{CreateOptions, ProxyCore};

    fn collection(initial: Value) -> OrderedCollection<MemoryStore> {
        let store = MemoryStore::new(initial);
        let core = ProxyCore::for_tests(store, Box::new(MonotonicIdGenerator::new()), CreateOptions::default());
        let node = Node::new(core, crate::path::Target::root());
        OrderedCollection::new(node, None, None).unwrap()
    }

    // ── 1. new items inserted in the middle land between their neighbors ─

    #[test]
    fn insert_in_the_middle_lands_between_neighbors() {
        let mut m = indexmap::IndexMap::new();
        m.insert("a".to_owned(), Value::empty_map());
        m.insert("b".to_owned(), Value::empty_map());
        let c = collection(Value::Map(m));
        let key = c.add(Value::empty_map(), Some(1), None).unwrap();
        let sorted = c.sorted();
        let position = sorted.iter().position(|(k, _)| k == &key).unwrap();
        assert_eq!(position, 1);
    }

    // ── 2. appending with no index places the item last ────────────────

    #[test]
    fn append_with_no_index_places_item_last() {
        let c = collection(Value::empty_map());
        c.add(Value::Number(1.0), None, None).unwrap();
        let key = c.add(Value::Number(2.0), None, None).unwrap();
        let sorted = c.sorted();
        assert_eq!(sorted.last().unwrap().0, key);
    }

    // ── 3. an adjacent move swaps just the two affected orders ─────────

    #[test]
    fn adjacent_move_swaps_two_orders() {
        let c = collection(Value::empty_map());
        c.add(Value::Number(1.0), None, None).unwrap();
        c.add(Value::Number(2.0), None, None).unwrap();
        c.add(Value::Number(3.0), None, None).unwrap();
        let before = c.sorted();
        c.add(Value::Null, Some(0), Some(1)).unwrap();
        let after = c.sorted();
        assert_eq!(after[0].0, before[1].0);
        assert_eq!(after[1].0, before[0].0);
        assert_eq!(after[2].0, before[2].0);
    }

    // ── 4. delete removes the child at the given sorted position ───────

    #[test]
    fn delete_removes_child_at_sorted_position() {
        let c = collection(Value::empty_map());
        let first = c.add(Value::Number(1.0), None, None).unwrap();
        c.add(Value::Number(2.0), None, None).unwrap();
        c.delete(0).unwrap();
        let sorted = c.sorted();
        assert!(sorted.iter().all(|(k, _)| k != &first));
    }
}
