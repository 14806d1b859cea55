// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The mutation queue (C4): one pending entry per target, flagged by local
//! writes and drained by the deferred flush (§4.2).

use std::collections::HashMap;

use crate::path::Target;
use crate::store::{FieldChange, UpdatePatch};
use crate::transaction::TransactionController;
use crate::value::Value;

/// A local write waiting to be flushed (§3 "Pending mutation").
///
/// `value` is filled lazily, at flush time, by reading the live cache — not
/// when the mutation is flagged — so that several writes to the same target
/// within one tick collapse into a single flush carrying only the final
/// value (§4.2 step 1, "last write wins per target").
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// The target this mutation will write to.
    pub target: Target,
    /// The cache value at `target` when it was first flagged this tick.
    pub previous: Value,
    /// The value to write, filled in at flush time.
    pub value: Option<Value>,
}

/// The queue of not-yet-flushed local mutations.
#[derive(Debug, Default)]
pub struct MutationQueue {
    entries: Vec<PendingMutation>,
}

impl MutationQueue {
    /// Flags `target` as dirty if it isn't already queued, capturing
    /// `previous` at the moment of flagging. Returns `true` if a new entry
    /// was created (the caller uses this to decide whether a flush needs
    /// scheduling, though scheduling itself is idempotent regardless).
    pub fn flag_if_new(&mut self, target: &Target, previous: impl FnOnce() -> Value) -> bool {
        if self.entries.iter().any(|e| &e.target == target) {
            return false;
        }
        self.entries.push(PendingMutation {
            target: target.clone(),
            previous: previous(),
            value: None,
        });
        true
    }

    /// `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All currently queued targets at or under `target`, without removing
    /// them — used by a transaction to report its own pending mutations.
    #[must_use]
    pub fn peek_under(&self, target: &Target) -> Vec<PendingMutation> {
        self.entries
            .iter()
            .filter(|e| target.is_self_or_ancestor_of(&e.target))
            .cloned()
            .collect()
    }

    /// Removes and returns every entry at or under `target` — used by
    /// transaction rollback to recover the mutations it owns.
    pub fn take_under(&mut self, target: &Target) -> Vec<PendingMutation> {
        let (under, rest): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| target.is_self_or_ancestor_of(&e.target));
        self.entries = rest;
        under
    }

    /// Removes and returns every entry *not* currently owned by an active
    /// transaction, leaving transaction-owned entries queued (§4.2 step 2,
    /// "transaction-owned mutations sit out the flush until the transaction
    /// resolves").
    pub fn take_flushable(&mut self, transactions: &TransactionController) -> Vec<PendingMutation> {
        let (owned, free): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| transactions.owns(&e.target));
        self.entries = owned;
        free
    }

    /// `true` if at least one queued entry is not currently owned by an
    /// active transaction — i.e. a flush would actually have something to
    /// do. Used to decide whether to re-schedule a flush without draining
    /// the queue (unlike [`MutationQueue::take_flushable`]), so a pending
    /// transaction claim doesn't cause an endless reschedule loop.
    #[must_use]
    pub fn has_flushable(&self, transactions: &TransactionController) -> bool {
        self.entries.iter().any(|e| !transactions.owns(&e.target))
    }
}

/// Drops any mutation dominated by an ancestor mutation in the same working
/// set, keeping the relative enqueue order of the survivors (§4.2 step 4).
#[must_use]
pub fn apply_ancestor_dominance(working: Vec<PendingMutation>) -> Vec<PendingMutation> {
    let mut kept: Vec<PendingMutation> = Vec::new();
    for m in working {
        let dominated = kept
            .iter()
            .any(|k| k.target != m.target && k.target.is_self_or_ancestor_of(&m.target));
        if dominated {
            continue;
        }
        kept.retain(|k| !(m.target != k.target && m.target.is_self_or_ancestor_of(&k.target)));
        kept.push(m);
    }
    kept
}

/// One store call this flush needs to perform (§4.2 step 5).
#[derive(Debug, Clone)]
pub enum FlushGroup {
    /// A whole-root replacement.
    Root {
        /// The new root value.
        value: Value,
        /// The root value before this write.
        previous: Value,
    },
    /// A partial write grouped by common parent target.
    Fields {
        /// The parent all fields in this group share.
        parent: Target,
        /// The fields to write, each carrying its own captured `previous`.
        patch: UpdatePatch,
    },
}

/// Groups resolved mutations (each carrying a filled-in `value`) into the
/// store calls a flush must issue, in enqueue order (§4.2 steps 5-6).
///
/// A root mutation is always alone in its working set: the root target is an
/// ancestor of every other target, so [`apply_ancestor_dominance`] will
/// already have collapsed the set down to just the root entry if one was
/// present.
#[must_use]
pub fn group_for_flush(resolved: Vec<PendingMutation>) -> Vec<FlushGroup> {
    if let Some(root) = resolved.iter().find(|m| m.target.is_root()) {
        return vec![FlushGroup::Root {
            value: root.value.clone().unwrap_or(Value::Null),
            previous: root.previous.clone(),
        }];
    }

    let mut order: Vec<Target> = Vec::new();
    let mut by_parent: HashMap<Target, UpdatePatch> = HashMap::new();
    for m in resolved {
        let Some(parent) = m.target.parent() else {
            continue;
        };
        let Some(key) = m.target.last().cloned() else {
            continue;
        };
        let value = m.value.unwrap_or(Value::Null);
        if !by_parent.contains_key(&parent) {
            order.push(parent.clone());
        }
        by_parent
            .entry(parent)
            .or_default()
            .0
            .insert(key, FieldChange { value, previous: m.previous });
    }

    order
        .into_iter()
        .map(|parent| {
            let patch = by_parent.remove(&parent).unwrap_or_default();
            FlushGroup::Fields { parent, patch }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::path::Key;

    fn pending(target: Target, value: Value) -> PendingMutation {
        PendingMutation {
            target,
            previous: Value::Null,
            value: Some(value),
        }
    }

    // ── 1. flag_if_new only creates one entry per target ────────────────

    #[test]
    fn flag_if_new_is_idempotent_per_target() {
        let mut queue = MutationQueue::default();
        let target = Target::new(vec![Key::from("a")]);
        assert!(queue.flag_if_new(&target, || Value::Number(1.0)));
        assert!(!queue.flag_if_new(&target, || Value::Number(99.0)));
        assert_eq!(queue.entries.len(), 1);
        assert_eq!(queue.entries[0].previous, Value::Number(1.0));
    }

    // ── 2. ancestor dominance drops descendants, keeps the ancestor ─────

    #[test]
    fn ancestor_dominance_drops_descendant_mutations() {
        let a = Target::new(vec![Key::from("a")]);
        let ab = Target::new(vec![Key::from("a"), Key::from("b")]);
        let z = Target::new(vec![Key::from("z")]);
        let working = vec![
            pending(ab.clone(), Value::Number(1.0)),
            pending(a.clone(), Value::empty_map()),
            pending(z.clone(), Value::Number(2.0)),
        ];
        let kept = apply_ancestor_dominance(working);
        let targets: Vec<_> = kept.iter().map(|m| m.target.clone()).collect();
        assert_eq!(targets, vec![a, z]);
    }

    // ── 3. dominance works regardless of which order ancestor/descendant
    //        were enqueued in ──────────────────────────────────────────

    #[test]
    fn ancestor_dominance_is_order_independent() {
        let a = Target::new(vec![Key::from("a")]);
        let ab = Target::new(vec![Key::from("a"), Key::from("b")]);
        let working = vec![pending(a.clone(), Value::empty_map()), pending(ab, Value::Number(1.0))];
        let kept = apply_ancestor_dominance(working);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].target, a);
    }

    // ── 4. grouping collapses a root mutation to a single Root group ───

    #[test]
    fn grouping_collapses_root_to_single_group() {
        let resolved = vec![pending(Target::root(), Value::Number(7.0))];
        let groups = group_for_flush(resolved);
        assert_eq!(groups.len(), 1);
        assert!(matches!(groups[0], FlushGroup::Root { .. }));
    }

    // ── 5. grouping batches siblings under one parent into one group ───

    #[test]
    fn grouping_batches_siblings_under_common_parent() {
        let parent = Target::new(vec![Key::from("user")]);
        let a = parent.child(Key::from("name"));
        let b = parent.child(Key::from("age"));
        let resolved = vec![pending(a, Value::String("Ada".into())), pending(b, Value::Number(30.0))];
        let groups = group_for_flush(resolved);
        assert_eq!(groups.len(), 1);
        match &groups[0] {
            FlushGroup::Fields { parent: p, patch } => {
                assert_eq!(p, &parent);
                assert_eq!(patch.0.len(), 2);
            }
            FlushGroup::Root { .. } => panic!("expected a Fields group"),
        }
    }
}
