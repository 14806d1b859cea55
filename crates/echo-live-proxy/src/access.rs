// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The access interceptor (C3): `Node` is the façade through which a host
//! reads and writes the proxied value graph. Every write funnels through
//! here so it can be flagged, deduplicated, and queued (§4.1).

use std::rc::Rc;

use futures::stream::LocalBoxStream;

use crate::error::UsageError;
use crate::events::{HandlerId, ProjectedChange};
use crate::ordered::OrderedCollection;
use crate::path::{Key, Target};
use crate::proxy::ProxyCore;
use crate::store::Store;
use crate::transaction::Transaction;
use crate::value::{Value, ValueKind};

/// The result of reading a child: a leaf value, or a sub-façade for a
/// composite (§4.1 "identity-stable sub-façades").
pub enum Accessed<S: Store> {
    /// A non-composite child value.
    Leaf(Value),
    /// A composite child, as a fresh façade over the same target.
    Node(Node<S>),
}

impl<S: Store> Accessed<S> {
    /// The underlying value either way, cloning out of a `Node`.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Leaf(v) => v,
            Self::Node(n) => n.materialize(),
        }
    }
}

/// A façade bound to one target inside the cache. `Node`s are cheap,
/// `Clone`-able handles — the identity-stable behavior the spec describes
/// for host languages with ambient property access is expressed here simply
/// as structural equality of `(core pointer, target)` pairs, since Rust has
/// no implicit property interception to cache against.
pub struct Node<S: Store> {
    pub(crate) core: Rc<ProxyCore<S>>,
    pub(crate) target: Target,
}

impl<S: Store> Clone for Node<S> {
    fn clone(&self) -> Self {
        Self { core: Rc::clone(&self.core), target: self.target.clone() }
    }
}

impl<S: Store> Node<S> {
    pub(crate) fn new(core: Rc<ProxyCore<S>>, target: Target) -> Self {
        Self { core, target }
    }

    /// The target this façade is bound to.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// A child façade at `key`, without reading anything (used internally
    /// and by callers who want a handle before a value exists there).
    #[must_use]
    pub fn child(&self, key: impl Into<Key>) -> Self {
        Self::new(Rc::clone(&self.core), self.target.child(key.into()))
    }

    /// Materializes the current value at this façade's target — the escape
    /// hatch into a plain [`Value`], a deep clone of the live cache (§4.1).
    #[must_use]
    pub fn materialize(&self) -> Value {
        self.core.cache_at(&self.target)
    }

    /// The external store's own path for this façade's target (§6).
    #[must_use]
    pub fn get_ref(&self) -> crate::store::ExternalPath {
        self.core.external_path_for(&self.target)
    }

    /// Reads the child at `key`. Reading a missing property yields the
    /// absent leaf value rather than an error; reading any property of a
    /// primitive is a usage error (§4.1).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if this façade's own
    /// value is a non-composite, non-null scalar.
    pub fn get(&self, key: impl Into<Key>) -> Result<Accessed<S>, UsageError> {
        let key = key.into();
        let current = self.materialize();
        match current.kind() {
            ValueKind::Map | ValueKind::Array | ValueKind::Null => {
                let child = current.get(&key).cloned().unwrap_or(Value::Null);
                if child.is_composite() {
                    Ok(Accessed::Node(self.child(key)))
                } else {
                    Ok(Accessed::Leaf(child))
                }
            }
            ValueKind::Scalar => Err(UsageError::PropertyOfPrimitive {
                target: self.target.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Writes `value` at `key`. A write that would not change the
    /// structurally-equal value already there is suppressed entirely — no
    /// pending mutation, no cache write, no event (§4.1, idempotent-write
    /// suppression).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NonNumericSequenceKey`] or
    /// [`UsageError::PropertyOfPrimitive`] per [`crate::value::Cache::set_at`].
    pub fn set(&self, key: impl Into<Key>, value: Value) -> Result<(), UsageError> {
        let key = key.into();
        let literal = self.target.child(key);
        let value = value.stripped_of_absent();
        let existing = self.core.cache_at(&literal);
        if existing == value {
            return Ok(());
        }
        let flag_target = self.core.resolve_flag_target(&literal);
        self.core.record_and_apply(&flag_target, |cache| {
            let _ = cache.set_at(&literal, value);
        })
    }

    /// Replaces this façade's own target wholesale (the `value` setter,
    /// §4.1).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if an intermediate step
    /// on the path to this target is a primitive.
    pub fn set_value(&self, value: Value) -> Result<(), UsageError> {
        let value = value.stripped_of_absent();
        let existing = self.materialize();
        if existing == value {
            return Ok(());
        }
        let flag_target = self.core.resolve_flag_target(&self.target);
        self.core.record_and_apply(&flag_target, |cache| {
            let _ = cache.set_at(&self.target, value);
        })
    }

    /// Deletes the child at `key`. A no-op if it is already absent.
    ///
    /// # Errors
    ///
    /// Propagates the same failure modes as [`Node::set`].
    pub fn delete(&self, key: impl Into<Key>) -> Result<(), UsageError> {
        let key = key.into();
        let literal = self.target.child(key);
        if self.core.cache_at(&literal).is_absent() {
            return Ok(());
        }
        let flag_target = self.core.resolve_flag_target(&literal);
        self.core.record_and_apply(&flag_target, |cache| {
            let _ = cache.remove_at(&literal);
        })
    }

    /// Removes this façade's own node from its parent (`remove()`, §6).
    /// A no-op at the root, which has no parent to remove it from.
    pub fn remove(&self) {
        if self.target.is_root() {
            return;
        }
        let flag_target = self.core.resolve_flag_target(&self.target);
        let _ = self.core.record_and_apply(&flag_target, |cache| {
            let _ = cache.remove_at(&self.target);
        });
    }

    /// Appends `value` with a freshly generated key (mapping target) or at
    /// the end (sequence target), returning the key used (§4.1 `push`).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if this façade's value is
    /// a non-composite.
    pub fn push(&self, value: Value) -> Result<Key, UsageError> {
        let current = self.materialize();
        let key = match current {
            Value::Array(a) => Key::Index(a.len()),
            Value::Map(_) | Value::Null => Key::from(self.core.id_gen.generate()),
            _ => {
                return Err(UsageError::PropertyOfPrimitive {
                    target: self.target.to_string(),
                    key: "<push>".to_owned(),
                })
            }
        };
        self.set(key.clone(), value)?;
        Ok(key)
    }

    /// Children of this façade's current value, in iteration order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Key, Accessed<S>)> {
        self.materialize()
            .entries()
            .into_iter()
            .map(|(k, v)| {
                let accessed = if v.is_composite() { Accessed::Node(self.child(k.clone())) } else { Accessed::Leaf(v.clone()) };
                (k, accessed)
            })
            .collect()
    }

    /// The keys of this façade's current composite value.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.materialize().entries().into_iter().map(|(k, _)| k).collect()
    }

    /// The child values of this façade's current composite value.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.materialize().entries().into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// The children of this façade, as a plain array sorted by `sort_fn` if
    /// given, else in iteration order (`toArray(sortFn?)`, §6).
    #[must_use]
    pub fn to_array(&self, sort_fn: Option<&dyn Fn(&Value, &Value) -> std::cmp::Ordering>) -> Vec<Value> {
        let mut values = self.values();
        if let Some(cmp) = sort_fn {
            values.sort_by(|a, b| cmp(a, b));
        }
        values
    }

    /// Registers a subtree change handler at this façade's target
    /// (`onChanged`, §4.4). Returning `false` from `callback` auto-detaches
    /// it.
    pub fn on_changed(&self, callback: impl Fn(&ProjectedChange) -> bool + 'static) -> HandlerId {
        self.core.fanout.add(self.target.clone(), callback)
    }

    /// Detaches a handler previously returned by [`Node::on_changed`] or
    /// [`Node::subscribe`].
    pub fn off_changed(&self, id: HandlerId) {
        self.core.fanout.remove(id);
    }

    /// Builds a `subscribe()` surface: calling
    /// [`Subscription::listen`] immediately replays the current value to the
    /// subscriber, then attaches a live change handler (§4.4).
    #[must_use]
    pub fn subscribe(&self) -> Subscription<S> {
        Subscription { node: self.clone() }
    }

    /// Adapts this façade's changes into a [`futures::Stream`] via whichever
    /// adapter was installed with
    /// [`crate::proxy::LiveProxy::with_observable_adapter`] (§4.4, §9
    /// "optional dependency").
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ObservableAdapterMissing`] if none was
    /// installed.
    pub fn get_observable(&self) -> Result<LocalBoxStream<'static, Value>, UsageError> {
        let adapter = self.core.observable_adapter.borrow().clone().ok_or(UsageError::ObservableAdapterMissing)?;
        Ok(adapter.adapt(self.clone()))
    }

    /// Claims this façade's target for a transaction (`startTransaction()`,
    /// §4.5): waits for any queued mutations already at or under this
    /// target to flush first, then installs the transaction record.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ConflictingTransaction`] if an already-active
    /// transaction overlaps this target.
    pub async fn start_transaction(&self) -> Result<Transaction<S>, UsageError> {
        self.core.start_transaction(self.target.clone()).await
    }

    /// Wraps this façade as an order-maintaining collection (`getOrderedCollection`,
    /// §4.1/C8).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if this façade's value is
    /// not a mapping of child mappings.
    pub fn get_ordered_collection(&self, order_property: Option<String>, increment: Option<f64>) -> Result<OrderedCollection<S>, UsageError> {
        OrderedCollection::new(self.clone(), order_property, increment)
    }

    /// Applies `mutate` to this façade's underlying sequence (treating an
    /// absent value as an empty one) and, if the result actually differs,
    /// flags this façade's own target as wholly overwritten — sequences are
    /// never partially rewritten (§4.1 "sequence mutating operations...apply
    /// to the underlying sequence, then flag the entire sequence target as
    /// overwritten").
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if this façade's value is
    /// a non-composite (only `Array` and absent targets accept sequence
    /// operations).
    fn mutate_sequence<R>(&self, mutate: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R, UsageError> {
        let current = self.materialize();
        let mut items = match current {
            Value::Array(a) => a,
            Value::Null => Vec::new(),
            Value::Map(_) | Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Timestamp(_) | Value::Bytes(_) | Value::Reference(_) => {
                return Err(UsageError::PropertyOfPrimitive {
                    target: self.target.to_string(),
                    key: "<sequence>".to_owned(),
                })
            }
        };
        let result = mutate(&mut items);
        let new_value = Value::Array(items);
        if new_value == current {
            return Ok(result);
        }
        self.core.record_and_apply(&self.target, |cache| {
            let _ = cache.set_at(&self.target, new_value);
        })?;
        Ok(result)
    }

    /// Removes and returns the last element, or `None` if already empty
    /// (`pop`, §4.1/§6).
    ///
    /// # Errors
    ///
    /// See [`Node::mutate_sequence`].
    pub fn pop(&self) -> Result<Option<Value>, UsageError> {
        self.mutate_sequence(Vec::pop)
    }

    /// Removes and returns the first element, or `None` if already empty
    /// (`shift`, §4.1/§6).
    ///
    /// # Errors
    ///
    /// See [`Node::mutate_sequence`].
    pub fn shift(&self) -> Result<Option<Value>, UsageError> {
        self.mutate_sequence(|items| if items.is_empty() { None } else { Some(items.remove(0)) })
    }

    /// Inserts `value` at the front (`unshift`, §4.1/§6).
    ///
    /// # Errors
    ///
    /// See [`Node::mutate_sequence`].
    pub fn unshift(&self, value: Value) -> Result<(), UsageError> {
        self.mutate_sequence(|items| items.insert(0, value))
    }

    /// Removes `delete_count` elements starting at `start` and inserts
    /// `replacements` in their place, returning the removed elements
    /// (`splice`, §4.1/§6). Out-of-range bounds are clamped rather than
    /// panicking.
    ///
    /// # Errors
    ///
    /// See [`Node::mutate_sequence`].
    pub fn splice(&self, start: usize, delete_count: usize, replacements: Vec<Value>) -> Result<Vec<Value>, UsageError> {
        self.mutate_sequence(|items| {
            let start = start.min(items.len());
            let end = start.saturating_add(delete_count).min(items.len());
            items.splice(start..end, replacements).collect()
        })
    }

    /// Sorts this façade's sequence in place by `cmp` (`sort`, §4.1/§6).
    ///
    /// # Errors
    ///
    /// See [`Node::mutate_sequence`].
    pub fn sort(&self, cmp: impl Fn(&Value, &Value) -> std::cmp::Ordering) -> Result<(), UsageError> {
        self.mutate_sequence(|items| items.sort_by(|a, b| cmp(a, b)))
    }

    /// Reverses this façade's sequence in place (`reverse`, §4.1/§6).
    ///
    /// # Errors
    ///
    /// See [`Node::mutate_sequence`].
    pub fn reverse(&self) -> Result<(), UsageError> {
        self.mutate_sequence(|items| items.reverse())
    }
}

/// The `subscribe()` handle returned by [`Node::subscribe`].
pub struct Subscription<S: Store> {
    node: Node<S>,
}

impl<S: Store> Subscription<S> {
    /// Immediately replays the current value to `subscriber`, then attaches
    /// it as a live change handler. Returns a handle for
    /// [`Node::off_changed`].
    pub fn listen(&self, subscriber: impl Fn(&Value) + 'static) -> HandlerId {
        subscriber(&self.node.materialize());
        let shared = Rc::new(subscriber);
        self.node.core.fanout.add(self.node.target.clone(), move |change| {
            shared(&change.value);
            true
        })
    }
}

/// Adapts a [`Node`]'s changes into a reactive stream (§9 "optional
/// dependency" — the core never depends on a concrete implementation).
pub trait ObservableAdapter<S: Store> {
    /// Builds the stream for `node`.
    fn adapt(&self, node: Node<S>) -> LocalBoxStream<'static, Value>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::idgen::MonotonicIdGenerator;
    use crate::memory::MemoryStore;
    use crate::proxy::CreateOptions;

    fn node(initial: Value) -> Node<MemoryStore> {
        let store = MemoryStore::new(initial);
        let core = ProxyCore::for_tests(store, Box::new(MonotonicIdGenerator::new()), CreateOptions::default());
        Node::new(core, Target::root())
    }

    // ── 1. writing an equal value is suppressed (no pending mutation) ──

    #[test]
    fn equal_write_is_suppressed() {
        let n = node(Value::empty_map());
        n.set("a", Value::Number(1.0)).unwrap();
        assert!(!n.core.queue.borrow().is_empty());
        n.core.queue.borrow_mut().take_flushable(&n.core.transactions);
        n.set("a", Value::Number(1.0)).unwrap();
        assert!(n.core.queue.borrow().is_empty());
    }

    // ── 1b. absent-valued map entries are stripped out of an assigned value ─

    #[test]
    fn assigning_a_map_strips_absent_valued_entries() {
        let n = node(Value::empty_map());
        let mut incoming = indexmap::IndexMap::new();
        incoming.insert("x".to_owned(), Value::Number(1.0));
        incoming.insert("y".to_owned(), Value::Null);
        n.set("child", Value::Map(incoming)).unwrap();

        let mut expected = indexmap::IndexMap::new();
        expected.insert("x".to_owned(), Value::Number(1.0));
        assert_eq!(n.child(Key::from("child")).materialize(), Value::Map(expected));
    }

    // ── 2. reading a missing property returns the absent leaf, not an error ─

    #[test]
    fn reading_missing_property_is_absent_not_error() {
        let n = node(Value::empty_map());
        let accessed = n.get("missing").unwrap();
        assert!(matches!(accessed, Accessed::Leaf(Value::Null)));
    }

    // ── 3. reading a property of a primitive is a usage error ──────────

    #[test]
    fn reading_property_of_primitive_errors() {
        let n = node(Value::Number(1.0));
        assert!(n.get("x").is_err());
    }

    // ── 4. push onto a mapping generates a fresh key each time ─────────

    #[test]
    fn push_onto_mapping_generates_fresh_keys() {
        let n = node(Value::empty_map());
        let a = n.push(Value::Number(1.0)).unwrap();
        let b = n.push(Value::Number(2.0)).unwrap();
        assert_ne!(a, b);
    }

    // ── 5. writing through a sequence ancestor flags the sequence itself ─

    #[test]
    fn write_through_sequence_flags_whole_sequence() {
        let n = node(Value::Array(vec![Value::empty_map()]));
        let item = n.child(Key::Index(0));
        item.set("name", Value::String("x".into())).unwrap();
        let queue = n.core.queue.borrow();
        assert_eq!(queue.peek_under(&Target::root()).len(), 1);
        assert_eq!(queue.peek_under(&Target::root())[0].target, Target::root());
    }

    // ── 6. pop/shift/unshift/splice/sort/reverse rewrite the whole sequence ─

    #[test]
    fn pop_removes_last_and_flags_whole_sequence() {
        let n = node(Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]));
        let popped = n.pop().unwrap();
        assert_eq!(popped, Some(Value::Number(2.0)));
        assert_eq!(n.materialize(), Value::Array(vec![Value::Number(1.0)]));
        let queue = n.core.queue.borrow();
        assert_eq!(queue.peek_under(&Target::root())[0].target, Target::root());
    }

    #[test]
    fn shift_removes_first_element() {
        let n = node(Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]));
        let shifted = n.shift().unwrap();
        assert_eq!(shifted, Some(Value::Number(1.0)));
        assert_eq!(n.materialize(), Value::Array(vec![Value::Number(2.0)]));
    }

    #[test]
    fn unshift_inserts_at_front() {
        let n = node(Value::Array(vec![Value::Number(2.0)]));
        n.unshift(Value::Number(1.0)).unwrap();
        assert_eq!(n.materialize(), Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]));
    }

    #[test]
    fn splice_removes_and_inserts_a_range() {
        let n = node(Value::Array(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]));
        let removed = n.splice(1, 1, vec![Value::Number(9.0), Value::Number(10.0)]).unwrap();
        assert_eq!(removed, vec![Value::Number(2.0)]);
        assert_eq!(
            n.materialize(),
            Value::Array(vec![Value::Number(1.0), Value::Number(9.0), Value::Number(10.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn sort_and_reverse_rewrite_in_place() {
        let n = node(Value::Array(vec![Value::Number(3.0), Value::Number(1.0), Value::Number(2.0)]));
        n.sort(|a, b| match (a, b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap(),
            _ => std::cmp::Ordering::Equal,
        })
        .unwrap();
        assert_eq!(
            n.materialize(),
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
        );
        n.reverse().unwrap();
        assert_eq!(
            n.materialize(),
            Value::Array(vec![Value::Number(3.0), Value::Number(2.0), Value::Number(1.0)])
        );
    }

    #[test]
    fn popping_an_empty_sequence_is_suppressed() {
        let n = node(Value::empty_array());
        assert_eq!(n.pop().unwrap(), None);
        assert!(n.core.queue.borrow().is_empty());
    }

    #[test]
    fn sequence_op_on_a_primitive_errors() {
        let n = node(Value::Number(1.0));
        assert!(n.pop().is_err());
    }
}
