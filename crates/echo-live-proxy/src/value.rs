// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The cache value graph (§3 "Cache value") and the root [`Cache`] cell it
//! lives in (C2).

use indexmap::IndexMap;

use crate::error::UsageError;
use crate::path::{Key, Target};
use crate::store::ExternalPath;

/// One node in the proxied value graph.
///
/// `Null` doubles as the "absent" value for every host kind (§4.1 "Reading a
/// missing property returns the special absent value of the host kind") —
/// there is deliberately no separate `Absent` variant, since nothing in this
/// crate ever needs to distinguish "explicitly null" from "not present";
/// both collapse to the same observable state, matching the source schema's
/// own "null means absent" convention.
///
/// `Timestamp` and `Bytes` are treated as opaque scalars (§9 "Deep cloning")
/// — cloned by value like any other field, never traversed.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / explicit null.
    Null,
    /// Boolean primitive.
    Bool(bool),
    /// Numeric primitive (integers are represented exactly up to 2^53).
    Number(f64),
    /// String primitive.
    String(String),
    /// Opaque millisecond timestamp.
    Timestamp(i64),
    /// Opaque byte buffer.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Insertion-ordered mapping from string key to value.
    Map(IndexMap<String, Value>),
    /// A reference to a node elsewhere in the external store.
    Reference(ExternalPath),
}

/// The broad kind of a [`Value`], used to decide when a cached sub-façade
/// must be discarded because the underlying value changed shape (§4.1
/// "discarded when the kind of the underlying value changes between reads").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `Null` (absent).
    Null,
    /// Any non-composite, non-null leaf.
    Scalar,
    /// `Array`.
    Array,
    /// `Map`.
    Map,
}

impl Value {
    /// The broad kind used for façade identity stability.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Array(_) => ValueKind::Array,
            Self::Map(_) => ValueKind::Map,
            Self::Bool(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Timestamp(_)
            | Self::Bytes(_)
            | Self::Reference(_) => ValueKind::Scalar,
        }
    }

    /// `true` for `Array` and `Map` — the two kinds a façade descends into.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Map(_))
    }

    /// `true` for the absent value.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// An empty map, the container kind a `Key::Str` child needs.
    #[must_use]
    pub fn empty_map() -> Self {
        Self::Map(IndexMap::new())
    }

    /// An empty array, the container kind a `Key::Index` child needs.
    #[must_use]
    pub fn empty_array() -> Self {
        Self::Array(Vec::new())
    }

    /// An empty container of the kind `key` indexes into.
    #[must_use]
    pub fn empty_container_for(key: &Key) -> Self {
        match key {
            Key::Str(_) => Self::empty_map(),
            Key::Index(_) => Self::empty_array(),
        }
    }

    /// Reads the child at `key`, or `None` if this value is not a composite
    /// of the matching kind, or the key is absent.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Self> {
        match (self, key) {
            (Self::Map(m), Key::Str(k)) => m.get(k),
            (Self::Array(a), Key::Index(i)) => a.get(*i),
            _ => None,
        }
    }

    /// Mutably reads the child at `key`.
    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Self> {
        match (self, key) {
            (Self::Map(m), Key::Str(k)) => m.get_mut(k),
            (Self::Array(a), Key::Index(i)) => a.get_mut(*i),
            _ => None,
        }
    }

    /// Walks a (possibly multi-step) relative path under this value.
    #[must_use]
    pub fn walk(&self, keys: &[Key]) -> Option<&Self> {
        let Some((head, rest)) = keys.split_first() else {
            return Some(self);
        };
        self.get(head).and_then(|child| child.walk(rest))
    }

    /// Writes `value` at `key` inside `self`, which must already be a
    /// composite. Sequences grow (filling with `Null`) to fit an
    /// out-of-bounds index, matching ordinary array-assignment semantics.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NonNumericSequenceKey`] when `key` is a string
    /// key on a sequence, or [`UsageError::PropertyOfPrimitive`] when `self`
    /// is not a composite at all.
    pub fn set_key(&mut self, key: &Key, value: Self, target: &Target) -> Result<(), UsageError> {
        match (self, key) {
            (Self::Map(m), Key::Str(k)) => {
                m.insert(k.clone(), value);
                Ok(())
            }
            (Self::Array(a), Key::Index(i)) => {
                if *i >= a.len() {
                    a.resize(*i + 1, Self::Null);
                }
                a[*i] = value;
                Ok(())
            }
            (Self::Array(_), Key::Str(k)) => Err(UsageError::NonNumericSequenceKey {
                target: target.to_string(),
                key: k.clone(),
            }),
            (_, key) => Err(UsageError::PropertyOfPrimitive {
                target: target.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Removes and returns the child at `key`, preserving the remaining
    /// insertion order (map) or index order (sequence shifts down).
    pub fn remove_key(&mut self, key: &Key) -> Option<Self> {
        match (self, key) {
            (Self::Map(m), Key::Str(k)) => m.shift_remove(k),
            (Self::Array(a), Key::Index(i)) if *i < a.len() => Some(a.remove(*i)),
            _ => None,
        }
    }

    /// Recursively strips map entries whose value is absent (`Null`),
    /// leaving sequence elements untouched — a sequence slot holding `Null`
    /// is a real element, not a missing property (§4.1 Writes: "strip
    /// properties whose value is absent" before a written value reaches the
    /// cache).
    #[must_use]
    pub fn stripped_of_absent(self) -> Self {
        match self {
            Self::Map(m) => Self::Map(
                m.into_iter()
                    .filter(|(_, v)| !v.is_absent())
                    .map(|(k, v)| (k, v.stripped_of_absent()))
                    .collect(),
            ),
            Self::Array(a) => Self::Array(a.into_iter().map(Self::stripped_of_absent).collect()),
            other => other,
        }
    }

    /// Children of a composite, in iteration order (insertion order for
    /// maps, index order for sequences); empty for scalars.
    #[must_use]
    pub fn entries(&self) -> Vec<(Key, &Self)> {
        match self {
            Self::Map(m) => m
                .iter()
                .map(|(k, v)| (Key::Str(k.clone()), v))
                .collect(),
            Self::Array(a) => a
                .iter()
                .enumerate()
                .map(|(i, v)| (Key::Index(i), v))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The mutable in-memory value graph rooted at the proxied path (C2).
#[derive(Debug, Default)]
pub struct Cache {
    root: Value,
}

impl Cache {
    /// Builds a cache seeded with `root`.
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Borrows the root value.
    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Replaces the root value wholesale.
    pub fn set_root(&mut self, value: Value) {
        self.root = value;
    }

    /// Deep-clones the value currently at `target`, or `Value::Null` if any
    /// step of the path is missing (the "absent" projection, §4.1).
    #[must_use]
    pub fn at(&self, target: &Target) -> Value {
        self.root.walk(target.keys()).cloned().unwrap_or(Value::Null)
    }

    /// Mutably walks to `target`, returning `None` if any intermediate step
    /// is missing or not a composite. Used by the remote-apply engine, which
    /// must detect this case and trigger a reload (§4.3) rather than create
    /// the missing nodes.
    pub fn child_mut(&mut self, target: &Target) -> Option<&mut Value> {
        let mut cur = &mut self.root;
        for key in target.keys() {
            cur = cur.get_mut(key)?;
        }
        Some(cur)
    }

    /// Mutably walks to `target`'s parent. `None` at the root (no parent) or
    /// if an intermediate step is missing.
    pub fn parent_mut(&mut self, target: &Target) -> Option<(&mut Value, &Key)> {
        let parent = target.parent()?;
        let key = target.last()?;
        let value = self.child_mut(&parent)?;
        Some((value, key))
    }

    /// Writes `value` at `target`, creating intermediate containers along
    /// the way as needed — each missing step becomes a map or a sequence
    /// depending on the kind of the key that indexes into it (§4.1
    /// "progressive construction": writing `a.b.c` when `a` is absent
    /// creates both `a` and `a.b` as empty maps).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::PropertyOfPrimitive`] if an intermediate step
    /// is already present but is a non-composite (writing through a
    /// primitive).
    pub fn set_at(&mut self, target: &Target, value: Self) -> Result<(), UsageError> {
        let Some(parent) = target.parent() else {
            self.root = value;
            return Ok(());
        };
        let key = target.last().expect("non-root target has a last key");
        let mut cur = &mut self.root;
        for k in parent.keys() {
            if cur.is_absent() {
                *cur = Self::empty_container_for(k);
            }
            if cur.get(k).is_none() {
                let _ = cur.set_key(k, Self::Null, target);
            }
            cur = cur
                .get_mut(k)
                .ok_or_else(|| UsageError::PropertyOfPrimitive { target: target.to_string(), key: k.to_string() })?;
        }
        if cur.is_absent() {
            *cur = Self::empty_container_for(key);
        }
        cur.set_key(key, value, target)
    }

    /// Removes the value at `target`, a no-op if any step of the path is
    /// already missing.
    pub fn remove_at(&mut self, target: &Target) -> Option<Self> {
        let parent = target.parent()?;
        let key = target.last()?;
        let parent_value = self.child_mut(&parent)?;
        parent_value.remove_key(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, Value)]) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert((*k).to_owned(), v.clone());
        }
        Value::Map(m)
    }

    // ── 1. reading a missing property returns the absent value ─────────

    #[test]
    fn missing_property_reads_as_null() {
        let cache = Cache::new(map(&[("a", Value::Number(1.0))]));
        let target = Target::new(vec![Key::from("missing")]);
        assert_eq!(cache.at(&target), Value::Null);
    }

    // ── 2. deep equal values are structurally equal regardless of map
    //        insertion order (idempotent-write suppression depends on this) ─

    #[test]
    fn map_equality_ignores_insertion_order() {
        let a = map(&[("a", Value::Number(1.0)), ("b", Value::Number(2.0))]);
        let b = map(&[("b", Value::Number(2.0)), ("a", Value::Number(1.0))]);
        assert_eq!(a, b);
    }

    // ── 3. set_key on a sequence with a string key is a usage error ────

    #[test]
    fn set_non_numeric_key_on_sequence_errors() {
        let mut arr = Value::Array(vec![Value::Number(1.0)]);
        let err = arr
            .set_key(&Key::from("oops"), Value::Number(2.0), &Target::root())
            .unwrap_err();
        assert!(matches!(err, UsageError::NonNumericSequenceKey { .. }));
    }

    // ── 4. set_key on a primitive is a usage error ──────────────────────

    #[test]
    fn set_key_on_primitive_errors() {
        let mut n = Value::Number(1.0);
        let err = n
            .set_key(&Key::from("a"), Value::Number(2.0), &Target::root())
            .unwrap_err();
        assert!(matches!(err, UsageError::PropertyOfPrimitive { .. }));
    }

    // ── 5. remove_key on a sequence shifts remaining elements down ──────

    #[test]
    fn remove_key_on_sequence_shifts_down() {
        let mut arr = Value::Array(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]);
        let removed = arr.remove_key(&Key::Index(1));
        assert_eq!(removed, Some(Value::Number(2.0)));
        assert_eq!(
            arr,
            Value::Array(vec![Value::Number(1.0), Value::Number(3.0)])
        );
    }

    // ── 6. child_mut returns None through a missing intermediate node ──

    #[test]
    fn child_mut_none_through_missing_intermediate() {
        let mut cache = Cache::new(map(&[("a", Value::Number(1.0))]));
        let target = Target::new(vec![Key::from("missing"), Key::from("b")]);
        assert!(cache.child_mut(&target).is_none());
    }

    // ── 7. array assignment past the end grows with Null filler ────────

    #[test]
    fn array_assignment_grows_with_null_filler() {
        let mut arr = Value::Array(vec![Value::Number(1.0)]);
        arr.set_key(&Key::Index(2), Value::Number(9.0), &Target::root())
            .unwrap();
        assert_eq!(
            arr,
            Value::Array(vec![Value::Number(1.0), Value::Null, Value::Number(9.0)])
        );
    }

    // ── 8. set_at creates missing intermediate maps along the way ──────

    #[test]
    fn set_at_creates_missing_intermediates() {
        let mut cache = Cache::new(Value::Null);
        let target = Target::new(vec![Key::from("a"), Key::from("b"), Key::from("c")]);
        cache.set_at(&target, Value::Number(1.0)).unwrap();
        assert_eq!(cache.at(&target), Value::Number(1.0));
        assert_eq!(
            cache.at(&Target::new(vec![Key::from("a")])).kind(),
            ValueKind::Map
        );
    }

    // ── 9. set_at through an existing primitive is a usage error ───────

    #[test]
    fn set_at_through_primitive_errors() {
        let mut cache = Cache::new(map(&[("a", Value::Number(5.0))]));
        let target = Target::new(vec![Key::from("a"), Key::from("b")]);
        let err = cache.set_at(&target, Value::Number(1.0)).unwrap_err();
        assert!(matches!(err, UsageError::PropertyOfPrimitive { .. }));
    }

    // ── 10. remove_at is a no-op through a missing path ─────────────────

    #[test]
    fn remove_at_missing_path_is_noop() {
        let mut cache = Cache::new(map(&[]));
        let target = Target::new(vec![Key::from("missing"), Key::from("b")]);
        assert_eq!(cache.remove_at(&target), None);
    }
}
