// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The remote-apply engine (C5): folds inbound store mutation batches into
//! the cache, filtering out echoes of this proxy's own writes (§4.3).

use crate::store::{Change, ProxyId, SnapshotContext};
use crate::value::Cache;

/// `true` if `context` carries our own [`ProxyId`] — a write we issued
/// ourselves looping back through the store's subscription, which must never
/// be re-applied or re-fired (§3, §4.3 step 1).
#[must_use]
pub fn is_own_echo(context: &SnapshotContext, own: ProxyId) -> bool {
    context.proxy == Some(own)
}

/// The result of folding an inbound batch into the cache.
pub enum ApplyOutcome {
    /// Every mutation applied cleanly; carries the changes actually made, in
    /// arrival order.
    Applied(Vec<Change>),
    /// A mutation's parent path no longer exists in the cache — the cache
    /// has fallen out of sync and must be discarded via `reload()` (§4.3
    /// step 3, "missing intermediate node").
    NeedsReload,
}

/// Applies every mutation in `mutations` to `cache`, in order, stopping at
/// the first one whose parent path is missing.
#[must_use]
pub fn apply_batch(cache: &mut Cache, mutations: &[Change]) -> ApplyOutcome {
    let mut applied = Vec::with_capacity(mutations.len());
    for change in mutations {
        match apply_one(cache, change) {
            Some(()) => applied.push(change.clone()),
            None => return ApplyOutcome::NeedsReload,
        }
    }
    ApplyOutcome::Applied(applied)
}

fn apply_one(cache: &mut Cache, change: &Change) -> Option<()> {
    if change.target.is_root() {
        cache.set_root(change.value.clone());
        return Some(());
    }
    let parent = change.target.parent()?;
    let key = change.target.last()?.clone();
    let parent_value = cache.child_mut(&parent)?;
    if change.value.is_absent() {
        let _ = parent_value.remove_key(&key);
    } else {
        parent_value.set_key(&key, change.value.clone(), &change.target).ok()?;
    }
    Some(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::path::{Key, Target};
    use crate::value::Value;
    use indexmap::IndexMap;

    fn map(pairs: &[(&str, Value)]) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert((*k).to_owned(), v.clone());
        }
        Value::Map(m)
    }

    // ── 1. own echo is recognized by matching proxy id ──────────────────

    #[test]
    fn own_echo_matches_context_proxy_id() {
        let ctx = SnapshotContext { proxy: Some(ProxyId(7)), ..SnapshotContext::default() };
        assert!(is_own_echo(&ctx, ProxyId(7)));
        assert!(!is_own_echo(&ctx, ProxyId(8)));
    }

    // ── 2. a clean batch applies every mutation to the cache ───────────

    #[test]
    fn applies_a_clean_batch() {
        let mut cache = Cache::new(map(&[("user", map(&[("name", Value::String("Ada".into()))]))]));
        let target = Target::new(vec![Key::from("user"), Key::from("name")]);
        let mutations = vec![Change {
            target: target.clone(),
            value: Value::String("Grace".into()),
            previous: Value::String("Ada".into()),
        }];
        match apply_batch(&mut cache, &mutations) {
            ApplyOutcome::Applied(applied) => assert_eq!(applied.len(), 1),
            ApplyOutcome::NeedsReload => panic!("expected a clean apply"),
        }
        assert_eq!(cache.at(&target), Value::String("Grace".into()));
    }

    // ── 3. a mutation under a missing parent triggers a reload ─────────

    #[test]
    fn missing_intermediate_node_triggers_reload() {
        let mut cache = Cache::new(map(&[]));
        let target = Target::new(vec![Key::from("missing"), Key::from("name")]);
        let mutations = vec![Change { target, value: Value::String("x".into()), previous: Value::Null }];
        assert!(matches!(apply_batch(&mut cache, &mutations), ApplyOutcome::NeedsReload));
    }

    // ── 4. a root replacement overwrites the whole cache ────────────────

    #[test]
    fn root_replacement_overwrites_cache() {
        let mut cache = Cache::new(Value::Number(1.0));
        let mutations = vec![Change { target: Target::root(), value: Value::Number(2.0), previous: Value::Number(1.0) }];
        let _ = apply_batch(&mut cache, &mutations);
        assert_eq!(cache.root(), &Value::Number(2.0));
    }
}
