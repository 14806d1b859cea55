// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory [`Store`] implementation.
//!
//! [`MemoryStore`] is a real, usable `Store` — sufficient for embedding this
//! crate in a single process with no persistence — and doubles as the test
//! double this crate's own unit and integration tests build proxies against,
//! the same way `echo-cas::MemoryTier` serves both roles for its own trait.

use std::cell::RefCell;

use futures::channel::mpsc;
use futures::future::{FutureExt as _, LocalBoxFuture};

use crate::path::{Key, Target};
use crate::store::{Context, Cursor, ExternalPath, GetOptions, MutationBatch, SnapshotContext, Store, StoreSnapshot, UpdatePatch};
use crate::value::{Cache, Value};

/// [`MemoryStore`]'s error type. Nothing in this store can actually fail —
/// it exists so `Store::Error` has a concrete, displayable type to carry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("memory store operation failed unexpectedly")]
pub struct MemoryStoreError;

fn path_to_target(path: &ExternalPath) -> Target {
    if path.0.is_empty() {
        return Target::root();
    }
    let keys = path
        .0
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| segment.parse::<usize>().map_or_else(|_| Key::from(segment), Key::Index))
        .collect();
    Target::new(keys)
}

/// A single-process, in-memory `Store`. Remote mutations are injected by a
/// test or embedding host via [`MemoryStore::push_remote_mutation`] — this
/// store has no transport of its own (§1 "Out of scope").
pub struct MemoryStore {
    cache: RefCell<Cache>,
    mutations: RefCell<Option<mpsc::UnboundedSender<MutationBatch>>>,
}

impl MemoryStore {
    /// Builds a store seeded with `root`.
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self { cache: RefCell::new(Cache::new(root)), mutations: RefCell::new(None) }
    }

    /// Delivers `batch` to whichever `subscribe_mutations` stream is
    /// currently live, simulating an inbound remote write. A no-op if
    /// nothing has subscribed yet.
    pub fn push_remote_mutation(&self, batch: MutationBatch) {
        if let Some(tx) = self.mutations.borrow().as_ref() {
            let _ = tx.unbounded_send(batch);
        }
    }

    /// The store's current value at `path`, for test assertions.
    #[must_use]
    pub fn peek(&self, path: &ExternalPath) -> Value {
        self.cache.borrow().at(&path_to_target(path))
    }
}

impl Store for MemoryStore {
    type Error = MemoryStoreError;
    type Mutations = mpsc::UnboundedReceiver<MutationBatch>;

    fn get<'a>(&'a self, path: &'a ExternalPath, _opts: GetOptions) -> LocalBoxFuture<'a, Result<StoreSnapshot, Self::Error>> {
        let value = self.cache.borrow().at(&path_to_target(path));
        async move { Ok(StoreSnapshot { value, context: SnapshotContext::default() }) }.boxed_local()
    }

    fn set<'a>(&'a self, path: &'a ExternalPath, value: Value, _ctx: Context) -> LocalBoxFuture<'a, Result<Option<Cursor>, Self::Error>> {
        let target = path_to_target(path);
        if target.is_root() {
            self.cache.borrow_mut().set_root(value);
        } else {
            let _ = self.cache.borrow_mut().set_at(&target, value);
        }
        async move { Ok(None) }.boxed_local()
    }

    fn update<'a>(&'a self, path: &'a ExternalPath, patch: UpdatePatch, _ctx: Context) -> LocalBoxFuture<'a, Result<Option<Cursor>, Self::Error>> {
        let parent = path_to_target(path);
        let mut cache = self.cache.borrow_mut();
        for (key, change) in patch.0 {
            let target = parent.child(key);
            if change.value.is_absent() {
                let _ = cache.remove_at(&target);
            } else {
                let _ = cache.set_at(&target, change.value);
            }
        }
        async move { Ok(None) }.boxed_local()
    }

    fn subscribe_mutations(&self, _path: &ExternalPath) -> Self::Mutations {
        let (tx, rx) = mpsc::unbounded();
        *self.mutations.borrow_mut() = Some(tx);
        rx
    }

    fn child(&self, path: &ExternalPath, key: &Key) -> ExternalPath {
        let segment = match key {
            Key::Str(s) => s.clone(),
            Key::Index(i) => i.to_string(),
        };
        if path.0.is_empty() {
            ExternalPath(segment)
        } else {
            ExternalPath(format!("{}/{segment}", path.0))
        }
    }
}
