// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A `Store` test double that counts `set`/`update` calls and records their
//! payloads, wrapping [`echo_live_proxy::memory::MemoryStore`] for the
//! underlying value bookkeeping.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use echo_live_proxy::memory::{MemoryStore, MemoryStoreError};
use echo_live_proxy::{Context, Cursor, ExternalPath, GetOptions, Key, MutationBatch, Store, StoreSnapshot, UpdatePatch, Value};
use futures::future::{FutureExt, LocalBoxFuture};

/// Cheap to clone (every clone shares the same counters and backing store),
/// so a test can hand one end to `LiveProxy::create` and keep another to
/// inspect what was written.
#[derive(Clone)]
pub struct CountingStore {
    inner: Rc<MemoryStore>,
    set_calls: Rc<Cell<u32>>,
    update_calls: Rc<Cell<u32>>,
    last_set_value: Rc<RefCell<Option<Value>>>,
    last_update_patch: Rc<RefCell<Option<UpdatePatch>>>,
    fail_next_set: Rc<Cell<bool>>,
    fail_next_update: Rc<Cell<bool>>,
}

impl CountingStore {
    pub fn new(root: Value) -> Self {
        Self {
            inner: Rc::new(MemoryStore::new(root)),
            set_calls: Rc::new(Cell::new(0)),
            update_calls: Rc::new(Cell::new(0)),
            last_set_value: Rc::new(RefCell::new(None)),
            last_update_patch: Rc::new(RefCell::new(None)),
            fail_next_set: Rc::new(Cell::new(false)),
            fail_next_update: Rc::new(Cell::new(false)),
        }
    }

    pub fn set_calls(&self) -> u32 {
        self.set_calls.get()
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.get()
    }

    pub fn last_set_value(&self) -> Option<Value> {
        self.last_set_value.borrow().clone()
    }

    pub fn last_update_patch(&self) -> Option<UpdatePatch> {
        self.last_update_patch.borrow().clone()
    }

    pub fn push_remote_mutation(&self, batch: MutationBatch) {
        self.inner.push_remote_mutation(batch);
    }

    pub fn peek(&self, path: &ExternalPath) -> Value {
        self.inner.peek(path)
    }

    /// Makes the very next `set()` call fail instead of reaching the backing
    /// store, so a test can exercise `flush_group`'s rollback-and-continue
    /// path (§4.2 step 8).
    pub fn fail_next_set(&self) {
        self.fail_next_set.set(true);
    }

    /// Makes the very next `update()` call fail instead of reaching the
    /// backing store (§4.2 step 8).
    pub fn fail_next_update(&self) {
        self.fail_next_update.set(true);
    }
}

impl Store for CountingStore {
    type Error = MemoryStoreError;
    type Mutations = <MemoryStore as Store>::Mutations;

    fn get<'a>(&'a self, path: &'a ExternalPath, opts: GetOptions) -> LocalBoxFuture<'a, Result<StoreSnapshot, Self::Error>> {
        self.inner.get(path, opts)
    }

    fn set<'a>(&'a self, path: &'a ExternalPath, value: Value, ctx: Context) -> LocalBoxFuture<'a, Result<Option<Cursor>, Self::Error>> {
        self.set_calls.set(self.set_calls.get() + 1);
        *self.last_set_value.borrow_mut() = Some(value.clone());
        if self.fail_next_set.replace(false) {
            return async move { Err(MemoryStoreError) }.boxed_local();
        }
        self.inner.set(path, value, ctx)
    }

    fn update<'a>(&'a self, path: &'a ExternalPath, patch: UpdatePatch, ctx: Context) -> LocalBoxFuture<'a, Result<Option<Cursor>, Self::Error>> {
        self.update_calls.set(self.update_calls.get() + 1);
        *self.last_update_patch.borrow_mut() = Some(patch.clone());
        if self.fail_next_update.replace(false) {
            return async move { Err(MemoryStoreError) }.boxed_local();
        }
        self.inner.update(path, patch, ctx)
    }

    fn subscribe_mutations(&self, path: &ExternalPath) -> Self::Mutations {
        self.inner.subscribe_mutations(path)
    }

    fn child(&self, path: &ExternalPath, key: &Key) -> ExternalPath {
        self.inner.child(path, key)
    }
}

pub fn map(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
    let mut m = indexmap::IndexMap::new();
    for (k, v) in pairs {
        m.insert(k.to_owned(), v);
    }
    Value::Map(m)
}
