// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The public proxy façade (C9): wires the cache, mutation queue, remote
//! apply engine, event fanout, and transaction controller together behind
//! one `LiveProxy` handle (§4, §6).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::channel::oneshot;
use futures::stream::StreamExt as _;
use tracing::{debug, warn};

use crate::access::{Node, ObservableAdapter};
use crate::error::{ErrorSource, UsageError};
use crate::events::{Change as EventChange, ErrorEvent, HandlerId, InternalBatch, MutationEvent, Origin, PublicEvents};
use crate::idgen::IdGenerator;
use crate::path::Target;
use crate::queue::{apply_ancestor_dominance, group_for_flush, FlushGroup, MutationQueue};
use crate::remote::{self, ApplyOutcome};
use crate::scheduler::Scheduler;
use crate::store::{CacheMode, Context, Cursor, ExternalPath, GetOptions, Store, WriteSource};
use crate::transaction::{Transaction, TransactionController};
use crate::value::{Cache, Value, ValueKind};

/// Configuration for [`LiveProxy::create`] (§6).
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// The value to seed the store with (via a single `Default`-sourced
    /// write) if `get()` reports the path absent at creation time.
    pub default_value: Option<Value>,
}

/// The shared, reference-counted state backing every [`Node`] and
/// [`Transaction`] façade over one proxied path.
pub struct ProxyCore<S: Store> {
    store: S,
    root_path: ExternalPath,
    proxy_id: crate::store::ProxyId,
    pub(crate) cache: RefCell<Cache>,
    pub(crate) queue: RefCell<MutationQueue>,
    pub(crate) transactions: TransactionController,
    pub(crate) events: PublicEvents,
    pub(crate) fanout: crate::events::SubtreeFanout,
    scheduler: Scheduler,
    pub(crate) id_gen: Box<dyn IdGenerator>,
    pub(crate) observable_adapter: RefCell<Option<Rc<dyn ObservableAdapter<S>>>>,
    destroyed: Cell<bool>,
    flush_scheduled: Cell<bool>,
    flush_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    cursor: RefCell<Option<Cursor>>,
}

impl<S: Store> ProxyCore<S> {
    /// Builds a core pre-populated with `initial`, without touching the
    /// store or spawning the remote-apply subscription — the construction
    /// path used directly by this crate's own unit tests, which exercise
    /// the cache/queue/events machinery in isolation.
    #[cfg(test)]
    #[must_use]
    pub fn for_tests(store: S, id_gen: Box<dyn IdGenerator>, _opts: CreateOptions) -> Rc<Self> {
        let root_path = ExternalPath(String::new());
        let initial = futures::executor::block_on(store.get(&root_path, GetOptions::default()))
            .map(|snapshot| snapshot.value)
            .unwrap_or(Value::Null);
        Rc::new(Self {
            store,
            root_path,
            proxy_id: crate::store::ProxyId(0),
            cache: RefCell::new(Cache::new(initial)),
            queue: RefCell::new(MutationQueue::default()),
            transactions: TransactionController::default(),
            events: PublicEvents::default(),
            fanout: crate::events::SubtreeFanout::default(),
            scheduler: Scheduler::new(),
            id_gen,
            observable_adapter: RefCell::new(None),
            destroyed: Cell::new(false),
            flush_scheduled: Cell::new(false),
            flush_waiters: RefCell::new(Vec::new()),
            cursor: RefCell::new(None),
        })
    }

    pub(crate) fn cache_at(&self, target: &Target) -> Value {
        self.cache.borrow().at(target)
    }

    pub(crate) fn external_path_for(&self, target: &Target) -> ExternalPath {
        target.keys().iter().fold(self.root_path.clone(), |path, key| self.store.child(&path, key))
    }

    /// Resolves which target a write through `literal` must be flagged
    /// against: the outermost ancestor (including `literal` itself) whose
    /// current value is a sequence, since sequences are always rewritten
    /// whole rather than index-by-index (§4.1 "ancestor sequence flagging").
    pub(crate) fn resolve_flag_target(&self, literal: &Target) -> Target {
        let keys = literal.keys();
        for i in 0..keys.len() {
            let prefix = Target::new(keys[..i].to_vec());
            if self.cache_at(&prefix).kind() == ValueKind::Array {
                return prefix;
            }
        }
        literal.clone()
    }

    /// Flags `flag_target` (capturing `previous` the first time this tick),
    /// applies `mutate` to the live cache, and ensures a flush is scheduled.
    pub(crate) fn record_and_apply(self: &Rc<Self>, flag_target: &Target, mutate: impl FnOnce(&mut Cache)) -> Result<(), UsageError> {
        if self.destroyed.get() {
            return Err(UsageError::Destroyed);
        }
        {
            let cache = &self.cache;
            let target = flag_target.clone();
            self.queue.borrow_mut().flag_if_new(&target, || cache.borrow().at(&target));
        }
        mutate(&mut self.cache.borrow_mut());
        self.schedule_flush();
        Ok(())
    }

    /// Replays a rolled-back mutation's `previous` value into the cache and
    /// fires a local `mutation` event for it (§4.5 rollback).
    pub(crate) fn replay_previous(self: &Rc<Self>, mutation: &crate::queue::PendingMutation) {
        let mut cache = self.cache.borrow_mut();
        if mutation.target.is_root() {
            cache.set_root(mutation.previous.clone());
        } else if mutation.previous.is_absent() {
            let _ = cache.remove_at(&mutation.target);
        } else {
            let _ = cache.set_at(&mutation.target, mutation.previous.clone());
        }
        drop(cache);
        self.emit_local_mutation(EventChange { target: mutation.target.clone(), value: mutation.previous.clone(), previous: self.cache_at(&mutation.target) });
    }

    /// Ensures exactly one flush task is pending (§4.2, §5 "deferred flush").
    pub(crate) fn schedule_flush(self: &Rc<Self>) {
        if self.flush_scheduled.get() {
            return;
        }
        self.flush_scheduled.set(true);
        let core = Rc::clone(self);
        self.scheduler.schedule(Box::pin(async move {
            core.run_flush().await;
        }));
    }

    /// Schedules a flush if needed and returns a future that resolves once
    /// the next flush cycle completes — used by `commit()` and
    /// `startTransaction()`'s pre-flush wait.
    pub(crate) fn schedule_flush_and_wait(self: &Rc<Self>) -> impl std::future::Future<Output = ()> {
        let (tx, rx) = oneshot::channel();
        self.flush_waiters.borrow_mut().push(tx);
        self.schedule_flush();
        async move {
            let _ = rx.await;
        }
    }

    async fn run_flush(self: Rc<Self>) {
        let working = {
            let mut queue = self.queue.borrow_mut();
            queue.take_flushable(&self.transactions)
        };

        if !working.is_empty() {
            let dominant = apply_ancestor_dominance(working);
            let resolved: Vec<_> = dominant
                .into_iter()
                .map(|mut m| {
                    m.value = Some(self.cache_at(&m.target));
                    m
                })
                .collect();

            for m in &resolved {
                self.emit_local_mutation(EventChange {
                    target: m.target.clone(),
                    value: m.value.clone().unwrap_or(Value::Null),
                    previous: m.previous.clone(),
                });
            }

            for group in group_for_flush(resolved) {
                self.flush_group(group).await;
            }
        }

        self.flush_scheduled.set(false);
        for waiter in self.flush_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(());
        }

        // A handler invoked from the emit loop above (or a store call that
        // yielded control) may have queued a fresh mutation while
        // `flush_scheduled` was still `true`, in which case its own
        // `schedule_flush` call saw a flush already pending and skipped
        // scheduling one of its own. Pick that up here, now that the flag is
        // clear, so it still lands in the *next* tick rather than being
        // stranded (§4.2 "mutations queued while a flush is in-progress are
        // flushed in the next flush cycle").
        if self.queue.borrow().has_flushable(&self.transactions) {
            self.schedule_flush();
        }
    }

    async fn flush_group(self: &Rc<Self>, group: FlushGroup) {
        let ctx = Context { proxy_id: self.proxy_id, source: WriteSource::Update };
        let result = match &group {
            FlushGroup::Root { value, .. } => self.store.set(&self.root_path, value.clone(), ctx).await,
            FlushGroup::Fields { parent, patch } => {
                let path = self.external_path_for(parent);
                self.store.update(&path, patch.clone(), ctx).await
            }
        };

        match result {
            Ok(cursor) => {
                if let Some(cursor) = cursor {
                    *self.cursor.borrow_mut() = Some(cursor.clone());
                    self.events.cursor.emit(&cursor.0);
                }
            }
            Err(err) => {
                warn!(error = %err, "flush group failed, rolling back");
                self.rollback_group(&group);
                self.events.error.emit(&ErrorEvent {
                    source: ErrorSource::Flush,
                    message: "a flush group failed and was rolled back".to_owned(),
                    details: Some(err.to_string()),
                });
            }
        }
    }

    fn rollback_group(self: &Rc<Self>, group: &FlushGroup) {
        match group {
            FlushGroup::Root { previous, .. } => {
                let target = Target::root();
                self.cache.borrow_mut().set_root(previous.clone());
                self.emit_local_mutation(EventChange { target: target.clone(), value: previous.clone(), previous: self.cache_at(&target) });
            }
            FlushGroup::Fields { parent, patch } => {
                for (key, change) in patch.0.iter().rev() {
                    let target = parent.child(key.clone());
                    let mut cache = self.cache.borrow_mut();
                    if change.previous.is_absent() {
                        let _ = cache.remove_at(&target);
                    } else {
                        let _ = cache.set_at(&target, change.previous.clone());
                    }
                    drop(cache);
                    self.emit_local_mutation(EventChange { target, value: change.previous.clone(), previous: change.value.clone() });
                }
            }
        }
    }

    fn emit_local_mutation(self: &Rc<Self>, change: EventChange) {
        debug!(target = %change.target, "local mutation");
        self.emit_mutation_and_fanout(change, false, Origin::Local, crate::store::SnapshotContext::default());
    }

    /// Emits the public `mutation` event for `change` and delivers it to the
    /// subtree fanout, catching any panicking subscriber callback and
    /// re-emitting it as an `error` event instead of letting it escape or
    /// abort delivery to the remaining subscribers (§7 "Callback errors").
    fn emit_mutation_and_fanout(self: &Rc<Self>, change: EventChange, is_remote: bool, origin: Origin, context: crate::store::SnapshotContext) {
        let callback_source = if is_remote { ErrorSource::RemoteUpdate } else { ErrorSource::LocalUpdate };
        self.events.mutation.emit_guarded(&MutationEvent { snapshot: change.clone(), is_remote }, |message| {
            self.events.error.emit(&ErrorEvent { source: callback_source, message: "mutation subscriber panicked".to_owned(), details: Some(message) });
        });
        let batch = InternalBatch { mutations: vec![change], origin, context };
        let current = |t: &Target| self.cache_at(t);
        self.fanout.deliver(&batch, self.proxy_id, &current, |message| {
            self.events.error.emit(&ErrorEvent {
                source: ErrorSource::MutationCallback,
                message: "subtree change handler panicked".to_owned(),
                details: Some(message),
            });
        });
    }

    pub(crate) async fn start_transaction(self: &Rc<Self>, target: Target) -> Result<Transaction<S>, UsageError> {
        if self.destroyed.get() {
            return Err(UsageError::Destroyed);
        }
        if self.transactions.conflicts(&target) {
            return Err(UsageError::ConflictingTransaction { target: target.to_string() });
        }
        if !self.queue.borrow().peek_under(&target).is_empty() {
            self.schedule_flush_and_wait().await;
        }
        self.transactions.start(target.clone())?;
        Ok(Transaction::new(Rc::clone(self), target))
    }

    /// Re-fetches this proxy's root value from the store, discarding the
    /// current cache (§4.3 "`reload()`").
    pub(crate) async fn reload(self: &Rc<Self>) {
        let result = self.store.get(&self.root_path, GetOptions { cache_mode: CacheMode::Reload, cache_cursor: None }).await;
        match result {
            Ok(snapshot) => {
                let previous = self.cache.borrow().root().clone();
                self.cache.borrow_mut().set_root(snapshot.value.clone());
                if let Some(cursor) = snapshot.context.cursor {
                    *self.cursor.borrow_mut() = Some(cursor);
                }
                let change = EventChange { target: Target::root(), value: snapshot.value, previous };
                self.emit_mutation_and_fanout(change, false, Origin::Local, snapshot.context);
            }
            Err(err) => {
                self.events.error.emit(&ErrorEvent {
                    source: ErrorSource::Consistency,
                    message: "reload failed".to_owned(),
                    details: Some(err.to_string()),
                });
            }
        }
    }

    fn spawn_remote_apply(self: &Rc<Self>) {
        let core = Rc::clone(self);
        let mut stream = Box::pin(self.store.subscribe_mutations(&self.root_path));
        self.scheduler.schedule(Box::pin(async move {
            while let Some(batch) = stream.next().await {
                if core.destroyed.get() {
                    break;
                }
                if remote::is_own_echo(&batch.context, core.proxy_id) {
                    continue;
                }
                let outcome = {
                    let mut cache = core.cache.borrow_mut();
                    remote::apply_batch(&mut cache, &batch.mutations)
                };
                match outcome {
                    ApplyOutcome::Applied(applied) => {
                        for change in &applied {
                            core.events.mutation.emit_guarded(&MutationEvent { snapshot: change.clone(), is_remote: true }, |message| {
                                core.events.error.emit(&ErrorEvent { source: ErrorSource::RemoteUpdate, message: "mutation subscriber panicked".to_owned(), details: Some(message) });
                            });
                        }
                        if let Some(cursor) = &batch.context.cursor {
                            *core.cursor.borrow_mut() = Some(cursor.clone());
                            core.events.cursor.emit(&cursor.0);
                        }
                        let internal = InternalBatch { mutations: applied, origin: Origin::Remote, context: batch.context };
                        let current = |t: &Target| core.cache_at(t);
                        core.fanout.deliver(&internal, core.proxy_id, &current, |message| {
                            core.events.error.emit(&ErrorEvent {
                                source: ErrorSource::MutationCallback,
                                message: "subtree change handler panicked".to_owned(),
                                details: Some(message),
                            });
                        });
                    }
                    ApplyOutcome::NeedsReload => {
                        warn!("remote mutation referenced a missing cache node, reloading");
                        core.reload().await;
                    }
                }
            }
        }));
    }
}

/// The public live-sync proxy over one external-store path (§6, C9).
pub struct LiveProxy<S: Store> {
    core: Rc<ProxyCore<S>>,
}

impl<S: Store> Clone for LiveProxy<S> {
    fn clone(&self) -> Self {
        Self { core: Rc::clone(&self.core) }
    }
}

impl<S: Store> LiveProxy<S> {
    /// Creates a proxy over `path`: fetches the current value, seeding it
    /// with `opts.default_value` if absent, then starts the remote-apply
    /// subscription (§4, §6).
    pub async fn create(store: S, path: ExternalPath, proxy_id: crate::store::ProxyId, id_gen: Box<dyn IdGenerator>, opts: CreateOptions) -> Result<Self, S::Error> {
        let snapshot = store.get(&path, GetOptions { cache_mode: CacheMode::AllowCached, cache_cursor: None }).await?;
        let mut value = snapshot.value;
        let mut seeded_cursor = snapshot.context.cursor;

        if value.is_absent() {
            if let Some(default_value) = opts.default_value {
                let ctx = Context { proxy_id, source: WriteSource::Default };
                seeded_cursor = store.set(&path, default_value.clone(), ctx).await?;
                value = default_value;
            }
        }

        let core = Rc::new(ProxyCore {
            store,
            root_path: path,
            proxy_id,
            cache: RefCell::new(Cache::new(value)),
            queue: RefCell::new(MutationQueue::default()),
            transactions: TransactionController::default(),
            events: PublicEvents::default(),
            fanout: crate::events::SubtreeFanout::default(),
            scheduler: Scheduler::new(),
            id_gen,
            observable_adapter: RefCell::new(None),
            destroyed: Cell::new(false),
            flush_scheduled: Cell::new(false),
            flush_waiters: RefCell::new(Vec::new()),
            cursor: RefCell::new(seeded_cursor),
        });
        core.spawn_remote_apply();
        Ok(Self { core })
    }

    /// Installs the optional reactive-stream adapter backing `get_observable()`.
    #[must_use]
    pub fn with_observable_adapter(self, adapter: Rc<dyn ObservableAdapter<S>>) -> Self {
        *self.core.observable_adapter.borrow_mut() = Some(adapter);
        self
    }

    /// The root façade over the proxied value (`proxy.value`'s accessor,
    /// §6).
    #[must_use]
    pub fn root(&self) -> Node<S> {
        Node::new(Rc::clone(&self.core), Target::root())
    }

    /// The whole proxied value, materialized (§6 `value` getter).
    #[must_use]
    pub fn value(&self) -> Value {
        self.root().materialize()
    }

    /// Replaces the whole proxied value (§6 `value` setter).
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::Destroyed`] if this proxy was already destroyed.
    pub fn set_value(&self, value: Value) -> Result<(), UsageError> {
        self.root().set_value(value)
    }

    /// `true` if the proxied value is not absent.
    #[must_use]
    pub fn has_value(&self) -> bool {
        !self.value().is_absent()
    }

    /// The external store's latest sync token this proxy has observed.
    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        self.core.cursor.borrow().clone()
    }

    /// Re-fetches the root value, discarding the current cache (§4.3).
    pub async fn reload(&self) {
        self.core.reload().await;
    }

    /// Registers a `cursor` event handler.
    pub fn on_cursor(&self, callback: impl Fn(&String) + 'static) -> HandlerId {
        self.core.events.cursor.on(callback)
    }

    /// Registers a `mutation` event handler (multi-handler surface, §6).
    pub fn on_mutation_event(&self, callback: impl Fn(&MutationEvent) + 'static) -> HandlerId {
        self.core.events.mutation.on(callback)
    }

    /// Registers an `error` event handler (multi-handler surface, §6, §7).
    pub fn on_error_event(&self, callback: impl Fn(&ErrorEvent) + 'static) -> HandlerId {
        self.core.events.error.on(callback)
    }

    /// `onMutation(cb)`: the legacy single-handler surface (§9 Open Question
    /// 3).
    pub fn on_mutation(&self, callback: impl Fn(&MutationEvent) + 'static) {
        self.core.events.on_mutation(callback);
    }

    /// `onError(cb)`: the legacy single-handler surface.
    pub fn on_error(&self, callback: impl Fn(&ErrorEvent) + 'static) {
        self.core.events.on_error(callback);
    }

    /// Removes a handler previously returned by `on_cursor`,
    /// `on_mutation_event`, or `on_error_event`. Harmless no-op for a stale
    /// id.
    pub fn off_cursor(&self, id: HandlerId) {
        self.core.events.cursor.off(id);
    }

    /// Stops the remote-apply subscription and rejects any further writes
    /// (`destroy()`/`stop()`, §5 "cancellation"). Any transaction still open
    /// is implicitly committed — its claim is released and its queued
    /// mutations join the final flush — rather than rolled back (§9 decided
    /// Open Question). Awaits that final flush, then clears every
    /// `cursor`/`mutation`/`error` and subtree `onChanged` handler.
    pub async fn destroy(&self) {
        self.core.destroyed.set(true);
        self.core.transactions.finish_all();
        self.core.schedule_flush_and_wait().await;
        self.core.events.clear();
        self.core.fanout.clear();
    }

    /// Alias for [`LiveProxy::destroy`].
    pub async fn stop(&self) {
        self.destroy().await;
    }

    /// `true` once [`LiveProxy::destroy`] has been called.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.core.destroyed.get()
    }

    /// Runs one tick of the cooperative scheduler driving this proxy's
    /// deferred flush/remote-apply tasks (§5).
    pub fn run_until_stalled(&self) {
        self.core.scheduler.run_until_stalled();
    }
}
