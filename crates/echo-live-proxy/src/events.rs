// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription fanout (C6): the public emitter consumers register
//! `cursor`/`mutation`/`error` handlers on, and the internal per-subtree
//! change-listener fanout used by `onChanged`/`subscribe`/`observe`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::warn;

use crate::path::Target;
use crate::store::{Change, ProxyId, SnapshotContext};
use crate::value::Value;

/// Extracts a human-readable message from a caught panic payload, falling
/// back to a generic description for payloads that aren't a `&str`/`String`
/// (the two forms `panic!`/`.unwrap()` actually produce).
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "subscriber callback panicked with a non-string payload".to_owned()
    }
}

/// A registration handle returned by [`Emitter::on`]; pass to
/// [`Emitter::off`] to remove just that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A minimal multi-handler event emitter (§4.4 "Public emitter").
pub struct Emitter<T> {
    handlers: RefCell<Vec<(HandlerId, Rc<dyn Fn(&T)>)>>,
    next_id: Cell<u64>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<T> Emitter<T> {
    /// Registers `callback`, returning a handle for later removal.
    pub fn on(&self, callback: impl Fn(&T) + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Removes a previously registered handler. A no-op if `id` is stale.
    pub fn off(&self, id: HandlerId) {
        self.handlers.borrow_mut().retain(|(h, _)| *h != id);
    }

    /// Invokes every registered handler with `value`. A handler that panics
    /// is caught and logged, never allowed to escape into this crate's own
    /// control flow or skip the remaining handlers — see [`Emitter::emit_guarded`]
    /// for callers that need to turn the panic into an `error` event instead.
    pub fn emit(&self, value: &T) {
        self.emit_guarded(value, |message| warn!(message, "subscriber callback panicked"));
    }

    /// Invokes every registered handler with `value`, reporting any panic to
    /// `on_panic` instead of just logging it (§7 "Callback errors": thrown by
    /// user subscription callbacks, caught and re-emitted as `error` events
    /// rather than escaping into this crate's control flow).
    pub fn emit_guarded(&self, value: &T, mut on_panic: impl FnMut(String)) {
        // Snapshot the handler list before invoking: a handler that
        // registers or removes another handler during emission must not
        // observe a torn `handlers` borrow.
        let snapshot: Vec<_> = self.handlers.borrow().iter().map(|(_, cb)| Rc::clone(cb)).collect();
        for cb in snapshot {
            let call = std::panic::AssertUnwindSafe(|| cb(value));
            if let Err(payload) = std::panic::catch_unwind(call) {
                on_panic(panic_message(&payload));
            }
        }
    }

    /// `true` if no handlers are currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Removes every registered handler (`destroy()`'s "clears public event
    /// handlers", §4.7 step 6).
    pub fn clear(&self) {
        self.handlers.borrow_mut().clear();
    }
}

/// The `mutation` event payload (§6).
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// The changed target, its previous value, and its new value.
    pub snapshot: Change,
    /// `true` if this mutation originated from the remote-apply engine
    /// rather than this proxy's own flush.
    pub is_remote: bool,
}

/// The `error` event payload (§6, §7).
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Where the error originated.
    pub source: crate::error::ErrorSource,
    /// A human-readable message.
    pub message: String,
    /// Optional extra detail (e.g. the store's own error, stringified).
    pub details: Option<String>,
}

/// Whether a batch of mutations originated from this proxy's own flush or
/// from the remote-apply engine (§4.2 step 3, §4.3 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This proxy's own flush.
    Local,
    /// The remote-apply engine.
    Remote,
}

/// A batch delivered to the internal subtree-listener fanout.
#[derive(Debug, Clone)]
pub struct InternalBatch {
    /// The mutations in this batch.
    pub mutations: Vec<Change>,
    /// Where the batch came from.
    pub origin: Origin,
    /// Context carried with the batch (used for feedback prevention).
    pub context: SnapshotContext,
}

/// The public three-event emitter, plus the legacy single-handler surface
/// (§9 Open Question 3: the two surfaces are independent — replacing the
/// legacy handler never touches handlers registered via `on`/`off`, and
/// vice versa; the legacy slot is simply one more `on()` registration this
/// struct tracks the id of so it can replace it).
#[derive(Default)]
pub struct PublicEvents {
    /// `cursor` event: the external store's latest sync token.
    pub cursor: Emitter<String>,
    /// `mutation` event: one per applied change.
    pub mutation: Emitter<MutationEvent>,
    /// `error` event: asynchronous faults (§7).
    pub error: Emitter<ErrorEvent>,
    legacy_mutation: RefCell<Option<HandlerId>>,
    legacy_error: RefCell<Option<HandlerId>>,
}

impl PublicEvents {
    /// Clears every registered handler on all three event streams, including
    /// the legacy slots (`destroy()`'s "clears public event handlers", §4.7
    /// step 6).
    pub fn clear(&self) {
        self.cursor.clear();
        self.mutation.clear();
        self.error.clear();
        *self.legacy_mutation.borrow_mut() = None;
        *self.legacy_error.borrow_mut() = None;
    }

    /// `onMutation(cb)`: replaces any previously registered legacy mutation
    /// handler.
    pub fn on_mutation(&self, callback: impl Fn(&MutationEvent) + 'static) {
        if let Some(old) = self.legacy_mutation.borrow_mut().take() {
            self.mutation.off(old);
        }
        let id = self.mutation.on(callback);
        *self.legacy_mutation.borrow_mut() = Some(id);
    }

    /// `onError(cb)`: replaces any previously registered legacy error
    /// handler.
    pub fn on_error(&self, callback: impl Fn(&ErrorEvent) + 'static) {
        if let Some(old) = self.legacy_error.borrow_mut().take() {
            self.error.off(old);
        }
        let id = self.error.on(callback);
        *self.legacy_error.borrow_mut() = Some(id);
    }
}

/// A change projected for a subtree listener: the new and previous value at
/// exactly that listener's target (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedChange {
    /// The new value at the listener's target.
    pub value: Value,
    /// The value at the listener's target before this batch.
    pub previous: Value,
}

type ChangeCallback = dyn Fn(&ProjectedChange) -> bool;

struct ChangeHandler {
    target: Target,
    callback: Rc<ChangeCallback>,
}

/// The internal per-subtree change-listener fanout backing
/// `onChanged`/`subscribe`/`observe` (§4.4).
#[derive(Default)]
pub struct SubtreeFanout {
    handlers: RefCell<Vec<(HandlerId, ChangeHandler)>>,
    next_id: Cell<u64>,
}

impl SubtreeFanout {
    /// Registers a change handler for `target`. The callback is invoked
    /// with the projected new/previous value whenever a qualifying batch
    /// arrives; returning `false` auto-detaches it (§4.4).
    pub fn add(&self, target: Target, callback: impl Fn(&ProjectedChange) -> bool + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push((
            id,
            ChangeHandler {
                target,
                callback: Rc::new(callback),
            },
        ));
        id
    }

    /// Removes a previously registered handler.
    pub fn remove(&self, id: HandlerId) {
        self.handlers.borrow_mut().retain(|(h, _)| *h != id);
    }

    /// Detaches every subtree listener (`destroy()`'s "stops...all subtree
    /// subscriptions", §4.7 step 6).
    pub fn clear(&self) {
        self.handlers.borrow_mut().clear();
    }

    /// Delivers `batch` to every qualifying listener, projecting each
    /// listener's new/previous value per the algorithm in §4.4.
    ///
    /// `current` resolves a listener's target to its live (already
    /// post-batch) cached value — needed to reconstruct the projection when
    /// every qualifying mutation is a strict descendant of the listener's
    /// target (see [`project_change`]). `crate::proxy` passes in a closure
    /// over the live [`crate::value::Cache`]; this crate's own unit tests
    /// pass a closure over a fixture value instead.
    ///
    /// `own_proxy_id` is used for the double-fire guard: a remote-origin
    /// batch stamped with our own proxy id should never reach here (the
    /// remote-apply engine already drops those at the source per §4.3
    /// step 1), so seeing one indicates an internal bug, logged rather
    /// than silently ignored.
    ///
    /// A handler whose callback panics is caught rather than allowed to
    /// abort delivery to the remaining listeners or escape into this
    /// crate's control flow; `on_panic` is invoked with the panic message so
    /// the caller can re-emit it as an `error` event with
    /// `source = mutation_callback` (§7 "Callback errors").
    pub fn deliver(&self, batch: &InternalBatch, own_proxy_id: ProxyId, current: &dyn Fn(&Target) -> Value, mut on_panic: impl FnMut(String)) {
        if batch.origin == Origin::Remote && batch.context.proxy == Some(own_proxy_id) {
            warn!("internal bug: remote batch carrying our own proxy id reached the subtree fanout");
            return;
        }

        let mut to_remove = Vec::new();
        let snapshot: Vec<_> = self
            .handlers
            .borrow()
            .iter()
            .map(|(id, h)| (*id, Target::clone(&h.target), Rc::clone(&h.callback)))
            .collect();

        for (id, target, callback) in snapshot {
            let qualifying: Vec<&Change> = batch
                .mutations
                .iter()
                .filter(|m| target.overlaps(&m.target))
                .collect();
            if qualifying.is_empty() {
                continue;
            }

            let projected = project_change(&target, &qualifying, current);
            let call = std::panic::AssertUnwindSafe(|| callback(&projected));
            match std::panic::catch_unwind(call) {
                Ok(keep) => {
                    if !keep {
                        to_remove.push(id);
                    }
                }
                Err(payload) => on_panic(panic_message(&payload)),
            }
        }

        for id in to_remove {
            self.remove(id);
        }
    }
}

/// Projects a listener's new/previous value from the qualifying mutations
/// in a batch (§4.4).
fn project_change(target: &Target, mutations: &[&Change], current: &dyn Fn(&Target) -> Value) -> ProjectedChange {
    if let Some(at_or_above) = mutations
        .iter()
        .find(|m| m.target.is_self_or_ancestor_of(target))
    {
        // One mutation is exactly at, or an ancestor of, the listener's
        // target: project its val/prev at the trailing key sequence.
        let trailing = target.trailing_from(&at_or_above.target);
        return ProjectedChange {
            value: project_trailing(&at_or_above.value, trailing),
            previous: project_trailing(&at_or_above.previous, trailing),
        };
    }

    // All mutations are strict descendants: reconstruct by overlaying each
    // one's val/prev at its trailing path inside two clones of the current
    // (already-applied) cache value.
    //
    // `current(target)` already embeds the batch's own effect, so
    // overlaying `val` again is a no-op for the touched paths; overlaying
    // `prev` synthesizes the pre-batch snapshot by undoing just those
    // paths, leaving untouched siblings as they are now.
    let base = current(target);
    let mut new_value = base.clone();
    let mut previous_value = base;
    for m in mutations {
        let trailing = m.target.trailing_from(target);
        overlay_trailing(&mut new_value, trailing, m.value.clone());
        overlay_trailing(&mut previous_value, trailing, m.previous.clone());
    }
    ProjectedChange {
        value: new_value,
        previous: previous_value,
    }
}

fn project_trailing(value: &Value, trailing: &[crate::path::Key]) -> Value {
    value.walk(trailing).cloned().unwrap_or(Value::Null)
}

fn overlay_trailing(base: &mut Value, trailing: &[crate::path::Key], leaf: Value) {
    let Some((head, rest)) = trailing.split_first() else {
        *base = leaf;
        return;
    };
    if !base.is_composite() {
        *base = Value::empty_container_for(head);
    }
    if rest.is_empty() {
        if leaf.is_absent() {
            let _ = base.remove_key(head);
        } else {
            let _ = base.set_key(head, leaf, &Target::root());
        }
        return;
    }
    if base.get(head).is_none() {
        let _ = base.set_key(head, Value::empty_container_for(&rest[0]), &Target::root());
    }
    if let Some(child) = base.get_mut(head) {
        overlay_trailing(child, rest, leaf);
    }
}
