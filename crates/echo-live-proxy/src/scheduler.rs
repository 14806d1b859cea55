// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The cooperative "next scheduler tick" model (§5).
//!
//! Every deferred operation in this crate — the flush, the deferred
//! callback dispatch, `reload()`'s fetch — is a future spawned onto a
//! single-threaded [`futures::executor::LocalPool`]. A host embeds the
//! proxy by holding a [`Scheduler`] and calling [`Scheduler::run_until_stalled`]
//! on its own tick (an event-loop iteration, a `requestAnimationFrame`, one
//! pass of a `tokio::task::spawn_local` inside a `LocalSet`, …). This crate
//! never assumes ownership of a runtime, matching §1's "network transport"
//! non-goal: only the cooperative scheduling primitive is in scope, not how
//! a host drives it.

use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt as _;

/// A single-threaded cooperative task scheduler.
///
/// Cloning a `Scheduler` shares the same underlying pool — all clones
/// schedule onto, and drain, the same queue of pending work.
#[derive(Clone)]
pub struct Scheduler {
    pool: Rc<RefCell<LocalPool>>,
    spawner: LocalSpawner,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Builds a fresh, idle scheduler.
    #[must_use]
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            pool: Rc::new(RefCell::new(pool)),
            spawner,
        }
    }

    /// Schedules `task` to run "at the next scheduler tick" (§4.2, §4.4): it
    /// will not begin executing until a subsequent [`Scheduler::run_until_stalled`]
    /// or [`Scheduler::run_until_idle`] call, never synchronously within the
    /// caller's own stack frame.
    pub fn schedule(&self, task: LocalBoxFuture<'static, ()>) {
        // `spawn_local` on a `LocalPool` never fails in practice (the pool
        // owns its own executor for its whole lifetime); a dropped scheduler
        // simply drops pending work, matching `destroy()`'s cancellation
        // model (§5).
        let _ = self.spawner.spawn_local(task);
    }

    /// Runs every task that can make progress without blocking, then
    /// returns. This is "a scheduler tick" — call it once per host event
    /// loop iteration (or once, synchronously, in tests that don't need a
    /// real event loop).
    pub fn run_until_stalled(&self) {
        self.pool.borrow_mut().run_until_stalled();
    }
}
