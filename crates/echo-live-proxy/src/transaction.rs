// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The transaction controller (C7): tracks which targets are currently
//! claimed by an in-flight transaction, and the `Transaction` handle
//! `startTransaction()` hands back (§4.5).

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::UsageError;
use crate::path::Target;
use crate::proxy::ProxyCore;
use crate::queue::PendingMutation;
use crate::store::Store;

/// The lifecycle state of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Installed, still accepting mutations under its target.
    Started,
    /// Resolved by `commit()`.
    Finished,
    /// Resolved by `rollback()`.
    Canceled,
}

struct TransactionRecord {
    target: Target,
    status: TxStatus,
}

/// Tracks active transaction claims so the mutation queue and
/// `startTransaction()` can detect conflicts and decide what to hold back
/// from a flush (§4.5).
#[derive(Default)]
pub struct TransactionController {
    active: RefCell<Vec<TransactionRecord>>,
}

impl TransactionController {
    /// `true` if `target` conflicts with an already-started transaction:
    /// equal to, an ancestor of, or a descendant of its claim.
    #[must_use]
    pub fn conflicts(&self, target: &Target) -> bool {
        self.active
            .borrow()
            .iter()
            .any(|t| t.status == TxStatus::Started && t.target.overlaps(target))
    }

    /// Installs a new transaction record for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ConflictingTransaction`] if `target` overlaps an
    /// already-active transaction.
    pub fn start(&self, target: Target) -> Result<(), UsageError> {
        if self.conflicts(&target) {
            return Err(UsageError::ConflictingTransaction { target: target.to_string() });
        }
        self.active.borrow_mut().push(TransactionRecord { target, status: TxStatus::Started });
        Ok(())
    }

    /// `true` if a started transaction owns `mutation_target` (it is at or
    /// under that transaction's claim) — mutations under an active
    /// transaction sit out the ordinary flush (§4.2 step 2).
    #[must_use]
    pub fn owns(&self, mutation_target: &Target) -> bool {
        self.active
            .borrow()
            .iter()
            .any(|t| t.status == TxStatus::Started && t.target.is_self_or_ancestor_of(mutation_target))
    }

    /// Removes the record for `target` (commit/rollback both end a
    /// transaction's lifetime; there is nothing left to track once resolved).
    pub fn finish(&self, target: &Target) {
        self.active.borrow_mut().retain(|t| &t.target != target);
    }

    /// Marks every still-started transaction finished and returns their
    /// targets, releasing their claim on the mutation queue so a subsequent
    /// flush picks up whatever they had queued. Used by proxy destruction,
    /// which implicitly commits active transactions rather than rolling
    /// them back (§9 decided Open Question).
    pub fn finish_all(&self) -> Vec<Target> {
        let mut active = self.active.borrow_mut();
        let targets: Vec<Target> = active.iter().filter(|t| t.status == TxStatus::Started).map(|t| t.target.clone()).collect();
        active.clear();
        targets
    }
}

/// A handle to a transaction claimed over `target`, returned by
/// [`crate::access::Node::start_transaction`] (§4.5).
pub struct Transaction<S: Store> {
    core: Rc<ProxyCore<S>>,
    target: Target,
    completed: std::cell::Cell<bool>,
}

impl<S: Store> Transaction<S> {
    pub(crate) fn new(core: Rc<ProxyCore<S>>, target: Target) -> Self {
        Self { core, target, completed: std::cell::Cell::new(false) }
    }

    /// The target this transaction claims.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// `true` once `commit()` or `rollback()` has resolved this transaction.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed.get()
    }

    /// The mutations currently queued under this transaction's target,
    /// without consuming them.
    #[must_use]
    pub fn mutations(&self) -> Vec<PendingMutation> {
        self.core.queue.borrow().peek_under(&self.target)
    }

    /// Resolves the transaction by letting its queued mutations join the
    /// ordinary flush, then waiting for that flush to complete (§4.5
    /// "mark finished, remove the record, schedule a flush, await it").
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::TransactionCompleted`] if already resolved.
    pub async fn commit(&self) -> Result<(), UsageError> {
        if self.completed.get() {
            return Err(UsageError::TransactionCompleted);
        }
        self.completed.set(true);
        self.core.transactions.finish(&self.target);
        self.core.schedule_flush_and_wait().await;
        Ok(())
    }

    /// Resolves the transaction by discarding its queued mutations and
    /// replaying their `previous` values back into the cache, in reverse
    /// enqueue order (§4.5 "rollback"). Purely local — never touches the
    /// external store, so unlike `commit()` this has no suspension point.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::TransactionCompleted`] if already resolved.
    pub fn rollback(&self) -> Result<(), UsageError> {
        if self.completed.get() {
            return Err(UsageError::TransactionCompleted);
        }
        self.completed.set(true);
        let mut owned = self.core.queue.borrow_mut().take_under(&self.target);
        self.core.transactions.finish(&self.target);
        owned.reverse();
        for mutation in owned {
            self.core.replay_previous(&mutation);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::path::Key;

    // ── 1. a transaction claim rejects an overlapping one ───────────────

    #[test]
    fn overlapping_claim_is_rejected() {
        let controller = TransactionController::default();
        let a = Target::new(vec![Key::from("a")]);
        let ab = Target::new(vec![Key::from("a"), Key::from("b")]);
        controller.start(a).unwrap();
        assert!(controller.start(ab).is_err());
    }

    // ── 2. disjoint targets can both be claimed ─────────────────────────

    #[test]
    fn disjoint_claims_both_succeed() {
        let controller = TransactionController::default();
        let a = Target::new(vec![Key::from("a")]);
        let b = Target::new(vec![Key::from("b")]);
        assert!(controller.start(a).is_ok());
        assert!(controller.start(b).is_ok());
    }

    // ── 3. finish releases a claim so a new one can be installed ────────

    #[test]
    fn finish_releases_the_claim() {
        let controller = TransactionController::default();
        let a = Target::new(vec![Key::from("a")]);
        controller.start(a.clone()).unwrap();
        controller.finish(&a);
        assert!(controller.start(a).is_ok());
    }

    // ── 4. owns matches the claim target and anything under it ─────────

    #[test]
    fn owns_covers_self_and_descendants() {
        let controller = TransactionController::default();
        let a = Target::new(vec![Key::from("a")]);
        let ab = Target::new(vec![Key::from("a"), Key::from("b")]);
        let z = Target::new(vec![Key::from("z")]);
        controller.start(a.clone()).unwrap();
        assert!(controller.owns(&a));
        assert!(controller.owns(&ab));
        assert!(!controller.owns(&z));
    }
}
