// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error taxonomy (§7): synchronous usage errors vs. asynchronous `error`
//! event payloads. The façade never throws asynchronously — store,
//! consistency, and callback failures are delivered as [`ErrorEvent`]s
//! (see [`crate::events`]), never returned from a function.

/// Synchronous, programmer-facing misuse of the façade. Every variant here
/// is returned as an `Err` from whichever call detected it — never panics.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    /// Attempted to write a non-numeric key onto a sequence.
    #[error("cannot set non-numeric key {key:?} on a sequence at {target}")]
    NonNumericSequenceKey {
        /// The target of the sequence being written to.
        target: String,
        /// The offending key.
        key: String,
    },
    /// Attempted to read a property of a primitive (scalar) value.
    #[error("cannot read property {key:?} of a primitive at {target}")]
    PropertyOfPrimitive {
        /// The target of the primitive value.
        target: String,
        /// The key that was requested.
        key: String,
    },
    /// The proxy has already been destroyed.
    #[error("operation attempted on a destroyed proxy")]
    Destroyed,
    /// `commit`/`rollback` called on a transaction that already finished.
    #[error("transaction already completed")]
    TransactionCompleted,
    /// A new transaction's target equals, is an ancestor of, or is a
    /// descendant of an already-active transaction's target.
    #[error("a transaction already owns or overlaps target {target}")]
    ConflictingTransaction {
        /// The overlapping target.
        target: String,
    },
    /// `observe()` was called but no reactive-stream adapter is installed
    /// (§4.4, §9 "optional dependency").
    #[error("no reactive-stream adapter installed; call with_observable_adapter first")]
    ObservableAdapterMissing,
}

/// Where an asynchronous [`crate::events::ErrorEvent`] originated (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// A `set`/`update` call during flush failed.
    Flush,
    /// A remote mutation referenced a cache node that no longer exists.
    Consistency,
    /// A user callback registered via the local-update surface panicked or
    /// returned an error.
    LocalUpdate,
    /// A user callback registered via the remote-update surface panicked or
    /// returned an error.
    RemoteUpdate,
    /// A subtree `onChanged`/`subscribe` callback panicked or returned an
    /// error.
    MutationCallback,
}

impl ErrorSource {
    /// The string form used in the legacy `{source: '...'}` surface.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Consistency => "consistency",
            Self::LocalUpdate => "local_update",
            Self::RemoteUpdate => "remote_update",
            Self::MutationCallback => "mutation_callback",
        }
    }
}
