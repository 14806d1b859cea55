// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A bidirectional live-sync proxy binding an in-memory value graph to a
//! hierarchical external store.
//!
//! A [`proxy::LiveProxy`] mirrors one path of an external [`store::Store`]
//! into a local [`value::Cache`]. Reads are served instantly from the
//! cache; writes are captured through [`access::Node`], coalesced in a
//! [`queue::MutationQueue`], and flushed to the store on the next
//! cooperative scheduler tick. Mutations the store reports back — whether
//! from this proxy's own flush or from any other writer — are folded back
//! into the cache by [`remote`] and fanned out to subscribers via
//! [`events`].
//!
//! This crate assumes a single-threaded, cooperative host: there is no
//! locking anywhere in the write path, only the "next tick" deferral
//! modeled by [`scheduler::Scheduler`]. A host embeds it by holding a
//! `Scheduler` (reachable through [`proxy::LiveProxy::run_until_stalled`])
//! and driving it once per event-loop iteration.

#![forbid(unsafe_code)]

pub mod access;
pub mod error;
pub mod events;
pub mod idgen;
pub mod memory;
pub mod ordered;
pub mod path;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod transaction;
pub mod value;

mod proxy;

pub use access::{Accessed, Node, ObservableAdapter, Subscription};
pub use error::{ErrorSource, UsageError};
pub use events::{ErrorEvent, HandlerId, MutationEvent, Origin, ProjectedChange};
pub use idgen::{IdGenerator, MonotonicIdGenerator};
pub use ordered::OrderedCollection;
pub use path::{Key, Target};
pub use proxy::{CreateOptions, LiveProxy};
pub use scheduler::Scheduler;
pub use store::{
    CacheMode, Change, Context, Cursor, ExternalPath, FieldChange, GetOptions, MutationBatch, ProxyId, SnapshotContext, Store,
    StoreSnapshot, UpdatePatch, WriteSource,
};
pub use transaction::{Transaction, TransactionController, TxStatus};
pub use value::{Cache, Value, ValueKind};
