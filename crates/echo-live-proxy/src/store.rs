// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The external store contract (§6) — the one collaborator spec §1 puts out
//! of scope. This crate is generic over [`Store`] rather than bundling a
//! concrete backend, the same way `echo-cas::BlobStore` is a trait consumed
//! by its owner rather than an implementation detail of it.

use futures::future::LocalBoxFuture;
use futures::stream::Stream;
use indexmap::IndexMap;

use crate::path::{Key, Target};
use crate::value::Value;

/// A path in the external store's own addressing scheme, opaque to this
/// crate beyond equality, display, and [`Store::child`] composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalPath(pub String);

impl std::fmt::Display for ExternalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a proxy instance, stamped on every outbound write so a
/// remote echo of our own write can be recognized (§3, §6 "Context
/// stamping").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(pub u64);

/// The reason an outbound `set`/`update` was issued (§6 "Context stamping").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// A normal flush of queued local mutations.
    Update,
    /// A rollback replaying a `previous` value after a failed flush group or
    /// a transaction rollback.
    UpdateRollback,
    /// The `defaultValue` seed write performed once at `create()`.
    Default,
}

/// Stamped on every outbound write; compared against inbound batches'
/// context to implement feedback prevention (§3, §4.3).
#[derive(Debug, Clone)]
pub struct Context {
    /// This proxy's identity.
    pub proxy_id: ProxyId,
    /// Why this write was issued.
    pub source: WriteSource,
}

/// Whether [`Store::get`] may answer from a local cache the store itself
/// keeps, or must go to the authoritative source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Allow the store's own cache to answer (§4.7 step 1).
    #[default]
    AllowCached,
    /// Bypass any cache (used by [`crate::proxy::LiveProxy::reload`]).
    Reload,
}

/// Options for [`Store::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Cache policy for this read.
    pub cache_mode: CacheMode,
    /// The last cursor this caller observed, if any — lets a store-side
    /// cache validate itself.
    pub cache_cursor: Option<Cursor>,
}

/// Opaque, monotone sync token emitted by the external store (§3 "Cursor").
/// Ordering is defined entirely by the store; this crate only ever compares
/// cursors for equality and otherwise treats the latest one observed as
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub String);

/// Context accompanying a [`StoreSnapshot`] or [`MutationBatch`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotContext {
    /// The cursor as of this snapshot/batch, if the store provided one.
    pub cursor: Option<Cursor>,
    /// The proxy that produced this snapshot/batch, if it originated from a
    /// proxied write (used for feedback prevention).
    pub proxy: Option<ProxyId>,
    /// `true` if this snapshot was answered from the store's own cache
    /// rather than the authoritative source (§4.7 step 2).
    pub from_cache: bool,
}

/// The result of [`Store::get`].
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// The value at the requested path.
    pub value: Value,
    /// Context describing how this snapshot was obtained.
    pub context: SnapshotContext,
}

/// One field changed in an `update` call, carrying both the new value and
/// the `previous` captured when the mutation was first flagged (§4.2 step
/// 5's "payload maps last-key → cached value at target, accompanied by the
/// captured previous for each key").
#[derive(Debug, Clone)]
pub struct FieldChange {
    /// The new value to write.
    pub value: Value,
    /// The value that was cached at this target when it was first flagged.
    pub previous: Value,
}

/// A batched partial write grouped by common parent (§4.2 step 5).
#[derive(Debug, Clone, Default)]
pub struct UpdatePatch(pub IndexMap<Key, FieldChange>);

/// A single applied (or about-to-be-applied) change: the common shape
/// shared by queued local mutations, flush payload entries, and inbound
/// remote mutations (§3 "Pending mutation", §4.3 "remote mutation tuple").
#[derive(Debug, Clone)]
pub struct Change {
    /// The target that changed.
    pub target: Target,
    /// The new value (`Value::Null` represents a deletion).
    pub value: Value,
    /// The value that was present before this change.
    pub previous: Value,
}

/// A batch of remote mutations delivered together (§3 "Batch").
#[derive(Debug, Clone)]
pub struct MutationBatch {
    /// The mutations in this batch, in arrival order.
    pub mutations: Vec<Change>,
    /// Context describing the batch's origin.
    pub context: SnapshotContext,
}

/// The external datastore contract consumed by this crate (§6).
///
/// Implementations back `get`/`set`/`update` with whatever transport and
/// persistence they like; this crate never reaches for a concrete backend
/// on its own (§1 "Out of scope").
pub trait Store {
    /// The store's own error type, surfaced verbatim in `error` events
    /// rather than stringified, so callers keep full detail.
    type Error: std::error::Error + 'static;
    /// The stream of mutation batches returned by [`Store::subscribe_mutations`].
    type Mutations: Stream<Item = MutationBatch> + 'static;

    /// Fetches the value at `path`.
    fn get<'a>(
        &'a self,
        path: &'a ExternalPath,
        opts: GetOptions,
    ) -> LocalBoxFuture<'a, Result<StoreSnapshot, Self::Error>>;

    /// Replaces the whole value at `path`.
    fn set<'a>(
        &'a self,
        path: &'a ExternalPath,
        value: Value,
        ctx: Context,
    ) -> LocalBoxFuture<'a, Result<Option<Cursor>, Self::Error>>;

    /// Applies a partial write (one or more sibling fields) at `path`.
    fn update<'a>(
        &'a self,
        path: &'a ExternalPath,
        patch: UpdatePatch,
        ctx: Context,
    ) -> LocalBoxFuture<'a, Result<Option<Cursor>, Self::Error>>;

    /// Subscribes to the batched mutation stream for `path`.
    fn subscribe_mutations(&self, path: &ExternalPath) -> Self::Mutations;

    /// Composes the external path for a child of `path` at `key`.
    fn child(&self, path: &ExternalPath, key: &Key) -> ExternalPath;
}
