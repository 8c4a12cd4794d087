//! Contract consumed from the external decoded-node cache.
//!
//! The in-memory LRU of *decoded* nodes lives outside the persistence
//! core; this trait is the entire surface the core relies on. The object
//! table never writes into the cache, and the cache never mutates object
//! table entries — the two meet only through stable `NodeId` keys.

use crate::node_id::NodeId;

/// The decoded-node cache as seen by the persistence core.
///
/// Pins returned by `lookup_or_attach`/`find` are RAII: a pinned record
/// stays resident until the pin drops.
pub trait NodeCache {
    /// A decoded record handed to (or back from) the cache.
    type Record;
    /// RAII pin keeping a record resident.
    type Pin;

    /// Return the cached record for `key`, attaching `record` if the key
    /// is absent. `owns_object` tells the cache whether eviction should
    /// free the record; memory-mapped records are attached with `false`
    /// and the cache must not free them.
    fn lookup_or_attach(&self, key: NodeId, record: Self::Record, owns_object: bool) -> Self::Pin;

    /// The cached record for `key`, if resident.
    fn find(&self, key: NodeId) -> Option<Self::Pin>;

    /// Move a cached record from `old` to `new` (a node was rewritten
    /// under a fresh id). Returns false if `old` was not resident.
    fn rekey(&self, old: NodeId, new: NodeId) -> bool;
}
