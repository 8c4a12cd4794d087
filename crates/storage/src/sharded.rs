//! Sharded object table.
//!
//! A power-of-two number of independent shards, each a full serial table
//! under its own mutex. The global handle space is striped across shards:
//!
//! ```text
//! global handle = (local_index << shard_bits) | shard_index
//! shard_index   = handle & (num_shards - 1)
//! ```
//!
//! so routing a handle to its shard is a mask, and global handle 0 maps to
//! shard 0 / local 0, which that shard reserves. Allocation round-robins a
//! cursor that starts at shard 1, which makes the very first allocation of
//! a fresh table return handle 1.
//!
//! Shards are created eagerly (the array never shrinks or moves); slabs
//! inside each shard are created lazily.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use xylem_core::{
    node_id::MAX_HANDLE, Error, NodeId, NodeKind, PersistentEntry, Result, StorageAddr,
};

use crate::allocator::SegmentAllocator;
use crate::entry::EntryView;
use crate::shard::{Shard, ShardConfig, ShardStats};

/// Table geometry.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    /// Number of shards; must be a power of two.
    pub num_shards: usize,
    /// Per-shard slab geometry.
    pub shard: ShardConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            num_shards: 8,
            shard: ShardConfig::default(),
        }
    }
}

impl TableConfig {
    /// Single-shard table: global handles equal shard-local handles, so
    /// allocation order is fully deterministic.
    pub fn single_shard() -> Self {
        TableConfig {
            num_shards: 1,
            shard: ShardConfig::default(),
        }
    }

    /// Small geometry for tests.
    pub fn for_testing(num_shards: usize) -> Self {
        TableConfig {
            num_shards,
            shard: ShardConfig::for_testing(),
        }
    }
}

/// The sharded, MVCC-aware object table.
pub struct ShardedObjectTable {
    shards: Box<[Shard]>,
    shard_bits: u32,
    shard_mask: u64,
    next_shard: AtomicUsize,
    allocator: Option<Arc<SegmentAllocator>>,
}

impl ShardedObjectTable {
    /// Create a table. The allocator, when given, receives freed ranges
    /// during reclamation.
    pub fn new(config: TableConfig, allocator: Option<Arc<SegmentAllocator>>) -> Self {
        assert!(
            config.num_shards.is_power_of_two(),
            "num_shards must be a power of two"
        );
        let shards = (0..config.num_shards)
            .map(|i| Shard::new(config.shard, i == 0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ShardedObjectTable {
            shards,
            shard_bits: config.num_shards.trailing_zeros(),
            shard_mask: config.num_shards as u64 - 1,
            next_shard: AtomicUsize::new(1),
            allocator,
        }
    }

    /// Number of shards.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn split(&self, handle: u64) -> (usize, u64) {
        ((handle & self.shard_mask) as usize, handle >> self.shard_bits)
    }

    #[inline]
    fn join(&self, shard: usize, local: u64) -> u64 {
        (local << self.shard_bits) | shard as u64
    }

    // ------------------------------------------------------------------
    // Writer operations
    // ------------------------------------------------------------------

    /// Allocate a handle: FREE→RESERVED with a bumped tag. The entry is
    /// invisible to readers until `mark_live_commit`.
    pub fn allocate(&self, kind: NodeKind, class_id: u8, addr: StorageAddr) -> Result<NodeId> {
        let n = self.shards.len();
        let start = self.next_shard.fetch_add(1, Ordering::Relaxed);
        let mut last_full = None;
        for probe in 0..n {
            let shard_idx = (start + probe) & self.shard_mask as usize;
            match self.shards[shard_idx].allocate(kind, class_id, addr) {
                Ok((local, tag)) => {
                    let handle = self.join(shard_idx, local);
                    if handle > MAX_HANDLE {
                        return Err(Error::TableFull(format!(
                            "handle {handle} exceeds the 48-bit handle space"
                        )));
                    }
                    return Ok(NodeId::from_parts(handle, tag));
                }
                Err(e @ Error::TableFull(_)) => {
                    last_full = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_full.unwrap_or_else(|| Error::TableFull("no shard can grow".into())))
    }

    /// RESERVED→FREE; only legal before commit.
    pub fn abort_reservation(&self, id: NodeId) -> bool {
        if !id.valid() {
            return false;
        }
        let (shard, local) = self.split(id.handle_index());
        self.shards[shard].abort_reservation(local, id.tag())
    }

    /// RESERVED→LIVE; idempotent; publishes `birth_epoch` with release.
    pub fn mark_live_commit(&self, id: NodeId, birth_epoch: u64) {
        if !id.valid() {
            return;
        }
        let (shard, local) = self.split(id.handle_index());
        self.shards[shard].mark_live_commit(local, id.tag(), birth_epoch);
    }

    /// LIVE→RETIRED; first caller wins, later calls are no-ops.
    pub fn retire(&self, id: NodeId, retire_epoch: u64) {
        if !id.valid() {
            return;
        }
        let (shard, local) = self.split(id.handle_index());
        self.shards[shard].retire(local, id.tag(), retire_epoch);
    }

    /// Lock-free resolve. `None` = invalid at this reader's epoch (bounds,
    /// tag mismatch, or uncommitted).
    pub fn lookup(&self, id: NodeId) -> Option<EntryView> {
        if !id.valid() {
            return None;
        }
        let (shard, local) = self.split(id.handle_index());
        self.shards[shard].lookup(local, id.tag())
    }

    /// Capture the current row of `id` for appending to the delta log.
    /// The row's `handle_idx` is the global handle.
    pub fn delta_record(&self, id: NodeId) -> Option<PersistentEntry> {
        if !id.valid() {
            return None;
        }
        let (shard, local) = self.split(id.handle_index());
        let mut row = self.shards[shard].delta_row(local, id.tag())?;
        row.handle_idx = id.handle_index();
        Some(row)
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Reclaim every entry retired strictly before `safe_epoch`. Freed
    /// segment ranges go back to the attached allocator.
    pub fn reclaim_before_epoch(&self, safe_epoch: u64) -> usize {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.reclaim_before_epoch(safe_epoch, &mut |alloc| {
                if let Some(a) = &self.allocator {
                    a.free(alloc);
                }
            });
        }
        total
    }

    /// Handles waiting on the retired lists across all shards.
    pub fn retired_count(&self) -> usize {
        self.shards.iter().map(|s| s.retired_count()).sum()
    }

    // ------------------------------------------------------------------
    // Checkpoint iteration
    // ------------------------------------------------------------------

    /// Copy every non-free row under the shard locks, remapped to global
    /// handles and sorted by handle.
    pub fn iterate_live_snapshot(&self) -> Vec<PersistentEntry> {
        let mut rows = Vec::new();
        let mut shard_rows = Vec::new();
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            shard_rows.clear();
            shard.iterate_live_snapshot(&mut shard_rows);
            for mut row in shard_rows.drain(..) {
                row.handle_idx = self.join(shard_idx, row.handle_idx);
                rows.push(row);
            }
        }
        rows.sort_by_key(|r| r.handle_idx);
        rows
    }

    /// Entries visible to readers (committed, not retired).
    pub fn count_live(&self) -> usize {
        self.shards.iter().map(|s| s.count_live()).sum()
    }

    /// Aggregate statistics across shards.
    pub fn stats(&self) -> ShardStats {
        let mut agg = ShardStats::default();
        for s in self.shards.iter() {
            let st = s.stats();
            agg.total_allocations += st.total_allocations;
            agg.total_retires += st.total_retires;
            agg.total_reclaims += st.total_reclaims;
            agg.bytes_reclaimed += st.bytes_reclaimed;
            agg.last_reclaim_count += st.last_reclaim_count;
            for c in 0..agg.bytes_per_class.len() {
                agg.bytes_per_class[c] += st.bytes_per_class[c];
                agg.reclaims_per_class[c] += st.reclaims_per_class[c];
            }
        }
        agg
    }

    /// Misuse no-ops observed across shards.
    pub fn invalid_ops(&self) -> u64 {
        self.shards.iter().map(|s| s.invalid_ops()).sum()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Enter recovery mode on every shard.
    pub fn begin_recovery(&self) {
        for s in self.shards.iter() {
            s.begin_recovery();
        }
    }

    /// Leave recovery mode on every shard.
    pub fn end_recovery(&self) {
        for s in self.shards.iter() {
            s.end_recovery();
        }
    }

    /// Restore one checkpoint row (global handle in `pe.handle_idx`).
    pub fn restore_handle(&self, pe: &PersistentEntry) -> Result<()> {
        let (shard, local) = self.split(pe.handle_idx);
        self.shards[shard].restore_handle(local, pe)
    }

    /// Apply one replayed delta row (global handle in `rec.handle_idx`).
    pub fn apply_delta(&self, rec: &PersistentEntry) -> Result<()> {
        let (shard, local) = self.split(rec.handle_idx);
        self.shards[shard].apply_delta(local, rec)
    }
}
