//! One object-table shard: a full serial table under a single mutex.
//!
//! Writers take the shard lock briefly for allocate/retire/reclaim and the
//! recovery paths. Readers never take it: they bounds-check against the
//! released slab count, follow the slab pointer, and validate the entry by
//! acquiring `birth_epoch` and re-checking the tag.
//!
//! Handle bookkeeping is three structures that must stay in sync under the
//! lock:
//! - a bitmap (`1` = free) that is the ground truth of freeness,
//! - a LIFO cache of ready-to-allocate handles (may contain stale entries;
//!   the bitmap check at pop time filters them),
//! - a retired-handles vector so reclamation is O(retired), never
//!   O(capacity).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::warn;
use xylem_core::{
    Error, NodeKind, PersistentEntry, Result, StorageAddr, NUM_SIZE_CLASSES, RETIRE_EPOCH_LIVE,
};

use crate::allocator::Allocation;
use crate::entry::{EntryView, OtEntry};

/// Shard geometry.
#[derive(Debug, Clone, Copy)]
pub struct ShardConfig {
    /// Entries per slab; must be a power of two.
    pub entries_per_slab: usize,
    /// Maximum slabs this shard may grow to.
    pub max_slabs: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            entries_per_slab: 4096,
            max_slabs: 4096,
        }
    }
}

impl ShardConfig {
    /// Tiny geometry for unit tests so growth paths are exercised.
    pub fn for_testing() -> Self {
        ShardConfig {
            entries_per_slab: 64,
            max_slabs: 64,
        }
    }
}

/// Allocation / reclamation statistics, tracked at decision time.
#[derive(Debug, Clone)]
pub struct ShardStats {
    /// Handles handed out by `allocate`.
    pub total_allocations: u64,
    /// Successful LIVE→RETIRED transitions.
    pub total_retires: u64,
    /// Entries reclaimed back to FREE.
    pub total_reclaims: u64,
    /// Segment bytes released by reclamation.
    pub bytes_reclaimed: u64,
    /// Entries reclaimed by the most recent pass.
    pub last_reclaim_count: u64,
    /// Bytes reclaimed per size class.
    pub bytes_per_class: Vec<u64>,
    /// Reclaim count per size class.
    pub reclaims_per_class: Vec<u64>,
}

impl Default for ShardStats {
    fn default() -> Self {
        ShardStats {
            total_allocations: 0,
            total_retires: 0,
            total_reclaims: 0,
            bytes_reclaimed: 0,
            last_reclaim_count: 0,
            bytes_per_class: vec![0; NUM_SIZE_CLASSES],
            reclaims_per_class: vec![0; NUM_SIZE_CLASSES],
        }
    }
}

/// How many handles a bitmap refill tries to stage into the LIFO cache.
const REFILL_BATCH: usize = 64;

struct ShardInner {
    free_bitmap: Vec<u64>,
    free_count: usize,
    free_handles: Vec<u64>,
    retired_handles: Vec<u64>,
    free_scan_cursor: usize,
    max_handle: u64,
    recovery_mode: bool,
    stats: ShardStats,
}

impl ShardInner {
    fn bm_test(&self, h: u64) -> bool {
        let w = (h >> 6) as usize;
        w < self.free_bitmap.len() && (self.free_bitmap[w] >> (h & 63)) & 1 == 1
    }

    fn bm_set(&mut self, h: u64) {
        let w = (h >> 6) as usize;
        if w >= self.free_bitmap.len() {
            self.free_bitmap.resize(w + 1, 0);
        }
        let bit = 1u64 << (h & 63);
        if self.free_bitmap[w] & bit == 0 {
            self.free_bitmap[w] |= bit;
            self.free_count += 1;
        }
    }

    fn bm_clear(&mut self, h: u64) {
        let w = (h >> 6) as usize;
        if w >= self.free_bitmap.len() {
            return;
        }
        let bit = 1u64 << (h & 63);
        if self.free_bitmap[w] & bit != 0 {
            self.free_bitmap[w] &= !bit;
            self.free_count -= 1;
        }
    }
}

/// One shard of the object table.
pub struct Shard {
    slabs: Box<[OnceLock<Box<[OtEntry]>>]>,
    slab_count: AtomicU32,
    entries_per_slab: usize,
    slab_shift: u32,
    reserve_handle_zero: bool,
    inner: Mutex<ShardInner>,
    invalid_ops: AtomicU64,
}

impl Shard {
    /// Create an empty shard. `reserve_handle_zero` is set only on the
    /// shard whose local index 0 corresponds to the global handle 0.
    pub fn new(config: ShardConfig, reserve_handle_zero: bool) -> Self {
        assert!(
            config.entries_per_slab.is_power_of_two(),
            "entries_per_slab must be a power of two"
        );
        let slabs = (0..config.max_slabs)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Shard {
            slabs,
            slab_count: AtomicU32::new(0),
            entries_per_slab: config.entries_per_slab,
            slab_shift: config.entries_per_slab.trailing_zeros(),
            reserve_handle_zero,
            inner: Mutex::new(ShardInner {
                free_bitmap: Vec::new(),
                free_count: 0,
                free_handles: Vec::new(),
                retired_handles: Vec::new(),
                free_scan_cursor: 0,
                max_handle: 0,
                recovery_mode: false,
                stats: ShardStats::default(),
            }),
            invalid_ops: AtomicU64::new(0),
        }
    }

    /// Published capacity in entries.
    pub fn capacity(&self) -> u64 {
        (self.slab_count.load(Ordering::Acquire) as u64) << self.slab_shift
    }

    /// Lock-free entry access; `None` past the published capacity.
    #[inline]
    fn entry(&self, local: u64) -> Option<&OtEntry> {
        let slab_idx = (local >> self.slab_shift) as usize;
        if slab_idx >= self.slab_count.load(Ordering::Acquire) as usize {
            return None;
        }
        let slab = self.slabs[slab_idx].get()?;
        Some(&slab[(local as usize) & (self.entries_per_slab - 1)])
    }

    fn note_invalid(&self, what: &str, local: u64) {
        self.invalid_ops.fetch_add(1, Ordering::Relaxed);
        warn!(handle = local, op = what, "invalid object-table operation ignored");
        debug_assert!(false, "invalid object-table operation: {what} (handle {local})");
    }

    /// Count of misuse no-ops (release builds).
    pub fn invalid_ops(&self) -> u64 {
        self.invalid_ops.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Growth and handle supply (all under the shard lock)
    // ------------------------------------------------------------------

    fn add_slab_locked(&self, inner: &mut ShardInner) -> bool {
        let current = self.slab_count.load(Ordering::Relaxed) as usize;
        if current >= self.slabs.len() {
            return false;
        }

        let slab: Box<[OtEntry]> = (0..self.entries_per_slab)
            .map(|_| OtEntry::new_free())
            .collect();
        // Publish the slab pointer, then the count, both with release, so
        // a reader that sees the new count also sees the slab.
        let _ = self.slabs[current].set(slab);
        self.slab_count.store(current as u32 + 1, Ordering::Release);

        let base = (current as u64) << self.slab_shift;
        for i in 0..self.entries_per_slab as u64 {
            let h = base + i;
            if self.reserve_handle_zero && h == 0 {
                continue;
            }
            inner.bm_set(h);
        }
        // Prime the LIFO in reverse so the lowest handle pops first.
        inner.free_handles.reserve(self.entries_per_slab);
        for i in (0..self.entries_per_slab as u64).rev() {
            let h = base + i;
            if self.reserve_handle_zero && h == 0 {
                continue;
            }
            inner.free_handles.push(h);
        }
        true
    }

    fn refill_free_cache_locked(&self, inner: &mut ShardInner) {
        if inner.free_bitmap.is_empty() || inner.free_count == 0 {
            return;
        }
        let capacity = self.capacity();
        if capacity == 0 {
            return;
        }
        let nwords = inner.free_bitmap.len();
        let start = inner.free_scan_cursor.min(nwords - 1);
        let mut w = start;
        let mut added = 0usize;
        loop {
            let mut word = inner.free_bitmap[w];
            while word != 0 && added < REFILL_BATCH {
                let bit = word.trailing_zeros() as u64;
                word &= word - 1;
                let h = ((w as u64) << 6) + bit;
                if h >= capacity || (self.reserve_handle_zero && h == 0) {
                    continue;
                }
                // The bitmap bit stays set; allocation clears it at pop
                // time, which also filters duplicates staged twice.
                inner.free_handles.push(h);
                added += 1;
            }
            if added >= REFILL_BATCH {
                break;
            }
            w += 1;
            if w >= nwords {
                w = 0;
            }
            if w == start {
                break;
            }
        }
        inner.free_scan_cursor = w;
    }

    fn acquire_handle_locked(&self, inner: &mut ShardInner) -> Result<u64> {
        loop {
            while let Some(h) = inner.free_handles.pop() {
                if inner.bm_test(h) {
                    inner.bm_clear(h);
                    inner.max_handle = inner.max_handle.max(h);
                    return Ok(h);
                }
                // Stale cache entry; skip without an O(n) erase.
            }
            self.refill_free_cache_locked(inner);
            if !inner.free_handles.is_empty() {
                continue;
            }
            if !self.add_slab_locked(inner) {
                return Err(Error::TableFull(format!(
                    "shard at slab cap ({} slabs × {} entries)",
                    self.slabs.len(),
                    self.entries_per_slab
                )));
            }
        }
    }

    // ------------------------------------------------------------------
    // Public state machine
    // ------------------------------------------------------------------

    /// FREE→RESERVED: pick a handle, bump its tag, record the metadata.
    /// The entry stays invisible (`birth_epoch == 0`) until commit.
    pub fn allocate(&self, kind: NodeKind, class_id: u8, addr: StorageAddr) -> Result<(u64, u16)> {
        let mut inner = self.inner.lock();
        let h = self.acquire_handle_locked(&mut inner)?;
        let e = self.entry(h).expect("acquired handle within capacity");

        e.store_metadata(kind.as_u8(), class_id, addr);
        e.store_birth_relaxed(0);
        // Single-bump invariant: every FREE→RESERVED bumps the tag (skip
        // 0), so a reused handle never repeats a (handle, tag) pair.
        let tag = e.bump_tag();
        inner.stats.total_allocations += 1;
        Ok((h, tag))
    }

    /// RESERVED→FREE. Only legal before commit; bumps the tag again and
    /// returns the handle to the free list.
    pub fn abort_reservation(&self, local: u64, tag: u16) -> bool {
        let Some(e) = self.entry(local) else {
            return false;
        };
        let mut inner = self.inner.lock();
        if e.birth_epoch_acquire() != 0 {
            return false; // already LIVE, not a reservation
        }
        if e.tag_relaxed() != tag {
            return false;
        }
        e.store_metadata(NodeKind::Invalid.as_u8(), 0, StorageAddr::default());
        e.bump_tag();
        inner.bm_set(local);
        inner.free_handles.push(local);
        true
    }

    /// RESERVED→LIVE. Idempotent; the release store on `birth_epoch` is
    /// the publication point for readers.
    pub fn mark_live_commit(&self, local: u64, tag: u16, birth_epoch: u64) {
        let Some(e) = self.entry(local) else {
            self.note_invalid("commit past capacity", local);
            return;
        };
        // 0 means "not live"; never publish it.
        let birth_epoch = birth_epoch.max(1);

        if e.tag_relaxed() != tag {
            self.note_invalid("commit tag mismatch", local);
            return;
        }
        if e.birth_epoch_acquire() != 0 {
            return; // double commit is a no-op
        }
        e.store_retire_relaxed(RETIRE_EPOCH_LIVE);
        e.publish_birth(birth_epoch);
    }

    /// LIVE→RETIRED via CAS on `retire_epoch`; the first caller wins and
    /// the handle joins the retired list for O(retired) reclamation.
    pub fn retire(&self, local: u64, tag: u16, retire_epoch: u64) {
        let Some(e) = self.entry(local) else {
            self.note_invalid("retire past capacity", local);
            return;
        };
        if e.tag_relaxed() != tag {
            self.note_invalid("retire tag mismatch", local);
            return;
        }
        if e.birth_epoch_acquire() == 0 {
            self.note_invalid("retire of non-live entry", local);
            return;
        }
        if e.try_retire(retire_epoch) {
            let mut inner = self.inner.lock();
            inner.retired_handles.push(local);
            inner.stats.total_retires += 1;
        }
        // CAS failure = already retired; idempotent no-op.
    }

    /// Lock-free read: resolve a handle at the caller's pinned epoch.
    ///
    /// Returns `None` on bounds failure, tag mismatch, or an uncommitted
    /// entry — all of which mean "invalid at this reader's epoch".
    pub fn lookup(&self, local: u64, expected_tag: u16) -> Option<EntryView> {
        let e = self.entry(local)?;
        let addr = e.addr_relaxed();
        let class_id = e.class_id_relaxed();
        let kind_raw = e.kind_relaxed();
        let birth = e.birth_epoch_acquire();
        if birth == 0 {
            return None;
        }
        let retire = e.retire_epoch_acquire();
        // Tag re-check after the acquire: a reused slot shows a new tag.
        if e.tag_relaxed() != expected_tag {
            return None;
        }
        Some(EntryView {
            kind: NodeKind::from_u8(kind_raw)?,
            class_id,
            addr,
            tag: expected_tag,
            birth_epoch: birth,
            retire_epoch: retire,
        })
    }

    /// Snapshot an entry for delta capture, tag-checked but ignoring
    /// liveness (retired entries still produce rows).
    pub fn delta_row(&self, local: u64, expected_tag: u16) -> Option<PersistentEntry> {
        let e = self.entry(local)?;
        if e.tag_acquire() != expected_tag {
            return None;
        }
        Some(e.to_persistent(local))
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Reclaim entries retired strictly before `safe_epoch` in three
    /// phases: decide under the lock, free segment ranges outside it, then
    /// clear entries to FREE under the lock again. Entries stay RETIRED
    /// until their physical free succeeded, so a crash mid-pass leaves
    /// them reclaimable by a future pass.
    pub fn reclaim_before_epoch(
        &self,
        safe_epoch: u64,
        free_range: &mut dyn FnMut(Allocation),
    ) -> usize {
        struct ToFree {
            alloc: Allocation,
            handle: u64,
        }

        let mut to_free: Vec<ToFree> = Vec::new();
        let mut reclaimed: Vec<u64> = Vec::new();
        let mut still_retired: Vec<u64> = Vec::new();
        let mut freed = 0usize;

        // Phase 1: decide. Stats update here, at decision time, so a
        // failure in phase 2 cannot corrupt the counters.
        {
            let mut inner = self.inner.lock();
            let retired = std::mem::take(&mut inner.retired_handles);
            still_retired.reserve(retired.len());
            for h in retired.iter().copied() {
                let Some(e) = self.entry(h) else { continue };
                let r = e.retire_epoch_acquire();
                if r == RETIRE_EPOCH_LIVE {
                    // Already reclaimed-and-reused or double-pushed; drop.
                    continue;
                }
                if r < safe_epoch {
                    let class_id = e.class_id_relaxed();
                    let addr = e.addr_relaxed();
                    if (class_id as usize) < NUM_SIZE_CLASSES {
                        inner.stats.bytes_per_class[class_id as usize] += addr.length as u64;
                        inner.stats.reclaims_per_class[class_id as usize] += 1;
                    }
                    inner.stats.bytes_reclaimed += addr.length as u64;
                    inner.stats.total_reclaims += 1;
                    if addr.length > 0 {
                        to_free.push(ToFree {
                            alloc: Allocation::from_addr(addr, class_id),
                            handle: h,
                        });
                    } else {
                        reclaimed.push(h);
                    }
                    freed += 1;
                } else {
                    still_retired.push(h);
                }
            }
            // retired_handles is finalized in phase 3; put the survivors
            // back for now so a concurrent retire can append safely.
            inner.retired_handles = still_retired;
        }

        // Phase 2: release segment ranges outside the lock (may do I/O).
        for tf in to_free {
            free_range(tf.alloc);
            reclaimed.push(tf.handle);
        }

        // Phase 3: clear entries to FREE and refree the handles.
        {
            let mut inner = self.inner.lock();
            for &h in &reclaimed {
                let Some(e) = self.entry(h) else { continue };
                // Keep retire_epoch as a breadcrumb: freeness is defined by
                // birth==0 && kind==Invalid, and replay uses the breadcrumb
                // to tell reused-from-retired slots from pristine ones.
                e.store_birth_relaxed(0);
                e.store_metadata(NodeKind::Invalid.as_u8(), 0, StorageAddr::default());
                // Single-bump invariant: the tag moves on reuse, not here.
            }
            for &h in &reclaimed {
                if self.reserve_handle_zero && h == 0 {
                    continue;
                }
                inner.bm_set(h);
                inner.free_handles.push(h);
            }
            inner.stats.last_reclaim_count = freed as u64;
        }

        freed
    }

    /// Handles currently on the retired list.
    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired_handles.len()
    }

    // ------------------------------------------------------------------
    // Checkpoint iteration
    // ------------------------------------------------------------------

    /// Copy every non-free row (live and retired) under the lock. Row
    /// `handle_idx` is the shard-local index; the caller remaps to global.
    pub fn iterate_live_snapshot(&self, out: &mut Vec<PersistentEntry>) {
        let _inner = self.inner.lock();
        let published = self.slab_count.load(Ordering::Acquire) as usize;
        for slab_idx in 0..published {
            let Some(slab) = self.slabs[slab_idx].get() else {
                continue;
            };
            let base = (slab_idx as u64) << self.slab_shift;
            for (i, e) in slab.iter().enumerate() {
                let h = base + i as u64;
                if self.reserve_handle_zero && h == 0 {
                    continue;
                }
                if !e.is_free() {
                    out.push(e.to_persistent(h));
                }
            }
        }
    }

    /// Entries visible to readers (committed and not retired).
    pub fn count_live(&self) -> usize {
        let _inner = self.inner.lock();
        let published = self.slab_count.load(Ordering::Acquire) as usize;
        let mut n = 0;
        for slab_idx in 0..published {
            if let Some(slab) = self.slabs[slab_idx].get() {
                n += slab
                    .iter()
                    .filter(|e| !e.is_free() && !e.is_retired())
                    .count();
            }
        }
        n
    }

    /// Snapshot of the shard statistics.
    pub fn stats(&self) -> ShardStats {
        self.inner.lock().stats.clone()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Enter recovery mode: drop the handle cache and rebuild the bitmap
    /// from the canonical FREE predicate over the current table.
    pub fn begin_recovery(&self) {
        let mut inner = self.inner.lock();
        inner.recovery_mode = true;
        let published = self.slab_count.load(Ordering::Relaxed) as usize;
        let capacity = (published as u64) << self.slab_shift;
        inner.free_bitmap = vec![0; ((capacity + 63) / 64) as usize];
        inner.free_count = 0;
        for slab_idx in 0..published {
            let Some(slab) = self.slabs[slab_idx].get() else {
                continue;
            };
            let base = (slab_idx as u64) << self.slab_shift;
            for (i, e) in slab.iter().enumerate() {
                let h = base + i as u64;
                if self.reserve_handle_zero && h == 0 {
                    continue;
                }
                if e.is_free() {
                    inner.bm_set(h);
                }
            }
        }
        inner.free_handles.clear();
    }

    /// Leave recovery mode: rebuild the LIFO (lowest handle pops first)
    /// and the retired list from the table.
    pub fn end_recovery(&self) {
        let mut inner = self.inner.lock();
        inner.free_handles.clear();
        inner.retired_handles.clear();

        let capacity = self.capacity();
        let nwords = inner.free_bitmap.len();
        let mut rebuilt = Vec::with_capacity(inner.free_count);
        for w in 0..nwords {
            let mut word = inner.free_bitmap[w];
            while word != 0 {
                let bit = word.trailing_zeros() as u64;
                word &= word - 1;
                let h = ((w as u64) << 6) + bit;
                if h >= capacity || (self.reserve_handle_zero && h == 0) {
                    continue;
                }
                rebuilt.push(h);
            }
        }
        // Pushed low→high; reverse so pop_back yields the lowest first.
        rebuilt.reverse();
        inner.free_handles = rebuilt;
        inner.max_handle = capacity.saturating_sub(1);

        let published = self.slab_count.load(Ordering::Relaxed) as usize;
        for slab_idx in 0..published {
            let Some(slab) = self.slabs[slab_idx].get() else {
                continue;
            };
            let base = (slab_idx as u64) << self.slab_shift;
            for (i, e) in slab.iter().enumerate() {
                let h = base + i as u64;
                if self.reserve_handle_zero && h == 0 {
                    continue;
                }
                if e.is_retired() {
                    inner.retired_handles.push(h);
                }
            }
        }
        inner.recovery_mode = false;
    }

    /// Restore one checkpoint row at its exact local index, growing slabs
    /// on demand. Rows with the RESERVED shape (birth 0, retire MAX) are
    /// skipped — they were never durable.
    pub fn restore_handle(&self, local: u64, pe: &PersistentEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_capacity_locked(&mut inner, local)?;
        if pe.is_reserved_shape() {
            return Ok(());
        }
        inner.bm_clear(local);

        let e = self.entry(local).expect("capacity ensured");
        e.store_metadata(pe.kind, pe.class_id, pe.addr());
        e.store_birth_relaxed(pe.birth_epoch);
        e.store_retire_relaxed(pe.retire_epoch);
        // Tag last, release: publishes the whole row.
        e.store_tag_release(if pe.tag == 0 { 1 } else { pe.tag });
        inner.max_handle = inner.max_handle.max(local);
        Ok(())
    }

    /// Apply one replayed delta row at its local index, growing slabs on
    /// demand and keeping the free bitmap in sync with the row's shape.
    pub fn apply_delta(&self, local: u64, rec: &PersistentEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_capacity_locked(&mut inner, local)?;

        let e = self.entry(local).expect("capacity ensured");
        e.store_metadata(rec.kind, rec.class_id, rec.addr());
        e.store_birth_relaxed(rec.birth_epoch);
        e.store_retire_relaxed(rec.retire_epoch);

        let is_free =
            rec.birth_epoch == 0 && rec.kind == NodeKind::Invalid.as_u8();
        if is_free {
            inner.bm_set(local);
            if !inner.recovery_mode && inner.free_handles.len() < REFILL_BATCH {
                inner.free_handles.push(local);
            }
        } else {
            inner.bm_clear(local);
        }

        e.store_tag_release(rec.tag);
        inner.max_handle = inner.max_handle.max(local);
        Ok(())
    }

    fn ensure_capacity_locked(&self, inner: &mut ShardInner, local: u64) -> Result<()> {
        let slab_idx = local >> self.slab_shift;
        while (self.slab_count.load(Ordering::Relaxed) as u64) <= slab_idx {
            if !self.add_slab_locked(inner) {
                return Err(Error::TableFull(format!(
                    "cannot grow shard to hold handle {local}"
                )));
            }
        }
        Ok(())
    }
}
