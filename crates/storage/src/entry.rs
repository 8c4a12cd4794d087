//! In-memory object-table entry.
//!
//! Every field is atomic because the read path never takes the shard lock.
//! The only cross-field synchronization point is `birth_epoch`: committing
//! stores it with release, and a reader that acquire-loads a nonzero
//! `birth_epoch` is guaranteed to observe every earlier store to
//! `addr`/`kind`/`class_id`/`tag`/`retire_epoch` of the same allocation
//! instance. All other stores happen either under the shard lock or while
//! the entry is exclusively owned (RESERVED).

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use xylem_core::{NodeKind, PersistentEntry, StorageAddr, RETIRE_EPOCH_LIVE};

/// One object-table slot, padded to a full cache line so neighboring
/// handles never false-share.
#[repr(align(64))]
#[derive(Debug)]
pub struct OtEntry {
    file_id: AtomicU32,
    segment_id: AtomicU32,
    offset: AtomicU64,
    length: AtomicU32,
    class_id: AtomicU8,
    kind: AtomicU8,
    tag: AtomicU16,
    birth_epoch: AtomicU64,
    retire_epoch: AtomicU64,
}

impl OtEntry {
    /// A fresh FREE slot: kind Invalid, birth 0, retire MAX, tag 0.
    pub fn new_free() -> Self {
        OtEntry {
            file_id: AtomicU32::new(0),
            segment_id: AtomicU32::new(0),
            offset: AtomicU64::new(0),
            length: AtomicU32::new(0),
            class_id: AtomicU8::new(0),
            kind: AtomicU8::new(NodeKind::Invalid.as_u8()),
            tag: AtomicU16::new(0),
            birth_epoch: AtomicU64::new(0),
            retire_epoch: AtomicU64::new(RETIRE_EPOCH_LIVE),
        }
    }

    /// Canonical FREE predicate: never committed and kind Invalid. The
    /// retire epoch is deliberately ignored — reclaimed slots keep their
    /// retire epoch as a breadcrumb.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.birth_epoch.load(Ordering::Relaxed) == 0
            && self.kind.load(Ordering::Relaxed) == NodeKind::Invalid.as_u8()
    }

    /// True iff committed and since retired (reclaim candidate).
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.birth_epoch.load(Ordering::Relaxed) > 0
            && self.retire_epoch.load(Ordering::Relaxed) != RETIRE_EPOCH_LIVE
    }

    #[inline]
    pub(crate) fn tag_relaxed(&self) -> u16 {
        self.tag.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn tag_acquire(&self) -> u16 {
        self.tag.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn birth_epoch_acquire(&self) -> u64 {
        self.birth_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn retire_epoch_acquire(&self) -> u64 {
        self.retire_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn addr_relaxed(&self) -> StorageAddr {
        StorageAddr {
            file_id: self.file_id.load(Ordering::Relaxed),
            segment_id: self.segment_id.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            length: self.length.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn class_id_relaxed(&self) -> u8 {
        self.class_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn kind_relaxed(&self) -> u8 {
        self.kind.load(Ordering::Relaxed)
    }

    /// Plain stores of the allocation metadata. Caller must own the entry
    /// (RESERVED under the shard lock, or recovery before threads start).
    pub(crate) fn store_metadata(&self, kind: u8, class_id: u8, addr: StorageAddr) {
        self.file_id.store(addr.file_id, Ordering::Relaxed);
        self.segment_id.store(addr.segment_id, Ordering::Relaxed);
        self.offset.store(addr.offset, Ordering::Relaxed);
        self.length.store(addr.length, Ordering::Relaxed);
        self.class_id.store(class_id, Ordering::Relaxed);
        self.kind.store(kind, Ordering::Relaxed);
    }

    pub(crate) fn store_birth_relaxed(&self, epoch: u64) {
        self.birth_epoch.store(epoch, Ordering::Relaxed);
    }

    /// Publication point: release so readers acquire-loading a nonzero
    /// birth epoch see every earlier store to this entry.
    pub(crate) fn publish_birth(&self, epoch: u64) {
        self.birth_epoch.store(epoch, Ordering::Release);
    }

    pub(crate) fn store_retire_relaxed(&self, epoch: u64) {
        self.retire_epoch.store(epoch, Ordering::Relaxed);
    }

    /// First-retire-wins transition LIVE→RETIRED.
    pub(crate) fn try_retire(&self, epoch: u64) -> bool {
        self.retire_epoch
            .compare_exchange(
                RETIRE_EPOCH_LIVE,
                epoch,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn store_tag_relaxed(&self, tag: u16) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    /// Tag republish after a recovery write: release so all prior field
    /// stores are ordered before the tag becomes visible.
    pub(crate) fn store_tag_release(&self, tag: u16) {
        self.tag.store(tag, Ordering::Release);
    }

    /// Bump the tag for a FREE→RESERVED (or RESERVED→FREE) transition,
    /// skipping 0. Returns the new tag.
    pub(crate) fn bump_tag(&self) -> u16 {
        let mut t = self.tag.load(Ordering::Relaxed).wrapping_add(1);
        if t == 0 {
            t = 1;
        }
        self.tag.store(t, Ordering::Relaxed);
        t
    }

    /// Copy out the entry as a persisted row for the given handle index.
    /// Caller holds the shard lock (checkpoint iteration) or otherwise
    /// tolerates a torn-free snapshot (delta capture re-checks the tag).
    pub(crate) fn to_persistent(&self, handle_idx: u64) -> PersistentEntry {
        let addr = self.addr_relaxed();
        PersistentEntry {
            handle_idx,
            file_id: addr.file_id,
            segment_id: addr.segment_id,
            offset: addr.offset,
            length: addr.length,
            class_id: self.class_id_relaxed(),
            kind: self.kind_relaxed(),
            tag: self.tag.load(Ordering::Acquire),
            birth_epoch: self.birth_epoch.load(Ordering::Relaxed),
            retire_epoch: self.retire_epoch.load(Ordering::Relaxed),
        }
    }
}

/// By-value snapshot of an entry, handed to readers.
///
/// Produced only after the tag re-check passed; the fields are stable for
/// as long as the reader's epoch pin covers the entry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryView {
    /// Node kind.
    pub kind: NodeKind,
    /// Allocator size class.
    pub class_id: u8,
    /// Physical location.
    pub addr: StorageAddr,
    /// Reuse tag at read time.
    pub tag: u16,
    /// Commit epoch (> 0).
    pub birth_epoch: u64,
    /// Retire epoch, `u64::MAX` while live.
    pub retire_epoch: u64,
}

impl EntryView {
    /// True iff the view was live at `epoch` (committed at or before,
    /// retired strictly after).
    #[inline]
    pub fn live_at(&self, epoch: u64) -> bool {
        self.birth_epoch <= epoch && epoch < self.retire_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<OtEntry>(), 64);
        assert_eq!(std::mem::align_of::<OtEntry>(), 64);
    }

    #[test]
    fn test_new_free_shape() {
        let e = OtEntry::new_free();
        assert!(e.is_free());
        assert!(!e.is_retired());
        assert_eq!(e.tag_relaxed(), 0);
        assert_eq!(e.retire_epoch_acquire(), RETIRE_EPOCH_LIVE);
    }

    #[test]
    fn test_bump_tag_skips_zero() {
        let e = OtEntry::new_free();
        assert_eq!(e.bump_tag(), 1);
        e.store_tag_relaxed(u16::MAX);
        assert_eq!(e.bump_tag(), 1);
    }

    #[test]
    fn test_retire_first_caller_wins() {
        let e = OtEntry::new_free();
        e.publish_birth(3);
        assert!(e.try_retire(7));
        assert!(!e.try_retire(9));
        assert_eq!(e.retire_epoch_acquire(), 7);
        assert!(e.is_retired());
    }

    #[test]
    fn test_free_predicate_ignores_breadcrumb() {
        let e = OtEntry::new_free();
        // Simulate a reclaimed slot: breadcrumb retire epoch, birth reset
        e.store_retire_relaxed(12);
        assert!(e.is_free());
        assert!(!e.is_retired());
    }

    #[test]
    fn test_live_at() {
        let v = EntryView {
            kind: NodeKind::Leaf,
            class_id: 0,
            addr: StorageAddr::default(),
            tag: 1,
            birth_epoch: 5,
            retire_epoch: 10,
        };
        assert!(!v.live_at(4));
        assert!(v.live_at(5));
        assert!(v.live_at(9));
        assert!(!v.live_at(10));
    }
}
