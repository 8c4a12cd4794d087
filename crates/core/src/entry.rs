//! Persisted object-table row format.
//!
//! `PersistentEntry` is the single on-disk row shape shared by the
//! checkpoint file and the delta log, little-endian, exactly 48 bytes:
//!
//! ```text
//! ┌──────────────┬─────────────┬────────────────┬────────────┬────────────┐
//! │ handle_idx 8 │ file_id 4   │ segment_id 4   │ offset 8   │ length 4   │
//! ├──────────────┼─────────────┼────────────────┼────────────┼────────────┤
//! │ class_id 1   │ kind 1      │ tag 2          │ birth 8    │ retire 8   │
//! └──────────────┴─────────────┴────────────────┴────────────┴────────────┘
//! ```
//!
//! No pointers, no variable-length fields; a row is replayable in isolation.

use crate::types::{NodeKind, StorageAddr, RETIRE_EPOCH_LIVE};

/// Size of one persisted row in bytes.
pub const PERSISTENT_ENTRY_SIZE: usize = 48;

/// One persisted object-table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentEntry {
    /// Global handle index this row describes.
    pub handle_idx: u64,
    /// Segment file id.
    pub file_id: u32,
    /// Segment index within the file.
    pub segment_id: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Range length in bytes.
    pub length: u32,
    /// Allocator size class.
    pub class_id: u8,
    /// Node kind byte (`NodeKind`).
    pub kind: u8,
    /// Reuse tag at the time the row was produced.
    pub tag: u16,
    /// Epoch at which the node became visible; 0 = not live.
    pub birth_epoch: u64,
    /// Epoch at which the node was retired; `u64::MAX` = live.
    pub retire_epoch: u64,
}

impl PersistentEntry {
    /// Serialize to the fixed 48-byte little-endian layout.
    pub fn to_bytes(&self) -> [u8; PERSISTENT_ENTRY_SIZE] {
        let mut b = [0u8; PERSISTENT_ENTRY_SIZE];
        b[0..8].copy_from_slice(&self.handle_idx.to_le_bytes());
        b[8..12].copy_from_slice(&self.file_id.to_le_bytes());
        b[12..16].copy_from_slice(&self.segment_id.to_le_bytes());
        b[16..24].copy_from_slice(&self.offset.to_le_bytes());
        b[24..28].copy_from_slice(&self.length.to_le_bytes());
        b[28] = self.class_id;
        b[29] = self.kind;
        b[30..32].copy_from_slice(&self.tag.to_le_bytes());
        b[32..40].copy_from_slice(&self.birth_epoch.to_le_bytes());
        b[40..48].copy_from_slice(&self.retire_epoch.to_le_bytes());
        b
    }

    /// Deserialize from a 48-byte slice. Returns `None` if the slice is
    /// too short.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < PERSISTENT_ENTRY_SIZE {
            return None;
        }
        Some(PersistentEntry {
            handle_idx: u64::from_le_bytes(b[0..8].try_into().ok()?),
            file_id: u32::from_le_bytes(b[8..12].try_into().ok()?),
            segment_id: u32::from_le_bytes(b[12..16].try_into().ok()?),
            offset: u64::from_le_bytes(b[16..24].try_into().ok()?),
            length: u32::from_le_bytes(b[24..28].try_into().ok()?),
            class_id: b[28],
            kind: b[29],
            tag: u16::from_le_bytes(b[30..32].try_into().ok()?),
            birth_epoch: u64::from_le_bytes(b[32..40].try_into().ok()?),
            retire_epoch: u64::from_le_bytes(b[40..48].try_into().ok()?),
        })
    }

    /// The storage address carried by this row.
    #[inline]
    pub fn addr(&self) -> StorageAddr {
        StorageAddr {
            file_id: self.file_id,
            segment_id: self.segment_id,
            offset: self.offset,
            length: self.length,
        }
    }

    /// True iff this row has the free-slot shape: never committed and
    /// never retired. Such rows must not appear in checkpoints and are
    /// skipped on restore.
    #[inline]
    pub fn is_reserved_shape(&self) -> bool {
        self.birth_epoch == 0 && self.retire_epoch == RETIRE_EPOCH_LIVE
    }

    /// The epoch this row is attributable to for replay-window tracking:
    /// the retire epoch if retired, otherwise the birth epoch.
    #[inline]
    pub fn record_epoch(&self) -> u64 {
        if self.retire_epoch != RETIRE_EPOCH_LIVE {
            self.retire_epoch.max(self.birth_epoch)
        } else {
            self.birth_epoch
        }
    }

    /// Decoded node kind, if the byte is a known variant.
    #[inline]
    pub fn node_kind(&self) -> Option<NodeKind> {
        NodeKind::from_u8(self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistentEntry {
        PersistentEntry {
            handle_idx: 0x0123_4567_89AB,
            file_id: 7,
            segment_id: 3,
            offset: 0xDEAD_BEEF,
            length: 4096,
            class_id: 5,
            kind: NodeKind::Leaf.as_u8(),
            tag: 0xBEEF,
            birth_epoch: 42,
            retire_epoch: RETIRE_EPOCH_LIVE,
        }
    }

    #[test]
    fn test_roundtrip() {
        let e = sample();
        let bytes = e.to_bytes();
        assert_eq!(PersistentEntry::from_bytes(&bytes), Some(e));
    }

    #[test]
    fn test_exact_field_offsets() {
        let e = sample();
        let b = e.to_bytes();
        assert_eq!(u64::from_le_bytes(b[0..8].try_into().unwrap()), e.handle_idx);
        assert_eq!(u32::from_le_bytes(b[8..12].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(b[12..16].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(b[16..24].try_into().unwrap()), 0xDEAD_BEEF);
        assert_eq!(u32::from_le_bytes(b[24..28].try_into().unwrap()), 4096);
        assert_eq!(b[28], 5);
        assert_eq!(b[29], 2);
        assert_eq!(u16::from_le_bytes(b[30..32].try_into().unwrap()), 0xBEEF);
        assert_eq!(u64::from_le_bytes(b[32..40].try_into().unwrap()), 42);
        assert_eq!(
            u64::from_le_bytes(b[40..48].try_into().unwrap()),
            RETIRE_EPOCH_LIVE
        );
    }

    #[test]
    fn test_short_slice_rejected() {
        assert_eq!(PersistentEntry::from_bytes(&[0u8; 47]), None);
    }

    #[test]
    fn test_record_epoch() {
        let mut e = sample();
        assert_eq!(e.record_epoch(), 42);
        e.retire_epoch = 50;
        assert_eq!(e.record_epoch(), 50);
        e.retire_epoch = 10;
        // Retired rows report at least their birth epoch
        assert_eq!(e.record_epoch(), 42);
    }

    #[test]
    fn test_reserved_shape() {
        let mut e = sample();
        assert!(!e.is_reserved_shape());
        e.birth_epoch = 0;
        assert!(e.is_reserved_shape());
        e.retire_epoch = 9;
        assert!(!e.is_reserved_shape());
    }
}
