//! Stable node identifiers.
//!
//! A `NodeId` packs a 48-bit handle index and a 16-bit reuse tag into one
//! 64-bit value. The handle index is a slot in the object table; the tag is
//! bumped on every FREE→RESERVED transition of that slot, so the pair
//! uniquely identifies an *allocation instance*. A reader holding a stale
//! `NodeId` after the slot was reused sees a tag mismatch and treats the
//! id as invalidated.

/// Number of bits reserved for the reuse tag (low bits).
pub const TAG_BITS: u32 = 16;

/// Number of bits available for the handle index (high bits).
pub const HANDLE_BITS: u32 = 48;

/// Largest representable handle index.
pub const MAX_HANDLE: u64 = (1 << HANDLE_BITS) - 1;

/// Stable 64-bit node identifier: `(handle_index << 16) | tag`.
///
/// The zero value (and any value with handle index 0) is invalid; handle 0
/// is never issued by the object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(u64);

impl NodeId {
    /// The invalid identifier (raw 0).
    pub const INVALID: NodeId = NodeId(0);

    /// Pack a handle index and tag into a `NodeId`.
    ///
    /// The handle must fit in 48 bits.
    #[inline]
    pub fn from_parts(handle_index: u64, tag: u16) -> Self {
        debug_assert!(handle_index <= MAX_HANDLE, "handle index out of range");
        NodeId((handle_index << TAG_BITS) | tag as u64)
    }

    /// Reinterpret a raw 64-bit value as a `NodeId`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        NodeId(raw)
    }

    /// The raw 64-bit value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The 48-bit handle index.
    #[inline]
    pub fn handle_index(self) -> u64 {
        self.0 >> TAG_BITS
    }

    /// The 16-bit reuse tag.
    #[inline]
    pub fn tag(self) -> u16 {
        self.0 as u16
    }

    /// True iff this id could have been issued: nonzero raw value with a
    /// nonzero handle index.
    #[inline]
    pub fn valid(self) -> bool {
        self.0 != 0 && self.handle_index() != 0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.handle_index(), self.tag())
    }
}
