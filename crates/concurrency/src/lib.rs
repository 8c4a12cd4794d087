//! Epoch-based MVCC context.
//!
//! Readers pin the epoch they are reading at; the reclaimer frees retired
//! storage only below the minimum pinned epoch. The design is a process-wide
//! monotonic epoch counter plus one cache-line-aligned pin slot per
//! registered thread:
//!
//! - pinning and unpinning are plain release stores into the thread's slot,
//!   no locks on the read path;
//! - `min_active_epoch` acquire-scans every slot and is called only by the
//!   reclaimer, so it may take the registration lock;
//! - slots are allocated once per thread and never removed, giving stable
//!   addresses for the scan.

mod context;

pub use context::{EpochGuard, MvccContext, PinSlot, DEFAULT_MAX_THREADS};
