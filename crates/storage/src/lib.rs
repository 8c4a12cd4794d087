//! Storage layer: the sharded object table, the segment allocator, and the
//! platform file-system abstraction.
//!
//! The object table is the authoritative map from stable node handles to
//! physical storage locations. It is sharded into independent serial tables
//! so writers on different shards never contend; readers resolve handles
//! without taking any lock at all.

pub mod allocator;
pub mod entry;
pub mod fs;
pub mod shard;
pub mod sharded;

pub use allocator::{Allocation, AllocatorConfig, SegmentAllocator};
pub use entry::{EntryView, OtEntry};
pub use fs::{write_atomic, PlatformFs, StdFs};
pub use shard::{Shard, ShardConfig, ShardStats};
pub use sharded::{ShardedObjectTable, TableConfig};
