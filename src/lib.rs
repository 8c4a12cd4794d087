//! Xylem: the durable persistence core of a spatial index engine.
//!
//! Crash-consistent persistence for an in-memory tree of nodes, combining
//! three subsystems into one design:
//!
//! - a sharded, MVCC-aware **object table** mapping stable node handles to
//!   physical storage, with ABA-safe handle reuse and epoch-based
//!   reclamation,
//! - **write-ahead logging and checkpointing** coordinated by an adaptive
//!   background thread that snapshots the table, rotates logs, and
//!   garbage-collects obsolete ones,
//! - **multi-generation reclamation** so concurrent readers observe stable
//!   snapshots while writers retire and reclaim storage without copying.
//!
//! The usual entry point is [`DurableRuntime::open`], which recovers the
//! table from the latest checkpoint plus delta-log replay and starts the
//! coordinator.

pub use xylem_concurrency::{EpochGuard, MvccContext, PinSlot};
pub use xylem_core::{
    Error, NodeCache, NodeId, NodeKind, PersistenceMetrics, PersistentEntry, Result, StorageAddr,
};
pub use xylem_durability::{
    CheckpointReader, CheckpointWriter, DeltaLog, LogGc, ManifestFile, RetentionPolicy,
    RootSnapshot, Superblock,
};
pub use xylem_engine::{
    CheckpointCoordinator, CheckpointPolicy, CoordinatorStats, DurableRuntime, Paths, Reclaimer,
    RecoveryReport,
};
pub use xylem_storage::{
    Allocation, AllocatorConfig, EntryView, PlatformFs, SegmentAllocator, ShardedObjectTable,
    StdFs, TableConfig,
};
