//! Durability layer: delta log (WAL), checkpoint files, manifest,
//! superblock, and log GC.
//!
//! Everything here follows one crash-consistency discipline: bulk data is
//! written to a temp file, fsynced, atomically renamed into place, and the
//! parent directory fsynced. Small documents (manifest, superblock) are
//! replaced whole; append-only files (delta logs) carry per-record CRCs so
//! a torn tail is detectable at replay.

pub mod checkpoint;
pub mod log_gc;
pub mod manifest;
pub mod superblock;
pub mod wal;

pub use checkpoint::{
    find_latest_checkpoint, list_checkpoints, CheckpointReader, CheckpointWriter,
    WrittenCheckpoint,
};
pub use log_gc::{LogGc, RetentionPolicy};
pub use manifest::{CheckpointInfo, DeltaLogInfo, ManifestFile, RootEntry};
pub use superblock::{RootSnapshot, Superblock};
pub use wal::{read_log, DeltaLog, LogReplay, DEFAULT_PREALLOC_CHUNK, RECORD_SIZE};
