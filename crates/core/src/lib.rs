//! Core types for the Xylem persistence engine.
//!
//! This crate defines the vocabulary shared by every other layer: stable
//! node identifiers, the persisted entry row format, the unified error
//! type, and the metrics capability. It has no I/O of its own.

pub mod cache;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod node_id;
pub mod types;

pub use cache::NodeCache;
pub use entry::{PersistentEntry, PERSISTENT_ENTRY_SIZE};
pub use error::{Error, Result};
pub use metrics::PersistenceMetrics;
pub use node_id::NodeId;
pub use types::{NodeKind, StorageAddr, NUM_SIZE_CLASSES, RETIRE_EPOCH_LIVE};
