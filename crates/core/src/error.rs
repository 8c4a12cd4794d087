//! Error types for the persistence core.
//!
//! One unified error enum covers every fallible boundary. The background
//! coordinator never propagates these out of its loop; it routes them to a
//! reported-error callback and a metrics counter instead. Writers see them
//! from `allocate`, commit, and publish and are expected to drop the
//! in-flight operation and retry at a higher layer.

use std::io;
use thiserror::Error;

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the core distinguishes.
#[derive(Debug, Error)]
pub enum Error {
    /// Any failure of the file-system abstraction.
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] io::Error),

    /// CRC or magic mismatch in a checkpoint file. Recovery refuses the
    /// file and falls back to the previous checkpoint if present.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Framing error in the delta log. Replay stops at the bad record;
    /// the max epoch seen so far is adopted.
    #[error("corrupt delta record at offset {offset}: {reason}")]
    CorruptDeltaRecord {
        /// Byte offset of the bad frame within the log file.
        offset: u64,
        /// What failed to validate.
        reason: String,
    },

    /// The manifest document failed to parse or validate.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    /// The object table cannot grow another slab within its configured
    /// maximum. Fatal; propagated to the writer.
    #[error("object table full: {0}")]
    TableFull(String),

    /// API misuse: retire of a free slot, commit without reserve, tag
    /// mismatch. Debug builds assert; release builds surface this and
    /// bump a diagnostic counter.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A retriable race, e.g. an append that lost to log rotation. The
    /// caller retries within a bounded window.
    #[error("transient: {0}")]
    Transient(String),
}

impl Error {
    /// True for errors the caller should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True for on-disk corruption (checkpoint, delta log, or manifest).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptCheckpoint(_)
                | Error::CorruptDeltaRecord { .. }
                | Error::CorruptManifest(_)
        )
    }
}
