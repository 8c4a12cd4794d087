//! The manifest: durable index of the current checkpoint and delta logs.
//!
//! A small JSON document (`manifest.json` at the data-dir root) persisted
//! with the temp → fsync → rename → dir-fsync discipline. All paths inside
//! it are relative to the data directory.
//!
//! Invariant: at most one delta log has `end_epoch == 0` (the active log),
//! and its start epoch is strictly greater than every closed log's end
//! epoch.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use xylem_core::{Error, Result};
use xylem_storage::fs::{write_atomic, StdFs};

/// Manifest file name at the data-dir root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// The current checkpoint as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Path relative to the data directory.
    pub path: String,
    /// Commit epoch of the snapshot.
    pub epoch: u64,
    /// File size in bytes.
    pub size: u64,
    /// Number of rows.
    pub entries: u64,
    /// CRC over the entry block.
    pub crc: u32,
}

/// One delta log as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaLogInfo {
    /// Path relative to the data directory (`logs/delta_….wal`).
    pub path: String,
    /// First epoch this log may contain.
    pub start_epoch: u64,
    /// Final epoch of a closed log; 0 marks the active log.
    pub end_epoch: u64,
    /// Final size of a closed log in bytes; 0 while active.
    pub size: u64,
}

impl DeltaLogInfo {
    /// True for the active log.
    pub fn is_active(&self) -> bool {
        self.end_epoch == 0
    }
}

/// One named root in the catalog (multi-tree hosting).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootEntry {
    /// Tree name; empty string is the primary root.
    pub name: String,
    /// Raw `NodeId` of the root.
    pub node_id_raw: u64,
    /// Epoch the root was recorded at.
    pub epoch: u64,
    /// Optional bounding rectangle of the tree, interleaved min/max.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mbr: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ManifestDoc {
    version: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    checkpoint: Option<CheckpointInfo>,
    #[serde(default)]
    delta_logs: Vec<DeltaLogInfo>,
    #[serde(default)]
    roots: Vec<RootEntry>,
}

impl Default for ManifestDoc {
    fn default() -> Self {
        ManifestDoc {
            version: MANIFEST_VERSION,
            checkpoint: None,
            delta_logs: Vec::new(),
            roots: Vec::new(),
        }
    }
}

/// In-memory manifest bound to its data directory.
#[derive(Debug)]
pub struct ManifestFile {
    data_dir: PathBuf,
    doc: ManifestDoc,
}

impl ManifestFile {
    /// Load the manifest if present, else start empty.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(MANIFEST_FILE);
        let doc = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let doc: ManifestDoc = serde_json::from_slice(&bytes)
                .map_err(|e| Error::CorruptManifest(e.to_string()))?;
            let active = doc.delta_logs.iter().filter(|l| l.is_active()).count();
            if active > 1 {
                return Err(Error::CorruptManifest(format!(
                    "{active} delta logs marked active"
                )));
            }
            doc
        } else {
            ManifestDoc::default()
        };
        Ok(ManifestFile {
            data_dir: data_dir.to_path_buf(),
            doc,
        })
    }

    /// Persist atomically (temp → fsync → rename → dir fsync).
    pub fn store(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.doc)
            .map_err(|e| Error::CorruptManifest(e.to_string()))?;
        write_atomic(&StdFs, &self.manifest_path(), &bytes)
    }

    /// Path of the manifest document.
    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    /// The data directory this manifest is rooted at.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Resolve a manifest-relative path against the data directory.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.data_dir.join(rel)
    }

    // ------------------------------------------------------------------
    // Checkpoint section
    // ------------------------------------------------------------------

    /// The recorded checkpoint, if any.
    pub fn checkpoint(&self) -> Option<&CheckpointInfo> {
        self.doc.checkpoint.as_ref()
    }

    /// Epoch of the recorded checkpoint (0 when none).
    pub fn checkpoint_epoch(&self) -> u64 {
        self.doc.checkpoint.as_ref().map_or(0, |c| c.epoch)
    }

    /// Record a new checkpoint. Not persisted until `store`.
    pub fn set_checkpoint(&mut self, info: CheckpointInfo) {
        self.doc.checkpoint = Some(info);
    }

    // ------------------------------------------------------------------
    // Delta-log section
    // ------------------------------------------------------------------

    /// All recorded logs, oldest first.
    pub fn delta_logs(&self) -> &[DeltaLogInfo] {
        &self.doc.delta_logs
    }

    /// Replace the log list wholesale (log GC).
    pub fn set_delta_logs(&mut self, logs: Vec<DeltaLogInfo>) {
        self.doc.delta_logs = logs;
    }

    /// The active log entry, if one exists.
    pub fn active_log(&self) -> Option<&DeltaLogInfo> {
        self.doc.delta_logs.iter().find(|l| l.is_active())
    }

    /// Append a log entry. Adding a second active log is refused.
    pub fn add_delta_log(&mut self, info: DeltaLogInfo) -> Result<()> {
        if info.is_active() && self.active_log().is_some() {
            return Err(Error::InvalidState(
                "manifest already has an active delta log".into(),
            ));
        }
        self.doc.delta_logs.push(info);
        Ok(())
    }

    /// Close the log recorded under exactly `path` (the relative path
    /// stored at activation). Returns false if no active entry matches.
    pub fn close_delta_log(&mut self, path: &str, end_epoch: u64, size: u64) -> bool {
        for log in self.doc.delta_logs.iter_mut() {
            if log.path == path && log.is_active() {
                log.end_epoch = end_epoch;
                log.size = size;
                return true;
            }
        }
        false
    }

    /// Logs whose epoch range overlaps `(checkpoint_epoch, ∞)`: the active
    /// log plus every closed log ending after the checkpoint.
    pub fn logs_after_checkpoint(&self, checkpoint_epoch: u64) -> Vec<DeltaLogInfo> {
        let mut logs: Vec<DeltaLogInfo> = self
            .doc
            .delta_logs
            .iter()
            .filter(|l| l.is_active() || l.end_epoch > checkpoint_epoch)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.start_epoch);
        logs
    }

    // ------------------------------------------------------------------
    // Root catalog
    // ------------------------------------------------------------------

    /// The named-root catalog.
    pub fn roots(&self) -> &[RootEntry] {
        &self.doc.roots
    }

    /// Replace the named-root catalog. Not persisted until `store`.
    pub fn set_roots(&mut self, roots: Vec<RootEntry>) {
        self.doc.roots = roots;
    }
}
