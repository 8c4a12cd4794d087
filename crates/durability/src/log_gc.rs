//! Delta-log garbage collection.
//!
//! Given a checkpoint at epoch C, a log is prunable iff it is closed
//! (`end_epoch != 0`), fully covered (`end_epoch <= C`), and the retention
//! policy allows it. Closed logs are considered newest-first; the first
//! `min_keep_logs` closed logs are kept unconditionally, then the rest are
//! pruned if covered. The active log is never touched and never counts
//! toward the keep floor.

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use xylem_core::Result;
use xylem_storage::fs::{PlatformFs, StdFs};

use crate::manifest::{DeltaLogInfo, ManifestFile};

/// Retention policy for closed delta logs.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Closed logs to keep unconditionally, newest first.
    pub min_keep_logs: usize,
    /// Minimum file age before a covered log may be deleted.
    pub min_age: Duration,
    /// Checkpoints of lag before GC engages; nonzero disables pruning
    /// until the lagged bookkeeping is wired by the embedder.
    pub lag_checkpoints: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            min_keep_logs: 2,
            min_age: Duration::ZERO,
            lag_checkpoints: 0,
        }
    }
}

/// Log garbage collector.
pub struct LogGc {
    retention: RetentionPolicy,
}

impl LogGc {
    /// Collector with the given retention policy.
    pub fn new(retention: RetentionPolicy) -> Self {
        LogGc { retention }
    }

    /// Delete closed logs fully covered by the checkpoint at
    /// `checkpoint_epoch`, honoring retention. Updates and persists the
    /// manifest when anything was deleted. Returns the number of logs
    /// removed.
    pub fn prune_covered(
        &self,
        manifest: &mut ManifestFile,
        checkpoint_epoch: u64,
    ) -> Result<usize> {
        if self.retention.lag_checkpoints > 0 {
            debug!("log GC disabled by lag_checkpoints retention");
            return Ok(0);
        }
        let logs = manifest.delta_logs().to_vec();
        let closed: usize = logs.iter().filter(|l| !l.is_active()).count();
        if closed <= self.retention.min_keep_logs {
            return Ok(0);
        }

        // Newest closed logs first; the active log is skipped outright.
        let mut ordered: Vec<&DeltaLogInfo> = logs.iter().filter(|l| !l.is_active()).collect();
        ordered.sort_by(|a, b| b.start_epoch.cmp(&a.start_epoch));

        let mut kept_closed = 0usize;
        let mut prune: Vec<&DeltaLogInfo> = Vec::new();
        for log in ordered {
            if kept_closed < self.retention.min_keep_logs {
                kept_closed += 1;
                continue;
            }
            let covered = log.end_epoch <= checkpoint_epoch;
            if covered && self.old_enough(manifest, log) {
                prune.push(log);
            } else {
                kept_closed += 1;
            }
        }
        if prune.is_empty() {
            return Ok(0);
        }

        let mut deleted_paths: Vec<String> = Vec::new();
        let mut log_dir: Option<PathBuf> = None;
        for log in prune {
            let full = manifest.resolve(&log.path);
            match std::fs::remove_file(&full) {
                Ok(()) => {
                    debug!(path = %full.display(), end_epoch = log.end_epoch, "pruned delta log");
                    if log_dir.is_none() {
                        log_dir = full.parent().map(|p| p.to_path_buf());
                    }
                    deleted_paths.push(log.path.clone());
                }
                Err(e) => {
                    warn!(path = %full.display(), error = %e, "failed to prune delta log");
                }
            }
        }
        if deleted_paths.is_empty() {
            return Ok(0);
        }

        if let Some(dir) = log_dir {
            StdFs.fsync_directory(&dir)?;
        }
        let remaining: Vec<DeltaLogInfo> = logs
            .into_iter()
            .filter(|l| !deleted_paths.contains(&l.path))
            .collect();
        let deleted = deleted_paths.len();
        manifest.set_delta_logs(remaining);
        manifest.store()?;
        Ok(deleted)
    }

    fn old_enough(&self, manifest: &ManifestFile, log: &DeltaLogInfo) -> bool {
        if self.retention.min_age.is_zero() {
            return true;
        }
        let full = manifest.resolve(&log.path);
        match std::fs::metadata(&full).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age >= self.retention.min_age,
                Err(_) => false,
            },
            // Unknown age: keep the log, never delete blind.
            Err(_) => false,
        }
    }
}
