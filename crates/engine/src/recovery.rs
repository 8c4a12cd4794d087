//! Cold-start recovery: checkpoint restore plus bounded WAL replay.
//!
//! Candidate checkpoints are tried in order of trust: the one the manifest
//! records first, then a directory scan newest-first. A checkpoint file
//! that was renamed into place but never committed to the manifest (crash
//! between rename and manifest store) is thereby ignored in favor of the
//! recorded one, and the delta logs after the recorded checkpoint replay
//! over it. A corrupt candidate is refused and the next older one is
//! tried; with no usable checkpoint at all, recovery replays every log
//! from an empty table.

use std::path::PathBuf;
use tracing::{info, warn};
use xylem_core::{Error, Result};
use xylem_durability::{checkpoint, wal, CheckpointReader, ManifestFile};
use xylem_storage::ShardedObjectTable;

/// What recovery found and rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Epoch of the checkpoint that was restored (0 = none usable).
    pub checkpoint_epoch: u64,
    /// Rows restored from the checkpoint.
    pub checkpoint_rows: u64,
    /// Largest epoch seen across checkpoint and replayed deltas.
    pub max_replayed_epoch: u64,
    /// Bytes of delta records replayed.
    pub replay_bytes: u64,
    /// Delta records applied.
    pub records_applied: u64,
    /// Log files replayed (fully or partially).
    pub logs_replayed: usize,
    /// True if replay stopped early at a damaged record.
    pub replay_truncated: bool,
}

/// Rebuild the object table from the latest usable checkpoint plus the
/// delta logs after it, and leave the table ready for writers.
///
/// Must run before any reader or writer thread starts.
pub fn cold_start(
    data_dir: &std::path::Path,
    ot: &ShardedObjectTable,
    manifest: &ManifestFile,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    ot.begin_recovery();

    // Restore the newest checkpoint that validates.
    let mut restored: Option<(PathBuf, u64)> = None;
    for (path, label_epoch) in checkpoint_candidates(data_dir, manifest) {
        match CheckpointReader::open(&path) {
            Ok(reader) => {
                for row in reader.entries() {
                    ot.restore_handle(&row)?;
                }
                report.checkpoint_epoch = reader.epoch();
                report.checkpoint_rows = reader.entry_count();
                report.max_replayed_epoch = reader.epoch();
                restored = Some((path, reader.epoch()));
                break;
            }
            Err(e) if e.is_corruption() => {
                warn!(
                    path = %path.display(),
                    epoch = label_epoch,
                    error = %e,
                    "refusing damaged checkpoint, falling back"
                );
                continue;
            }
            Err(e) => {
                ot.end_recovery();
                return Err(e);
            }
        }
    }
    match &restored {
        Some((path, epoch)) => {
            info!(path = %path.display(), epoch, "restored checkpoint")
        }
        None => info!("no usable checkpoint; replaying all delta logs"),
    }

    // Replay every log overlapping (checkpoint_epoch, ∞) in start order.
    for log_info in manifest.logs_after_checkpoint(report.checkpoint_epoch) {
        let full = manifest.resolve(&log_info.path);
        if !full.exists() {
            warn!(path = %full.display(), "delta log listed in manifest is missing");
            continue;
        }
        let replay = wal::read_log(&full)?;
        for rec in &replay.records {
            ot.apply_delta(rec)?;
        }
        report.records_applied += replay.records.len() as u64;
        report.replay_bytes += replay.valid_bytes;
        report.max_replayed_epoch = report.max_replayed_epoch.max(replay.max_epoch);
        report.logs_replayed += 1;
        if let Some((offset, reason)) = replay.corruption {
            // The damaged record and everything after it never became
            // durable state; adopt what replayed and stop here.
            warn!(
                path = %full.display(),
                offset, reason, "replay stopped at damaged delta record"
            );
            report.replay_truncated = true;
            break;
        }
    }

    ot.end_recovery();
    info!(
        checkpoint_epoch = report.checkpoint_epoch,
        max_epoch = report.max_replayed_epoch,
        records = report.records_applied,
        bytes = report.replay_bytes,
        "recovery complete"
    );
    Ok(report)
}

/// Candidate checkpoints, most trusted first: the manifest's recorded
/// checkpoint, then the directory scan newest-first (paths deduplicated).
fn checkpoint_candidates(
    data_dir: &std::path::Path,
    manifest: &ManifestFile,
) -> Vec<(PathBuf, u64)> {
    let mut candidates: Vec<(PathBuf, u64)> = Vec::new();
    if let Some(info) = manifest.checkpoint() {
        candidates.push((manifest.resolve(&info.path), info.epoch));
    }
    for (path, epoch) in checkpoint::list_checkpoints(data_dir) {
        if !candidates.iter().any(|(p, _)| p == &path) {
            candidates.push((path, epoch));
        }
    }
    candidates.retain(|(p, _)| p.exists());
    candidates
}

/// Largest epoch any durable artifact claims; used to restore the MVCC
/// epoch alongside the superblock's committed epoch.
pub fn validate_epoch_sources(report: &RecoveryReport, superblock_epoch: u64) -> Result<u64> {
    if superblock_epoch > 0
        && report.max_replayed_epoch > 0
        && superblock_epoch > report.max_replayed_epoch
    {
        // A published superblock ahead of everything durable means the WAL
        // that backed it is gone; surface it rather than silently regress.
        return Err(Error::CorruptManifest(format!(
            "superblock epoch {superblock_epoch} exceeds recovered epoch {}",
            report.max_replayed_epoch
        )));
    }
    Ok(report.max_replayed_epoch.max(superblock_epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use xylem_core::{NodeKind, StorageAddr};
    use xylem_durability::{CheckpointInfo, CheckpointWriter, DeltaLog, DeltaLogInfo};
    use xylem_storage::TableConfig;

    fn table() -> ShardedObjectTable {
        ShardedObjectTable::new(TableConfig::for_testing(1), None)
    }

    fn commit_rows(ot: &ShardedObjectTable, n: u64, first_epoch: u64) -> Vec<xylem_core::NodeId> {
        (0..n)
            .map(|i| {
                let id = ot
                    .allocate(NodeKind::Leaf, 0, StorageAddr::new(1, 0, i * 4096, 4096))
                    .unwrap();
                ot.mark_live_commit(id, first_epoch + i);
                id
            })
            .collect()
    }

    #[test]
    fn test_empty_dir_recovers_empty() {
        let dir = tempdir().unwrap();
        let manifest = ManifestFile::load_or_default(dir.path()).unwrap();
        let ot = table();
        let report = cold_start(dir.path(), &ot, &manifest).unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(ot.count_live(), 0);
    }

    #[test]
    fn test_checkpoint_only_recovery() {
        let dir = tempdir().unwrap();
        let mut manifest = ManifestFile::load_or_default(dir.path()).unwrap();
        let source = table();
        let ids = commit_rows(&source, 5, 1);
        let rows = source.iterate_live_snapshot();
        let written = CheckpointWriter::new(dir.path()).unwrap().write(5, &rows).unwrap();
        manifest.set_checkpoint(CheckpointInfo {
            path: checkpoint::checkpoint_file_name(5),
            epoch: 5,
            size: written.size,
            entries: written.entries,
            crc: written.crc,
        });
        manifest.store().unwrap();

        let ot = table();
        let report = cold_start(dir.path(), &ot, &manifest).unwrap();
        assert_eq!(report.checkpoint_epoch, 5);
        assert_eq!(report.checkpoint_rows, 5);
        assert_eq!(ot.count_live(), 5);
        for id in ids {
            assert!(ot.lookup(id).is_some());
        }
    }

    #[test]
    fn test_replay_after_checkpoint() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        let mut manifest = ManifestFile::load_or_default(dir.path()).unwrap();

        // Checkpoint with 2 rows at epoch 2.
        let source = table();
        commit_rows(&source, 2, 1);
        let written = CheckpointWriter::new(dir.path())
            .unwrap()
            .write(2, &source.iterate_live_snapshot())
            .unwrap();
        manifest.set_checkpoint(CheckpointInfo {
            path: checkpoint::checkpoint_file_name(2),
            epoch: 2,
            size: written.size,
            entries: written.entries,
            crc: written.crc,
        });

        // Two more commits flow into a delta log after the checkpoint.
        let later = commit_rows(&source, 2, 3);
        let log_path = dir.path().join("logs").join(wal::log_file_name(1));
        let log = DeltaLog::open_for_append(&log_path, 1, 4096).unwrap();
        for id in &later {
            log.append(&[source.delta_record(*id).unwrap()]).unwrap();
        }
        log.close().unwrap();
        manifest
            .add_delta_log(DeltaLogInfo {
                path: format!("logs/{}", wal::log_file_name(1)),
                start_epoch: 3,
                end_epoch: 0,
                size: 0,
            })
            .unwrap();
        manifest.store().unwrap();

        let ot = table();
        let report = cold_start(dir.path(), &ot, &manifest).unwrap();
        assert_eq!(report.checkpoint_epoch, 2);
        assert_eq!(report.records_applied, 2);
        assert_eq!(report.max_replayed_epoch, 4);
        assert_eq!(ot.count_live(), 4);
        // The restored table keeps allocating past the recovered handles
        let next = ot
            .allocate(NodeKind::Leaf, 0, StorageAddr::new(1, 0, 0, 64))
            .unwrap();
        assert_eq!(next.handle_index(), 5);
    }

    #[test]
    fn test_corrupt_recorded_checkpoint_falls_back() {
        let dir = tempdir().unwrap();
        let mut manifest = ManifestFile::load_or_default(dir.path()).unwrap();

        let source = table();
        commit_rows(&source, 3, 1);
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        writer.write(2, &source.iterate_live_snapshot()[..2].to_vec()).unwrap();
        let newer = writer.write(3, &source.iterate_live_snapshot()).unwrap();
        manifest.set_checkpoint(CheckpointInfo {
            path: checkpoint::checkpoint_file_name(3),
            epoch: 3,
            size: newer.size,
            entries: newer.entries,
            crc: newer.crc,
        });
        manifest.store().unwrap();

        // Damage the recorded (newer) checkpoint.
        let newer_path = dir.path().join(checkpoint::checkpoint_file_name(3));
        let mut bytes = std::fs::read(&newer_path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        std::fs::write(&newer_path, &bytes).unwrap();

        let ot = table();
        let report = cold_start(dir.path(), &ot, &manifest).unwrap();
        assert_eq!(report.checkpoint_epoch, 2, "fell back to the older file");
        assert_eq!(ot.count_live(), 2);
    }

    #[test]
    fn test_unrecorded_newer_checkpoint_ignored() {
        // Crash between checkpoint rename and manifest store: the newer
        // file exists but the manifest still records the older one.
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        let mut manifest = ManifestFile::load_or_default(dir.path()).unwrap();

        let source = table();
        commit_rows(&source, 1, 1);
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let older = writer.write(1, &source.iterate_live_snapshot()).unwrap();
        manifest.set_checkpoint(CheckpointInfo {
            path: checkpoint::checkpoint_file_name(1),
            epoch: 1,
            size: older.size,
            entries: older.entries,
            crc: older.crc,
        });

        // Post-checkpoint commits go to the WAL...
        let later = commit_rows(&source, 2, 2);
        let log_path = dir.path().join("logs").join(wal::log_file_name(1));
        let log = DeltaLog::open_for_append(&log_path, 1, 4096).unwrap();
        for id in &later {
            log.append(&[source.delta_record(*id).unwrap()]).unwrap();
        }
        log.close().unwrap();
        manifest
            .add_delta_log(DeltaLogInfo {
                path: format!("logs/{}", wal::log_file_name(1)),
                start_epoch: 2,
                end_epoch: 0,
                size: 0,
            })
            .unwrap();
        manifest.store().unwrap();

        // ...and a newer checkpoint was renamed in but never recorded.
        writer.write(3, &source.iterate_live_snapshot()).unwrap();

        let ot = table();
        let report = cold_start(dir.path(), &ot, &manifest).unwrap();
        assert_eq!(report.checkpoint_epoch, 1, "manifest's checkpoint wins");
        assert_eq!(report.records_applied, 2, "both WAL records replayed");
        assert_eq!(ot.count_live(), 3);
    }

    #[test]
    fn test_corrupt_delta_stops_replay_keeps_prefix() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        let mut manifest = ManifestFile::load_or_default(dir.path()).unwrap();

        let source = table();
        let ids = commit_rows(&source, 3, 1);
        let log_path = dir.path().join("logs").join(wal::log_file_name(1));
        let log = DeltaLog::open_for_append(&log_path, 1, 4096).unwrap();
        for id in &ids {
            log.append(&[source.delta_record(*id).unwrap()]).unwrap();
        }
        log.close().unwrap();
        manifest
            .add_delta_log(DeltaLogInfo {
                path: format!("logs/{}", wal::log_file_name(1)),
                start_epoch: 1,
                end_epoch: 0,
                size: 0,
            })
            .unwrap();
        manifest.store().unwrap();

        // Damage the middle record.
        let mut bytes = std::fs::read(&log_path).unwrap();
        bytes[xylem_durability::RECORD_SIZE + 5] ^= 0xFF;
        std::fs::write(&log_path, &bytes).unwrap();

        let ot = table();
        let report = cold_start(dir.path(), &ot, &manifest).unwrap();
        assert!(report.replay_truncated);
        assert_eq!(report.records_applied, 1);
        assert_eq!(report.max_replayed_epoch, 1);
        assert_eq!(ot.count_live(), 1);
    }

    #[test]
    fn test_replay_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        let mut manifest = ManifestFile::load_or_default(dir.path()).unwrap();

        let source = table();
        let ids = commit_rows(&source, 4, 1);
        source.retire(ids[1], 9);
        let log_path = dir.path().join("logs").join(wal::log_file_name(1));
        let log = DeltaLog::open_for_append(&log_path, 1, 4096).unwrap();
        for id in &ids {
            log.append(&[source.delta_record(*id).unwrap()]).unwrap();
        }
        log.close().unwrap();
        manifest
            .add_delta_log(DeltaLogInfo {
                path: format!("logs/{}", wal::log_file_name(1)),
                start_epoch: 1,
                end_epoch: 0,
                size: 0,
            })
            .unwrap();
        manifest.store().unwrap();

        let run = || {
            let ot = table();
            cold_start(dir.path(), &ot, &manifest).unwrap();
            ot.iterate_live_snapshot()
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
    }

    #[test]
    fn test_validate_epoch_sources() {
        let mut report = RecoveryReport {
            max_replayed_epoch: 10,
            ..Default::default()
        };
        assert_eq!(validate_epoch_sources(&report, 7).unwrap(), 10);
        assert_eq!(validate_epoch_sources(&report, 0).unwrap(), 10);
        assert!(validate_epoch_sources(&report, 11).is_err());
        report.max_replayed_epoch = 0;
        assert_eq!(validate_epoch_sources(&report, 4).unwrap(), 4);
    }

    #[test]
    fn test_recovered_table_is_shareable() {
        let dir = tempdir().unwrap();
        let manifest = ManifestFile::load_or_default(dir.path()).unwrap();
        let ot = Arc::new(table());
        cold_start(dir.path(), &ot, &manifest).unwrap();
        let ot2 = Arc::clone(&ot);
        std::thread::spawn(move || {
            ot2.allocate(NodeKind::Leaf, 0, StorageAddr::new(1, 0, 0, 64))
                .unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(ot.stats().total_allocations, 1);
    }
}
