//! Crash-window scenarios: every step of the WAL → checkpoint → manifest
//! sequence can be interrupted, and recovery must land on a committed
//! prefix.

use std::path::Path;
use std::sync::Arc;
use xylem::{AllocatorConfig, CheckpointPolicy, DurableRuntime, NodeId, NodeKind, TableConfig};
use xylem_durability::{checkpoint, CheckpointWriter, RECORD_SIZE};

fn open(dir: &Path) -> Arc<DurableRuntime> {
    DurableRuntime::open_with(
        dir,
        CheckpointPolicy::for_testing(),
        TableConfig::single_shard(),
        AllocatorConfig::for_testing(),
    )
    .unwrap()
}

fn commit_one(rt: &DurableRuntime) -> NodeId {
    let node = rt.allocate_node(NodeKind::Leaf, 0).unwrap();
    let epoch = rt.advance_epoch();
    rt.commit_node(node.id, epoch).unwrap();
    rt.publish_root(node.id, epoch).unwrap();
    node.id
}

#[test]
fn checkpoint_renamed_but_manifest_not_updated() {
    // Crash between the checkpoint rename and the manifest store: the
    // newer checkpoint file is visible on disk but uncommitted. Recovery
    // uses the manifest's older checkpoint and replays the delta logs
    // over it, reaching the same state.
    let dir = tempfile::tempdir().unwrap();
    let mut ids = Vec::new();
    {
        let rt = open(dir.path());
        ids.push(commit_one(&rt));
        rt.coordinator().checkpoint_now().unwrap();
        ids.push(commit_one(&rt));
        ids.push(commit_one(&rt));

        // Simulate the torn window: a checkpoint file appears without a
        // manifest record.
        let rows = rt.table().iterate_live_snapshot();
        CheckpointWriter::new(dir.path())
            .unwrap()
            .write(3, &rows)
            .unwrap();
        rt.shutdown();
    }

    let rt = open(dir.path());
    assert_eq!(
        rt.recovery_report().checkpoint_epoch,
        1,
        "manifest's committed checkpoint wins over the unrecorded file"
    );
    assert!(rt.recovery_report().records_applied >= 2);
    assert_eq!(rt.table().count_live(), 3);
    for id in &ids {
        assert!(rt.table().lookup(*id).is_some());
    }
    rt.shutdown();
}

#[test]
fn torn_wal_tail_truncates_at_damage() {
    let dir = tempfile::tempdir().unwrap();
    let ids: Vec<NodeId>;
    {
        let rt = open(dir.path());
        ids = (0..3).map(|_| commit_one(&rt)).collect();
        rt.shutdown();
    }

    // Damage the middle record of the sealed log.
    let log_path = dir.path().join("logs/delta_000000000001.wal");
    let mut bytes = std::fs::read(&log_path).unwrap();
    bytes[RECORD_SIZE + 7] ^= 0xFF;
    std::fs::write(&log_path, &bytes).unwrap();

    let rt = open(dir.path());
    assert!(rt.recovery_report().replay_truncated);
    assert_eq!(rt.table().count_live(), 1);
    assert!(rt.table().lookup(ids[0]).is_some());
    assert!(rt.table().lookup(ids[1]).is_none());
    rt.shutdown();
}

#[test]
fn corrupt_checkpoint_falls_back_to_previous() {
    let dir = tempfile::tempdir().unwrap();
    {
        let rt = open(dir.path());
        commit_one(&rt);
        rt.coordinator().checkpoint_now().unwrap(); // epoch 1
        commit_one(&rt);
        rt.coordinator().checkpoint_now().unwrap(); // epoch 2
        rt.shutdown();
    }

    // Damage the newest checkpoint; the previous one plus WAL replay
    // still reconstructs everything.
    let (newest, epoch) = checkpoint::find_latest_checkpoint(dir.path()).unwrap();
    assert_eq!(epoch, 2);
    let mut bytes = std::fs::read(&newest).unwrap();
    bytes[100] ^= 0xFF;
    std::fs::write(&newest, &bytes).unwrap();

    let rt = open(dir.path());
    assert_eq!(rt.recovery_report().checkpoint_epoch, 1);
    assert_eq!(rt.table().count_live(), 2);
    rt.shutdown();
}

#[test]
fn torn_superblock_copy_reads_shadow() {
    let dir = tempfile::tempdir().unwrap();
    let (root, epoch);
    {
        let rt = open(dir.path());
        let id = commit_one(&rt);
        let snap = rt.persisted_root();
        root = id;
        epoch = snap.epoch;
        rt.shutdown();
    }

    // Damage the primary copy region of the superblock.
    let sb_path = dir.path().join("superblock");
    let mut bytes = std::fs::read(&sb_path).unwrap();
    bytes[20] ^= 0xFF;
    std::fs::write(&sb_path, &bytes).unwrap();

    let rt = open(dir.path());
    let snap = rt.persisted_root();
    assert_eq!(snap.root, root);
    assert_eq!(snap.epoch, epoch);
    rt.shutdown();
}

#[test]
fn corrupt_manifest_refuses_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let rt = open(dir.path());
        commit_one(&rt);
        rt.shutdown();
    }
    std::fs::write(dir.path().join("manifest.json"), b"{broken").unwrap();

    let err = DurableRuntime::open_with(
        dir.path(),
        CheckpointPolicy::for_testing(),
        TableConfig::single_shard(),
        AllocatorConfig::for_testing(),
    )
    .unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn double_restart_is_stable() {
    // Recovery twice in a row over the same state reaches the same table.
    let dir = tempfile::tempdir().unwrap();
    {
        let rt = open(dir.path());
        for _ in 0..5 {
            commit_one(&rt);
        }
        rt.coordinator().rotate_now().unwrap();
        commit_one(&rt);
        rt.shutdown();
    }
    let first = {
        let rt = open(dir.path());
        let rows = rt.table().iterate_live_snapshot();
        rt.shutdown();
        rows
    };
    let second = {
        let rt = open(dir.path());
        let rows = rt.table().iterate_live_snapshot();
        rt.shutdown();
        rows
    };
    assert_eq!(first, second);
    assert_eq!(first.len(), 6);
}
