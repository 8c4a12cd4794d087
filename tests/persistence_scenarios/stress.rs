//! Concurrent churn: many writer threads against the runtime while the
//! reclaimer interleaves, plus reader-pinned reclamation fencing.
//!
//! Workloads are driven by seeded RNGs — operation mix, size classes, and
//! iteration counts vary per run shape while staying reproducible.

use rand::prelude::*;
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xylem::{AllocatorConfig, CheckpointPolicy, DurableRuntime, NodeKind, TableConfig};

fn open_sharded(dir: &std::path::Path) -> Arc<DurableRuntime> {
    DurableRuntime::open_with(
        dir,
        CheckpointPolicy::for_testing(),
        TableConfig::for_testing(8),
        AllocatorConfig::for_testing(),
    )
    .unwrap()
}

#[test]
fn concurrent_churn_with_reclaimer() {
    let dir = tempfile::tempdir().unwrap();
    let rt = open_sharded(dir.path());

    let threads = 8u64;
    let stop = Arc::new(AtomicBool::new(false));

    // Reclaimer interleaving on a timer, as in production.
    let reclaim_handle = {
        let rt = Arc::clone(&rt);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut total = 0usize;
            while !stop.load(Ordering::Relaxed) {
                total += rt.reclaimer().run_once();
                std::thread::sleep(Duration::from_millis(10));
            }
            total
        })
    };

    let writers: Vec<_> = (0..threads)
        .map(|t| {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE ^ t);
                let cycles = rng.gen_range(800..1200);
                let mut kept = Vec::new();
                let mut retired = 0u64;
                for _ in 0..cycles {
                    let class = rng.gen_range(0..4u8);
                    let node = rt.allocate_node(NodeKind::Leaf, class).unwrap();
                    let op: u8 = rng.gen_range(0..8);
                    match op {
                        0 => {
                            // Abandon the reservation before commit.
                            assert!(rt.abort_node(node));
                        }
                        1..=4 => {
                            let epoch = rt.advance_epoch();
                            rt.commit_node(node.id, epoch).unwrap();
                            let retire_epoch = rt.advance_epoch();
                            rt.retire_node(node.id, retire_epoch).unwrap();
                            retired += 1;
                        }
                        _ => {
                            let epoch = rt.advance_epoch();
                            rt.commit_node(node.id, epoch).unwrap();
                            kept.push(node.id);
                        }
                    }
                }
                (kept, retired)
            })
        })
        .collect();

    let mut kept = Vec::new();
    let mut total_retired = 0u64;
    for w in writers {
        let (k, r) = w.join().unwrap();
        kept.extend(k);
        total_retired += r;
    }
    stop.store(true, Ordering::Relaxed);
    let _reclaimed_during = reclaim_handle.join().unwrap();

    // Everything kept open is live; everything retired is reclaimable.
    assert_eq!(rt.table().count_live(), kept.len());
    for id in &kept {
        assert!(rt.table().lookup(*id).is_some());
    }

    // A final pass drains whatever the timer missed: no retired entry
    // lingers below min_active_epoch, and every retire was reclaimed
    // exactly once.
    rt.advance_epoch();
    rt.reclaimer().run_once();
    let stats = rt.table().stats();
    assert_eq!(stats.total_retires, total_retired);
    assert_eq!(stats.total_reclaims, stats.total_retires);
    assert_eq!(rt.table().retired_count(), 0);
    assert_eq!(rt.table().invalid_ops(), 0);
    rt.shutdown();
}

#[test]
fn stale_ids_never_resolve_to_reused_slots() {
    let dir = tempfile::tempdir().unwrap();
    let rt = open_sharded(dir.path());
    let mut rng = StdRng::seed_from_u64(0x57A1E);

    let churn = rng.gen_range(150..300);
    let mut stale = Vec::new();
    for _ in 0..churn {
        let class = rng.gen_range(0..4u8);
        let node = rt.allocate_node(NodeKind::Leaf, class).unwrap();
        let epoch = rt.advance_epoch();
        rt.commit_node(node.id, epoch).unwrap();
        let retire_epoch = rt.advance_epoch();
        rt.retire_node(node.id, retire_epoch).unwrap();
        stale.push(node.id);
    }
    rt.advance_epoch();
    rt.reclaimer().run_once();

    // Reuse the freed handles.
    let mut fresh = Vec::new();
    for _ in 0..churn {
        let node = rt
            .allocate_node(NodeKind::Leaf, rng.gen_range(0..4u8))
            .unwrap();
        let epoch = rt.advance_epoch();
        rt.commit_node(node.id, epoch).unwrap();
        fresh.push(node.id);
    }

    for id in &stale {
        assert!(
            rt.table().lookup(*id).is_none(),
            "stale id {id} must not resolve after reuse"
        );
    }
    for id in &fresh {
        assert!(rt.table().lookup(*id).is_some());
    }
    rt.shutdown();
}

#[test]
fn pinned_reader_sees_stable_entry_during_churn() {
    let dir = tempfile::tempdir().unwrap();
    let rt = open_sharded(dir.path());

    let node = rt.allocate_node(NodeKind::Leaf, 3).unwrap();
    let epoch = rt.advance_epoch();
    rt.commit_node(node.id, epoch).unwrap();
    let expected = rt.table().lookup(node.id).unwrap();

    // Reader pins the commit epoch; the writer retires the node but the
    // reclaimer must not free it while the pin is held.
    let pin = rt.mvcc().pin(epoch).unwrap();
    let retire_epoch = rt.advance_epoch();
    rt.retire_node(node.id, retire_epoch).unwrap();
    rt.advance_epoch();

    assert_eq!(rt.reclaimer().run_once(), 0);
    let view = rt.table().lookup(node.id).unwrap();
    assert_eq!(view.addr, expected.addr);
    assert_eq!(view.kind, expected.kind);
    assert_eq!(view.class_id, expected.class_id);
    assert_eq!(view.birth_epoch, expected.birth_epoch);

    drop(pin);
    rt.reclaimer().run_once();
    assert!(rt.table().lookup(node.id).is_none());
    rt.mvcc().deregister_thread();
    rt.shutdown();
}

#[test]
fn background_coordinator_survives_churn_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0xB006);
    let committed;
    {
        let mut policy = CheckpointPolicy::for_testing();
        policy.rotate_bytes = 8 * 1024; // force rotations under churn
        let rt = DurableRuntime::open_with(
            dir.path(),
            policy,
            TableConfig::for_testing(4),
            AllocatorConfig::for_testing(),
        )
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..rng.gen_range(300..700) {
            let node = rt
                .allocate_node(NodeKind::Leaf, rng.gen_range(0..3u8))
                .unwrap();
            let epoch = rt.advance_epoch();
            rt.commit_node(node.id, epoch).unwrap();
            ids.push(node.id);
        }
        rt.coordinator().request_checkpoint();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rt.coordinator().stats().checkpoints_written == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        committed = ids;
        rt.shutdown();
    }

    let rt = DurableRuntime::open_with(
        dir.path(),
        CheckpointPolicy::for_testing(),
        TableConfig::for_testing(4),
        AllocatorConfig::for_testing(),
    )
    .unwrap();
    assert_eq!(rt.table().count_live(), committed.len());
    for id in &committed {
        assert!(rt.table().lookup(*id).is_some());
    }
    rt.shutdown();
}
