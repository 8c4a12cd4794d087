//! Property tests for the on-disk formats: checkpoint round trips and
//! delta-log framing under corruption.

use proptest::prelude::*;
use tempfile::tempdir;
use xylem_core::PersistentEntry;
use xylem_durability::{read_log, CheckpointReader, CheckpointWriter, DeltaLog, RECORD_SIZE};

fn row_strategy() -> impl Strategy<Value = PersistentEntry> {
    (
        1u64..1 << 40,
        1u32..1000,
        any::<u32>(),
        any::<u64>(),
        1u32..1 << 22,
        any::<u8>(),
        0u8..3,
        1u16..u16::MAX,
        (1u64..1 << 50, prop_oneof![Just(u64::MAX), (1u64..1 << 50)]),
    )
        .prop_map(
            |(handle_idx, file_id, segment_id, offset, length, class_id, kind, tag, (birth, retire))| {
                PersistentEntry {
                    handle_idx,
                    file_id,
                    segment_id,
                    offset,
                    length,
                    class_id,
                    kind,
                    tag,
                    birth_epoch: birth,
                    retire_epoch: retire,
                }
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Checkpoint write → map → read restores every row byte for byte.
    #[test]
    fn checkpoint_round_trip(rows in prop::collection::vec(row_strategy(), 0..64), epoch in 0u64..1 << 40) {
        let dir = tempdir().unwrap();
        let written = CheckpointWriter::new(dir.path()).unwrap().write(epoch, &rows).unwrap();
        let reader = CheckpointReader::open(&written.path).unwrap();
        prop_assert_eq!(reader.epoch(), epoch);
        prop_assert_eq!(reader.entries().collect::<Vec<_>>(), rows);
    }

    /// Any single flipped byte in the entry block is detected.
    #[test]
    fn checkpoint_detects_any_entry_corruption(
        rows in prop::collection::vec(row_strategy(), 1..16),
        byte in any::<usize>(),
    ) {
        let dir = tempdir().unwrap();
        let written = CheckpointWriter::new(dir.path()).unwrap().write(1, &rows).unwrap();
        let mut bytes = std::fs::read(&written.path).unwrap();
        let entries_len = rows.len() * 48;
        let at = 4096 + byte % entries_len;
        bytes[at] ^= 0xFF;
        std::fs::write(&written.path, &bytes).unwrap();
        prop_assert!(CheckpointReader::open(&written.path).is_err());
    }

    /// Replaying a log yields exactly the appended records in order,
    /// however the appends were batched.
    #[test]
    fn wal_replay_preserves_order(
        rows in prop::collection::vec(row_strategy(), 1..80),
        batch in 1usize..9,
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delta_000000000001.wal");
        let log = DeltaLog::open_for_append(&path, 1, 512).unwrap();
        for chunk in rows.chunks(batch) {
            log.append(chunk).unwrap();
        }
        log.close().unwrap();

        let replay = read_log(&path).unwrap();
        prop_assert!(replay.corruption.is_none());
        prop_assert_eq!(replay.records, rows);
    }

    /// A flipped byte anywhere in a record makes replay stop at that
    /// record, keeping the intact prefix.
    #[test]
    fn wal_corruption_keeps_prefix(
        rows in prop::collection::vec(row_strategy(), 2..40),
        victim in any::<usize>(),
        byte in any::<usize>(),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delta_000000000001.wal");
        let log = DeltaLog::open_for_append(&path, 1, 512).unwrap();
        log.append(&rows).unwrap();
        log.close().unwrap();

        let victim = victim % rows.len();
        let mut bytes = std::fs::read(&path).unwrap();
        let at = victim * RECORD_SIZE + byte % RECORD_SIZE;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let replay = read_log(&path).unwrap();
        prop_assert_eq!(replay.records.len(), victim);
        prop_assert_eq!(&replay.records[..], &rows[..victim]);
        let (offset, _) = replay.corruption.expect("damage must be detected");
        prop_assert_eq!(offset as usize, victim * RECORD_SIZE);
    }
}
