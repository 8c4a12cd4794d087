//! Object-table checkpoint files.
//!
//! Binary snapshot of all non-free table rows at a commit epoch, for fast
//! bounded-replay recovery:
//!
//! ```text
//! +----------------------+ 0
//! | Header (4 KiB)       |  magic, version, epoch, count, row size, CRC
//! +----------------------+ 4096
//! | PersistentEntry × N  |  48-byte rows, contiguous
//! +----------------------+
//! | Footer (16 bytes)    |  total bytes, entries CRC, footer CRC
//! +----------------------+
//! ```
//!
//! All CRCs are computed with their own field zeroed. The file is written
//! to `<final>.tmp` and atomically renamed; the reader maps the whole file
//! and refuses it on any mismatch.

use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use xylem_core::{Error, PersistentEntry, Result, PERSISTENT_ENTRY_SIZE};

/// Header magic: `"OTCKPT1\0"`.
pub const CHECKPOINT_MAGIC: [u8; 8] = *b"OTCKPT1\0";

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Header block size.
pub const HEADER_SIZE: usize = 4096;

/// Footer size.
pub const FOOTER_SIZE: usize = 16;

// Header field offsets.
const H_MAGIC: usize = 0;
const H_VERSION: usize = 8;
const H_EPOCH: usize = 16;
const H_ENTRY_COUNT: usize = 24;
const H_ROW_SIZE: usize = 32;
const H_BLOCK_BYTES: usize = 36;
const H_CRC: usize = HEADER_SIZE - 4;

/// Metadata of a written checkpoint, recorded into the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenCheckpoint {
    /// Final file path.
    pub path: PathBuf,
    /// Commit epoch of the snapshot.
    pub epoch: u64,
    /// Total file size in bytes.
    pub size: u64,
    /// Number of rows.
    pub entries: u64,
    /// CRC over the entry block.
    pub crc: u32,
}

/// Checkpoint file name for an epoch.
pub fn checkpoint_file_name(epoch: u64) -> String {
    format!("ot_checkpoint_epoch-{epoch}.bin")
}

/// Parse the epoch out of a checkpoint file name.
pub fn parse_checkpoint_epoch(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("ot_checkpoint_epoch-")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

fn crc_with_zeroed(bytes: &[u8], zero_offset: usize, zero_len: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..zero_offset]);
    hasher.update(&[0u8; 4][..zero_len]);
    hasher.update(&bytes[zero_offset + zero_len..]);
    hasher.finalize()
}

fn build_header(epoch: u64, entry_count: u64) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[H_MAGIC..H_MAGIC + 8].copy_from_slice(&CHECKPOINT_MAGIC);
    h[H_VERSION..H_VERSION + 4].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    h[H_EPOCH..H_EPOCH + 8].copy_from_slice(&epoch.to_le_bytes());
    h[H_ENTRY_COUNT..H_ENTRY_COUNT + 8].copy_from_slice(&entry_count.to_le_bytes());
    h[H_ROW_SIZE..H_ROW_SIZE + 4].copy_from_slice(&(PERSISTENT_ENTRY_SIZE as u32).to_le_bytes());
    h[H_BLOCK_BYTES..H_BLOCK_BYTES + 4].copy_from_slice(&0u32.to_le_bytes());
    let crc = crc_with_zeroed(&h, H_CRC, 4);
    h[H_CRC..].copy_from_slice(&crc.to_le_bytes());
    h
}

fn build_footer(total_bytes: u64, entries_crc: u32) -> [u8; FOOTER_SIZE] {
    let mut f = [0u8; FOOTER_SIZE];
    f[0..8].copy_from_slice(&total_bytes.to_le_bytes());
    f[8..12].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc_with_zeroed(&f, 12, 4);
    f[12..16].copy_from_slice(&crc.to_le_bytes());
    f
}

/// Crash-consistent checkpoint writer.
pub struct CheckpointWriter {
    dir: PathBuf,
}

impl CheckpointWriter {
    /// Writer rooted at the data directory (checkpoints live at its top
    /// level).
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(CheckpointWriter {
            dir: dir.to_path_buf(),
        })
    }

    /// Write a checkpoint of `rows` at `epoch`.
    ///
    /// Streams rows to `<final>.tmp` computing the entries CRC, rewrites
    /// the header with its CRC, appends the footer, fsyncs, atomically
    /// renames, and fsyncs the directory.
    pub fn write(&self, epoch: u64, rows: &[PersistentEntry]) -> Result<WrittenCheckpoint> {
        let final_path = self.dir.join(checkpoint_file_name(epoch));
        let tmp_path = self.dir.join(format!("{}.tmp", checkpoint_file_name(epoch)));

        let header = build_header(epoch, rows.len() as u64);
        let total_bytes =
            (HEADER_SIZE + rows.len() * PERSISTENT_ENTRY_SIZE + FOOTER_SIZE) as u64;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&header)?;

        let mut hasher = crc32fast::Hasher::new();
        for row in rows {
            let bytes = row.to_bytes();
            hasher.update(&bytes);
            out.write_all(&bytes)?;
        }
        let entries_crc = hasher.finalize();
        out.write_all(&build_footer(total_bytes, entries_crc))?;
        out.flush()?;

        let file = out.into_inner().map_err(|e| Error::StorageIo(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &final_path)?;
        let dir_handle = File::open(&self.dir)?;
        dir_handle.sync_all()?;

        debug!(epoch, entries = rows.len(), path = %final_path.display(), "checkpoint written");
        Ok(WrittenCheckpoint {
            path: final_path,
            epoch,
            size: total_bytes,
            entries: rows.len() as u64,
            crc: entries_crc,
        })
    }

    /// Delete checkpoints beyond the `keep_count` newest (by epoch), then
    /// fsync the directory. Best effort: I/O failures are logged, not
    /// propagated.
    pub fn cleanup_old_checkpoints(&self, keep_count: usize) -> usize {
        let mut found = list_checkpoints(&self.dir);
        if found.len() <= keep_count {
            return 0;
        }
        let mut deleted = 0;
        for (path, epoch) in found.drain(keep_count..) {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(epoch, path = %path.display(), "pruned old checkpoint");
                    deleted += 1;
                }
                Err(e) => warn!(epoch, error = %e, "failed to prune old checkpoint"),
            }
        }
        if deleted > 0 {
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
        }
        deleted
    }
}

/// Checkpoint files under `dir`, newest epoch first.
pub fn list_checkpoints(dir: &Path) -> Vec<(PathBuf, u64)> {
    let mut found: Vec<(PathBuf, u64)> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| parse_checkpoint_epoch(&p).map(|epoch| (p, epoch)))
            .collect(),
        Err(_) => Vec::new(),
    };
    found.sort_by(|a, b| b.1.cmp(&a.1));
    found
}

/// Latest checkpoint under `dir` (highest epoch), if any.
pub fn find_latest_checkpoint(dir: &Path) -> Option<(PathBuf, u64)> {
    list_checkpoints(dir).into_iter().next()
}

/// Memory-mapped, fully validated checkpoint reader.
///
/// The mapping is released on drop.
pub struct CheckpointReader {
    map: Mmap,
    epoch: u64,
    entry_count: u64,
}

impl std::fmt::Debug for CheckpointReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointReader")
            .field("epoch", &self.epoch)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

impl CheckpointReader {
    /// Map and validate a checkpoint file. Any mismatch — magic, version,
    /// row size, header CRC, exact file size, entries CRC, footer CRC —
    /// refuses the file with `CorruptCheckpoint`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::CorruptCheckpoint(format!(
                "file too small: {len} bytes"
            )));
        }
        let map = unsafe { Mmap::map(&file)? };

        let header = &map[..HEADER_SIZE];
        if header[H_MAGIC..H_MAGIC + 8] != CHECKPOINT_MAGIC {
            return Err(Error::CorruptCheckpoint("bad magic".into()));
        }
        let version = u32::from_le_bytes(header[H_VERSION..H_VERSION + 4].try_into().unwrap());
        if version != CHECKPOINT_VERSION {
            return Err(Error::CorruptCheckpoint(format!(
                "unsupported version {version}"
            )));
        }
        let row_size = u32::from_le_bytes(header[H_ROW_SIZE..H_ROW_SIZE + 4].try_into().unwrap());
        if row_size as usize != PERSISTENT_ENTRY_SIZE {
            return Err(Error::CorruptCheckpoint(format!(
                "unexpected row size {row_size}"
            )));
        }
        let stored_header_crc = u32::from_le_bytes(header[H_CRC..].try_into().unwrap());
        let computed_header_crc = crc_with_zeroed(header, H_CRC, 4);
        if stored_header_crc != computed_header_crc {
            return Err(Error::CorruptCheckpoint(format!(
                "header crc mismatch: stored {stored_header_crc:08x}, computed {computed_header_crc:08x}"
            )));
        }

        let epoch = u64::from_le_bytes(header[H_EPOCH..H_EPOCH + 8].try_into().unwrap());
        let entry_count =
            u64::from_le_bytes(header[H_ENTRY_COUNT..H_ENTRY_COUNT + 8].try_into().unwrap());
        let expected =
            HEADER_SIZE + entry_count as usize * PERSISTENT_ENTRY_SIZE + FOOTER_SIZE;
        if len != expected {
            return Err(Error::CorruptCheckpoint(format!(
                "size mismatch: {len} bytes, expected {expected}"
            )));
        }

        let entries_end = HEADER_SIZE + entry_count as usize * PERSISTENT_ENTRY_SIZE;
        let footer = &map[entries_end..];
        let stored_footer_crc = u32::from_le_bytes(footer[12..16].try_into().unwrap());
        let computed_footer_crc = crc_with_zeroed(footer, 12, 4);
        if stored_footer_crc != computed_footer_crc {
            return Err(Error::CorruptCheckpoint("footer crc mismatch".into()));
        }
        let stored_entries_crc = u32::from_le_bytes(footer[8..12].try_into().unwrap());
        let computed_entries_crc = crc32fast::hash(&map[HEADER_SIZE..entries_end]);
        if stored_entries_crc != computed_entries_crc {
            return Err(Error::CorruptCheckpoint("entries crc mismatch".into()));
        }

        Ok(CheckpointReader {
            map,
            epoch,
            entry_count,
        })
    }

    /// Commit epoch of the snapshot.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of rows.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Decode row `i`.
    pub fn entry(&self, i: u64) -> Option<PersistentEntry> {
        if i >= self.entry_count {
            return None;
        }
        let at = HEADER_SIZE + i as usize * PERSISTENT_ENTRY_SIZE;
        PersistentEntry::from_bytes(&self.map[at..at + PERSISTENT_ENTRY_SIZE])
    }

    /// Iterate all rows in handle order as written.
    pub fn entries(&self) -> impl Iterator<Item = PersistentEntry> + '_ {
        (0..self.entry_count).filter_map(move |i| self.entry(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use xylem_core::RETIRE_EPOCH_LIVE;

    fn row(handle: u64) -> PersistentEntry {
        PersistentEntry {
            handle_idx: handle,
            file_id: 1,
            segment_id: 0,
            offset: handle * 4096,
            length: 4096,
            class_id: 0,
            kind: 2,
            tag: 1,
            birth_epoch: handle,
            retire_epoch: RETIRE_EPOCH_LIVE,
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let rows: Vec<_> = (1..=10).map(row).collect();
        let written = writer.write(42, &rows).unwrap();
        assert_eq!(written.epoch, 42);
        assert_eq!(written.entries, 10);
        assert_eq!(
            written.size,
            (HEADER_SIZE + 10 * PERSISTENT_ENTRY_SIZE + FOOTER_SIZE) as u64
        );

        let reader = CheckpointReader::open(&written.path).unwrap();
        assert_eq!(reader.epoch(), 42);
        assert_eq!(reader.entry_count(), 10);
        assert_eq!(reader.entries().collect::<Vec<_>>(), rows);
    }

    #[test]
    fn test_empty_checkpoint_is_legal() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let written = writer.write(0, &[]).unwrap();
        let reader = CheckpointReader::open(&written.path).unwrap();
        assert_eq!(reader.epoch(), 0);
        assert_eq!(reader.entry_count(), 0);
        assert_eq!(reader.entries().count(), 0);
    }

    #[test]
    fn test_no_temp_left_behind() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        writer.write(1, &[row(1)]).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_header_refused() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let written = writer.write(5, &[row(1)]).unwrap();

        let mut bytes = std::fs::read(&written.path).unwrap();
        bytes[H_EPOCH] ^= 0xFF;
        std::fs::write(&written.path, &bytes).unwrap();

        let err = CheckpointReader::open(&written.path).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_corrupt_entries_refused() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let written = writer.write(5, &[row(1), row(2)]).unwrap();

        let mut bytes = std::fs::read(&written.path).unwrap();
        bytes[HEADER_SIZE + 3] ^= 0xFF;
        std::fs::write(&written.path, &bytes).unwrap();

        let err = CheckpointReader::open(&written.path).unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint(ref s) if s.contains("entries crc")));
    }

    #[test]
    fn test_corrupt_footer_refused() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let written = writer.write(5, &[row(1)]).unwrap();

        let mut bytes = std::fs::read(&written.path).unwrap();
        let footer_at = bytes.len() - FOOTER_SIZE;
        bytes[footer_at] ^= 0xFF;
        std::fs::write(&written.path, &bytes).unwrap();

        assert!(CheckpointReader::open(&written.path).is_err());
    }

    #[test]
    fn test_truncated_file_refused() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        let written = writer.write(5, &[row(1), row(2)]).unwrap();

        let bytes = std::fs::read(&written.path).unwrap();
        std::fs::write(&written.path, &bytes[..bytes.len() - PERSISTENT_ENTRY_SIZE]).unwrap();

        assert!(CheckpointReader::open(&written.path).is_err());
    }

    #[test]
    fn test_find_latest_and_cleanup() {
        let dir = tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path()).unwrap();
        for epoch in [3u64, 10, 7] {
            writer.write(epoch, &[row(1)]).unwrap();
        }
        let (path, epoch) = find_latest_checkpoint(dir.path()).unwrap();
        assert_eq!(epoch, 10);
        assert!(path.ends_with("ot_checkpoint_epoch-10.bin"));

        let deleted = writer.cleanup_old_checkpoints(2);
        assert_eq!(deleted, 1);
        let remaining = list_checkpoints(dir.path());
        assert_eq!(
            remaining.iter().map(|(_, e)| *e).collect::<Vec<_>>(),
            vec![10, 7]
        );
    }

    #[test]
    fn test_file_name_parse() {
        assert_eq!(checkpoint_file_name(7), "ot_checkpoint_epoch-7.bin");
        assert_eq!(
            parse_checkpoint_epoch(Path::new("/x/ot_checkpoint_epoch-123.bin")),
            Some(123)
        );
        assert_eq!(
            parse_checkpoint_epoch(Path::new("ot_checkpoint_epoch-9.bin.tmp")),
            None
        );
    }
}
