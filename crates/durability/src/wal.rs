//! Delta log: the append-only WAL of object-table mutations.
//!
//! # Record layout
//!
//! Fixed 56-byte frames, little-endian:
//!
//! ```text
//! ┌──────────────────────────────┬───────────────┬───────────────┐
//! │ PersistentEntry (48 bytes)   │ CRC32 (4)     │ seal (4)      │
//! └──────────────────────────────┴───────────────┴───────────────┘
//! ```
//!
//! The CRC covers the 48-byte row; the seal constant terminates the frame.
//! Files are preallocated in chunks and the unused tail is zero, so a
//! replayer distinguishes the clean end (zero frame head) from a torn or
//! corrupt record (nonzero bytes failing CRC/seal).
//!
//! # Lifecycle
//!
//! `open_for_append` adopts an existing file by scanning its valid prefix,
//! then maps it with chunked preallocation. `append` never syncs;
//! `sync` is the durability fence. `prepare_close` fails further appends
//! with a transient error; `close` truncates the preallocated tail and
//! releases the mapping. A log file is closed exactly once, by the
//! coordinator.

use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;
use xylem_core::{Error, PersistentEntry, Result, PERSISTENT_ENTRY_SIZE};

/// Bytes of one framed record.
pub const RECORD_SIZE: usize = PERSISTENT_ENTRY_SIZE + 8;

/// Frame terminator constant.
pub const RECORD_SEAL: u32 = 0x5EA1_D0C5;

/// Default preallocation chunk (64 MiB).
pub const DEFAULT_PREALLOC_CHUNK: u64 = 64 * 1024 * 1024;

/// Encode one row as a framed record.
pub fn encode_record(row: &PersistentEntry) -> [u8; RECORD_SIZE] {
    let mut frame = [0u8; RECORD_SIZE];
    let body = row.to_bytes();
    frame[..PERSISTENT_ENTRY_SIZE].copy_from_slice(&body);
    let crc = crc32fast::hash(&body);
    frame[PERSISTENT_ENTRY_SIZE..PERSISTENT_ENTRY_SIZE + 4].copy_from_slice(&crc.to_le_bytes());
    frame[PERSISTENT_ENTRY_SIZE + 4..].copy_from_slice(&RECORD_SEAL.to_le_bytes());
    frame
}

enum Frame {
    Record(PersistentEntry),
    CleanEnd,
    Corrupt(String),
}

fn decode_frame(buf: &[u8]) -> Frame {
    if buf.len() < RECORD_SIZE {
        return Frame::CleanEnd;
    }
    let frame = &buf[..RECORD_SIZE];
    if frame.iter().all(|&b| b == 0) {
        return Frame::CleanEnd;
    }
    let seal = u32::from_le_bytes(frame[PERSISTENT_ENTRY_SIZE + 4..].try_into().unwrap());
    if seal != RECORD_SEAL {
        return Frame::Corrupt(format!("seal mismatch: {seal:08x}"));
    }
    let stored_crc =
        u32::from_le_bytes(frame[PERSISTENT_ENTRY_SIZE..PERSISTENT_ENTRY_SIZE + 4].try_into().unwrap());
    let body = &frame[..PERSISTENT_ENTRY_SIZE];
    let computed = crc32fast::hash(body);
    if computed != stored_crc {
        return Frame::Corrupt(format!(
            "crc mismatch: stored {stored_crc:08x}, computed {computed:08x}"
        ));
    }
    match PersistentEntry::from_bytes(body) {
        Some(row) => Frame::Record(row),
        None => Frame::Corrupt("row too short".into()),
    }
}

/// Delta log file name for a sequence number.
pub fn log_file_name(sequence: u64) -> String {
    format!("delta_{sequence:012}.wal")
}

/// Parse the sequence number out of a `delta_<seq>.wal` path.
pub fn parse_sequence(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("delta_")?
        .strip_suffix(".wal")?
        .parse()
        .ok()
}

struct LogInner {
    file: File,
    map: Option<MmapMut>,
    mapped_len: u64,
    cursor: u64,
}

/// Append-only delta log with chunked preallocation and mapped writes.
pub struct DeltaLog {
    path: PathBuf,
    sequence: u64,
    chunk: u64,
    inner: Mutex<LogInner>,
    end_offset: AtomicU64,
    end_epoch: AtomicU64,
    closed: AtomicBool,
    created_at: Instant,
}

impl DeltaLog {
    /// Open (or create) a log for appending.
    ///
    /// An existing file is adopted by scanning its valid record prefix;
    /// the cursor lands after the last valid record and the end epoch is
    /// the max epoch seen. The file is then grown to keep at least one
    /// chunk of headroom and mapped for writes.
    pub fn open_for_append(path: &Path, sequence: u64, chunk: u64) -> Result<Self> {
        let chunk = chunk.max(RECORD_SIZE as u64);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let existing_len = file.metadata()?.len();

        // Adopt the valid prefix of an existing file.
        let mut cursor = 0u64;
        let mut max_epoch = 0u64;
        if existing_len >= RECORD_SIZE as u64 {
            let ro = unsafe { memmap2::Mmap::map(&file)? };
            let mut offset = 0usize;
            while offset + RECORD_SIZE <= existing_len as usize {
                match decode_frame(&ro[offset..]) {
                    Frame::Record(row) => {
                        max_epoch = max_epoch.max(row.record_epoch());
                        offset += RECORD_SIZE;
                    }
                    Frame::CleanEnd => break,
                    Frame::Corrupt(reason) => {
                        warn!(
                            path = %path.display(),
                            offset, reason, "adopting delta log before damaged tail"
                        );
                        break;
                    }
                }
            }
            cursor = offset as u64;
        }

        if existing_len < cursor + chunk {
            file.set_len(cursor + chunk)?;
        }
        let mapped_len = file.metadata()?.len();
        let map = unsafe { MmapMut::map_mut(&file)? };

        let log = DeltaLog {
            path: path.to_path_buf(),
            sequence,
            chunk,
            inner: Mutex::new(LogInner {
                file,
                map: Some(map),
                mapped_len,
                cursor,
            }),
            end_offset: AtomicU64::new(cursor),
            end_epoch: AtomicU64::new(max_epoch),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        };
        Ok(log)
    }

    /// Append framed records. Cheap: mapped memcpy under the internal
    /// mutex, no durable sync. Fails `Transient` once the log is being
    /// closed (a rotation raced the writer; retry on the new active log).
    pub fn append(&self, rows: &[PersistentEntry]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transient("delta log closed for append".into()));
        }
        let need = (rows.len() * RECORD_SIZE) as u64;
        if inner.cursor + need > inner.mapped_len {
            let new_len = inner.cursor + need.max(self.chunk);
            inner.map = None; // unmap before growing
            inner.file.set_len(new_len)?;
            inner.map = Some(unsafe { MmapMut::map_mut(&inner.file)? });
            inner.mapped_len = new_len;
        }
        let cursor = inner.cursor as usize;
        let map = inner.map.as_mut().expect("log is mapped while open");
        let mut max_epoch = 0u64;
        for (i, row) in rows.iter().enumerate() {
            let at = cursor + i * RECORD_SIZE;
            map[at..at + RECORD_SIZE].copy_from_slice(&encode_record(row));
            max_epoch = max_epoch.max(row.record_epoch());
        }
        inner.cursor += need;
        self.end_offset.store(inner.cursor, Ordering::Release);
        self.end_epoch.fetch_max(max_epoch, Ordering::AcqRel);
        Ok(need)
    }

    /// Durability fence: flush the mapping and sync the file.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(map) = &inner.map {
            map.flush()?;
        }
        inner.file.sync_all()?;
        Ok(())
    }

    /// Make further appends fail. Readers may still read.
    pub fn prepare_close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Final close: flush, truncate the preallocated tail, sync. The
    /// mapping is released; the log must not be appended to again.
    pub fn close(&self) -> Result<()> {
        self.prepare_close();
        let mut inner = self.inner.lock();
        if let Some(map) = inner.map.take() {
            map.flush()?;
        }
        inner.file.set_len(inner.cursor)?;
        inner.file.sync_all()?;
        inner.mapped_len = inner.cursor;
        Ok(())
    }

    /// Max epoch seen in any appended record.
    pub fn end_epoch_relaxed(&self) -> u64 {
        self.end_epoch.load(Ordering::Relaxed)
    }

    /// Bytes of valid records written so far.
    pub fn end_offset_relaxed(&self) -> u64 {
        self.end_offset.load(Ordering::Relaxed)
    }

    /// Monotonic rotation sequence of this log.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Age since this handle opened the log.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True once `prepare_close` or `close` ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Result of replaying one log file.
#[derive(Debug)]
pub struct LogReplay {
    /// Records in append order, up to the first invalid frame.
    pub records: Vec<PersistentEntry>,
    /// Bytes of valid records.
    pub valid_bytes: u64,
    /// Max record epoch seen.
    pub max_epoch: u64,
    /// Offset and reason of the frame that stopped replay, if any.
    pub corruption: Option<(u64, String)>,
}

/// Read a log file's records in append order, stopping at the first
/// invalid frame. A clean preallocated tail is not corruption.
pub fn read_log(path: &Path) -> Result<LogReplay> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut replay = LogReplay {
        records: Vec::new(),
        valid_bytes: 0,
        max_epoch: 0,
        corruption: None,
    };
    if len < RECORD_SIZE as u64 {
        return Ok(replay);
    }
    let map = unsafe { memmap2::Mmap::map(&file)? };
    let mut offset = 0usize;
    while offset + RECORD_SIZE <= len as usize {
        match decode_frame(&map[offset..]) {
            Frame::Record(row) => {
                replay.max_epoch = replay.max_epoch.max(row.record_epoch());
                replay.records.push(row);
                offset += RECORD_SIZE;
            }
            Frame::CleanEnd => break,
            Frame::Corrupt(reason) => {
                warn!(
                    path = %path.display(),
                    offset, reason, "delta log replay stopped at damaged record"
                );
                replay.corruption = Some((offset as u64, reason));
                break;
            }
        }
    }
    replay.valid_bytes = offset as u64;
    Ok(replay)
}
