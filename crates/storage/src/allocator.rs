//! Size-class segment allocator.
//!
//! Owns a set of fixed-size data files under `segments/`, each subdivided
//! into fixed-size segments. A segment is dedicated to exactly one size
//! class for its lifetime; freed ranges go onto a per-class free list and
//! are handed out again before any new segment is carved. File growth is
//! append-only — file deletion belongs to log GC, never to segment GC.
//!
//! A range is exclusively owned by the object-table entry referencing it
//! from `allocate` until the reclaimer calls `free`.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use xylem_core::{Error, Result, StorageAddr, NUM_SIZE_CLASSES};

/// Allocator tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// Fixed size of each data file.
    pub file_size: u64,
    /// Size of one segment within a file.
    pub segment_size: u64,
    /// Largest left-shift applied to the 4 KiB base when sizing a class.
    pub max_class_shift: u8,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            file_size: 256 * 1024 * 1024,
            segment_size: 4 * 1024 * 1024,
            max_class_shift: 10,
        }
    }
}

impl AllocatorConfig {
    /// Small files for unit tests.
    pub fn for_testing() -> Self {
        AllocatorConfig {
            file_size: 1024 * 1024,
            segment_size: 64 * 1024,
            max_class_shift: 4,
        }
    }

    /// Byte size of a class: 4 KiB base, doubling per class, clamped to
    /// one segment.
    pub fn class_size(&self, class_id: u8) -> u32 {
        let shift = class_id.min(self.max_class_shift) as u32;
        let size = 4096u64 << shift;
        size.min(self.segment_size) as u32
    }

    fn segments_per_file(&self) -> u32 {
        (self.file_size / self.segment_size) as u32
    }
}

/// One allocated byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Owning data file (1-based).
    pub file_id: u32,
    /// Segment index within the file.
    pub segment_id: u32,
    /// Byte offset from the start of the file.
    pub offset: u64,
    /// Length in bytes.
    pub length: u32,
    /// Size class the range belongs to.
    pub class_id: u8,
}

impl Allocation {
    /// The storage address form of this range.
    pub fn addr(&self) -> StorageAddr {
        StorageAddr {
            file_id: self.file_id,
            segment_id: self.segment_id,
            offset: self.offset,
            length: self.length,
        }
    }

    /// Rebuild an allocation from an address plus its class.
    pub fn from_addr(addr: StorageAddr, class_id: u8) -> Self {
        Allocation {
            file_id: addr.file_id,
            segment_id: addr.segment_id,
            offset: addr.offset,
            length: addr.length,
            class_id,
        }
    }
}

struct SegmentFile {
    id: u32,
    file: File,
    segments_used: u32,
}

#[derive(Default, Clone, Copy)]
struct ActiveSegment {
    file_id: u32,
    segment_id: u32,
    base_offset: u64,
    used: u64,
}

struct AllocInner {
    files: Vec<SegmentFile>,
    active: Vec<Option<ActiveSegment>>,
    free_lists: Vec<Vec<Allocation>>,
}

/// Segment allocator over fixed-size files.
pub struct SegmentAllocator {
    dir: PathBuf,
    config: AllocatorConfig,
    inner: Mutex<AllocInner>,
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
}

impl SegmentAllocator {
    /// Open (or create) the allocator over `<data_dir>/segments`.
    pub fn open(data_dir: &Path, config: AllocatorConfig) -> Result<Self> {
        let dir = data_dir.join("segments");
        std::fs::create_dir_all(&dir)?;
        let mut files = Vec::new();
        // Adopt existing files in id order; segment occupancy is restored
        // separately from the recovered table.
        let mut ids: Vec<u32> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| parse_file_id(&e.file_name().to_string_lossy()))
            .collect();
        ids.sort_unstable();
        for id in ids {
            let path = Self::file_path(&dir, id);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            files.push(SegmentFile {
                id,
                file,
                segments_used: 0,
            });
        }
        Ok(SegmentAllocator {
            dir,
            config,
            inner: Mutex::new(AllocInner {
                files,
                active: vec![None; NUM_SIZE_CLASSES],
                free_lists: vec![Vec::new(); NUM_SIZE_CLASSES],
            }),
            bytes_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
        })
    }

    /// Data file path: `segments/seg_<NNNNNN>.dat`.
    pub fn file_path(dir: &Path, file_id: u32) -> PathBuf {
        dir.join(format!("seg_{:06}.dat", file_id))
    }

    /// Allocate one range of `class_id`'s size.
    pub fn allocate(&self, class_id: u8) -> Result<Allocation> {
        if class_id as usize >= NUM_SIZE_CLASSES {
            return Err(Error::InvalidState(format!(
                "size class {class_id} out of range"
            )));
        }
        let length = self.config.class_size(class_id);
        let mut inner = self.inner.lock();

        if let Some(alloc) = inner.free_lists[class_id as usize].pop() {
            self.bytes_allocated
                .fetch_add(alloc.length as u64, Ordering::Relaxed);
            return Ok(alloc);
        }

        // Bump the class's active segment, carving a new one when full.
        let needs_new = match inner.active[class_id as usize] {
            Some(seg) => seg.used + length as u64 > self.config.segment_size,
            None => true,
        };
        if needs_new {
            let seg = self.carve_segment(&mut inner)?;
            inner.active[class_id as usize] = Some(seg);
        }
        let seg = inner.active[class_id as usize]
            .as_mut()
            .expect("active segment just installed");
        let alloc = Allocation {
            file_id: seg.file_id,
            segment_id: seg.segment_id,
            offset: seg.base_offset + seg.used,
            length,
            class_id,
        };
        seg.used += length as u64;
        self.bytes_allocated
            .fetch_add(length as u64, Ordering::Relaxed);
        Ok(alloc)
    }

    /// Return a range to its class free list.
    pub fn free(&self, alloc: Allocation) {
        if alloc.class_id as usize >= NUM_SIZE_CLASSES || alloc.length == 0 {
            return;
        }
        self.bytes_freed
            .fetch_add(alloc.length as u64, Ordering::Relaxed);
        self.inner.lock().free_lists[alloc.class_id as usize].push(alloc);
    }

    /// Conservative post-recovery restore: mark every segment referenced by
    /// a restored table row as used so new carving starts past it. Freed
    /// holes inside those segments are not rediscovered; they become
    /// reusable again as their entries retire.
    pub fn restore_from_rows<'a, I>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a xylem_core::PersistentEntry>,
    {
        let mut inner = self.inner.lock();
        let mut max_seg: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
        for row in rows {
            if row.file_id == 0 || row.length == 0 {
                continue;
            }
            let e = max_seg.entry(row.file_id).or_insert(0);
            *e = (*e).max(row.segment_id + 1);
        }
        for file in inner.files.iter_mut() {
            if let Some(&used) = max_seg.get(&file.id) {
                file.segments_used = file.segments_used.max(used);
            }
        }
        // Any referenced file that is missing on disk is recreated empty so
        // ids stay dense and stable.
        let mut missing: Vec<u32> = max_seg
            .keys()
            .copied()
            .filter(|id| !inner.files.iter().any(|f| f.id == *id))
            .collect();
        missing.sort_unstable();
        for id in missing {
            let path = Self::file_path(&self.dir, id);
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            file.set_len(self.config.file_size)?;
            let segments_used = max_seg[&id];
            inner.files.push(SegmentFile {
                id,
                file,
                segments_used,
            });
        }
        inner.files.sort_by_key(|f| f.id);
        Ok(())
    }

    /// Total bytes handed out (cumulative).
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Total bytes returned (cumulative).
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Sync and drop all file handles. Called once at shutdown.
    pub fn close_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for f in inner.files.iter() {
            f.file.sync_all()?;
        }
        inner.files.clear();
        inner.active.iter_mut().for_each(|a| *a = None);
        Ok(())
    }

    fn carve_segment(&self, inner: &mut AllocInner) -> Result<ActiveSegment> {
        let per_file = self.config.segments_per_file();
        // Reuse the newest file with headroom, else grow by one file.
        if let Some(file) = inner
            .files
            .iter_mut()
            .rev()
            .find(|f| f.segments_used < per_file)
        {
            let segment_id = file.segments_used;
            file.segments_used += 1;
            return Ok(ActiveSegment {
                file_id: file.id,
                segment_id,
                base_offset: segment_id as u64 * self.config.segment_size,
                used: 0,
            });
        }
        let id = inner.files.last().map(|f| f.id + 1).unwrap_or(1);
        let path = Self::file_path(&self.dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(self.config.file_size)?;
        debug!(file_id = id, path = %path.display(), "created segment file");
        inner.files.push(SegmentFile {
            id,
            file,
            segments_used: 1,
        });
        Ok(ActiveSegment {
            file_id: id,
            segment_id: 0,
            base_offset: 0,
            used: 0,
        })
    }
}

fn parse_file_id(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("seg_")?.strip_suffix(".dat")?;
    rest.parse().ok()
}
