//! Platform file-system abstraction.
//!
//! All durable-write call sites go through this narrow capability so tests
//! and ports can substitute the I/O layer. Every method is synchronous and
//! reports failures through the tagged `Result`, never by panicking.
//!
//! Mappings returned by `map_file` unmap on drop; there is no explicit
//! `unmap` call.

use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use xylem_core::Result;

/// Narrow file-system capability consumed by the persistence core.
pub trait PlatformFs: Send + Sync {
    /// Create `path` (and parents) if missing.
    fn ensure_directory(&self, path: &Path) -> Result<()>;

    /// Size of the file at `path` in bytes.
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Map the whole file read-only. The mapping is released on drop.
    fn map_file(&self, path: &Path) -> Result<Mmap>;

    /// Flush file contents and metadata to stable storage.
    fn flush_file(&self, file: &File) -> Result<()>;

    /// Atomically replace `to` with `from` (rename within one directory).
    fn atomic_replace(&self, from: &Path, to: &Path) -> Result<()>;

    /// Fsync a directory so renames/creates/deletes inside it are durable.
    fn fsync_directory(&self, dir: &Path) -> Result<()>;
}

/// `std::fs` + `memmap2` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl PlatformFs for StdFs {
    fn ensure_directory(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn map_file(&self, path: &Path) -> Result<Mmap> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the core never truncates a
        // file while a read mapping of it is live.
        let map = unsafe { Mmap::map(&file)? };
        Ok(map)
    }

    fn flush_file(&self, file: &File) -> Result<()> {
        file.sync_all()?;
        Ok(())
    }

    fn atomic_replace(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn fsync_directory(&self, dir: &Path) -> Result<()> {
        let handle = File::open(dir)?;
        handle.sync_all()?;
        Ok(())
    }
}

/// Write `bytes` durably at `path` via the staged temp → fsync → rename →
/// directory-fsync sequence. The temp file lives next to the target.
pub fn write_atomic(fs: &dyn PlatformFs, path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        fs.flush_file(&file)?;
    }
    fs.atomic_replace(&tmp, path)?;
    if let Some(parent) = path.parent() {
        fs.fsync_directory(parent)?;
    }
    Ok(())
}
