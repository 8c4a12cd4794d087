//! The superblock: durable root pointer.
//!
//! A fixed 4 KiB file holding `(root NodeId, committed epoch)` twice —
//! primary and shadow copies, each CRC-protected — behind a magic and
//! version:
//!
//! ```text
//! 0     magic "XYSUPER1" (8)
//! 8     version (4) + pad (4)
//! 16    copy A: root_raw (8) | epoch (8) | crc32 (4)
//! 2048  copy B: root_raw (8) | epoch (8) | crc32 (4)
//! ```
//!
//! `publish` always takes the atomic-replace path: stage the new 4 KiB
//! image, fsync, rename over the live file, fsync the directory. `load`
//! returns the most recent consistent copy; a torn or missing file reads
//! as the empty snapshot.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use xylem_core::{NodeId, Result};
use xylem_storage::fs::{write_atomic, StdFs};

/// Superblock file size.
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Superblock magic.
pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"XYSUPER1";

/// Current superblock format version.
pub const SUPERBLOCK_VERSION: u32 = 1;

const COPY_A: usize = 16;
const COPY_B: usize = 2048;
const COPY_SIZE: usize = 20;

/// The published root pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootSnapshot {
    /// Root node id; invalid when nothing was ever published.
    pub root: NodeId,
    /// Epoch the root was committed at.
    pub epoch: u64,
}

fn encode_copy(buf: &mut [u8], root_raw: u64, epoch: u64) {
    buf[0..8].copy_from_slice(&root_raw.to_le_bytes());
    buf[8..16].copy_from_slice(&epoch.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..16]);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
}

fn decode_copy(buf: &[u8]) -> Option<RootSnapshot> {
    let stored = u32::from_le_bytes(buf[16..20].try_into().ok()?);
    if crc32fast::hash(&buf[0..16]) != stored {
        return None;
    }
    Some(RootSnapshot {
        root: NodeId::from_raw(u64::from_le_bytes(buf[0..8].try_into().ok()?)),
        epoch: u64::from_le_bytes(buf[8..16].try_into().ok()?),
    })
}

/// Durable root pointer with dual-copy torn-write protection.
pub struct Superblock {
    path: PathBuf,
    publish_lock: Mutex<()>,
}

impl Superblock {
    /// Bind to the superblock path. The file is created on first publish.
    pub fn new(path: &Path) -> Self {
        Superblock {
            path: path.to_path_buf(),
            publish_lock: Mutex::new(()),
        }
    }

    /// The superblock path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably publish `(root, epoch)`.
    ///
    /// Serialized internally; the caller (group-commit leader) already
    /// syncs the delta log before publishing, making the ordering
    /// WAL-durable ⟶ superblock-visible.
    pub fn publish(&self, root: NodeId, epoch: u64) -> Result<()> {
        let _guard = self.publish_lock.lock();
        let mut image = [0u8; SUPERBLOCK_SIZE];
        image[0..8].copy_from_slice(&SUPERBLOCK_MAGIC);
        image[8..12].copy_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        encode_copy(&mut image[COPY_A..COPY_A + COPY_SIZE], root.raw(), epoch);
        encode_copy(&mut image[COPY_B..COPY_B + COPY_SIZE], root.raw(), epoch);
        write_atomic(&StdFs, &self.path, &image)
    }

    /// Read the most recent consistent snapshot. Missing file, bad magic,
    /// or two bad copies read as the empty snapshot.
    pub fn load(&self) -> RootSnapshot {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(_) => return RootSnapshot::default(),
        };
        if bytes.len() < SUPERBLOCK_SIZE || bytes[0..8] != SUPERBLOCK_MAGIC {
            return RootSnapshot::default();
        }
        let a = decode_copy(&bytes[COPY_A..COPY_A + COPY_SIZE]);
        let b = decode_copy(&bytes[COPY_B..COPY_B + COPY_SIZE]);
        match (a, b) {
            (Some(a), Some(b)) => {
                if a.epoch >= b.epoch {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => RootSnapshot::default(),
        }
    }
}
