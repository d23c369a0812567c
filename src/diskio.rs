//! Disk write primitives shared by every persisted artifact.
//!
//! All blob and meta files are replaced atomically: bytes go to a
//! sibling temp name, are fsynced, and then renamed over the final path.
//! A crash mid-write leaves either the old file or the new one, never a
//! torn mix.
//!
//! The [`CheckpointIo`] trait is the persistence scheduler's seam: the
//! scheduler routes every checkpoint write through it, so tests can
//! inject failures per path without touching a real filesystem fault
//! layer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Atomically replaces `path` with `bytes` (temp + fsync + rename).
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// The write side of a checkpoint, injectable for tests.
pub trait CheckpointIo: Send + Sync {
    /// Atomically replace `path` with `bytes`.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// Production implementation backed by the real filesystem.
#[derive(Debug, Default)]
pub struct DiskIo;

impl CheckpointIo for DiskIo {
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(path, bytes)
    }
}
