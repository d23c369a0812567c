//! SSTable construction.
//!
//! A table is built exactly once, from an already-sorted entry sequence
//! (a memtable snapshot or a compaction merge), and written atomically:
//! the bytes go to a temporary name in the target directory, are fsynced,
//! and only then renamed to the final `<16-hex-id>_<level>.db` name.  A
//! crash mid-build leaves at most a stale temp file that the engine
//! sweeps on open.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::{debug, trace};

use crate::encoding;

use super::bloom::BloomFilter;
use super::{
    file_name, SSTable, SSTableError, FORMAT_VERSION, HEADER_SIZE, INDEX_GRANULARITY,
    MAGIC_FOOTER, MAGIC_HEADER,
};

/// Builds an SSTable from sorted `(key, value-or-tombstone)` entries and
/// returns an open reader for it.
///
/// `entries` must be strictly ascending by key and non-empty; both hold
/// for memtable snapshots and merge outputs by construction.
pub fn build_sstable(
    entries: &[(Vec<u8>, Option<Vec<u8>>)],
    dir: &Path,
    file_id: u64,
    level: u32,
) -> Result<SSTable, SSTableError> {
    if entries.is_empty() {
        return Err(SSTableError::EmptyInput);
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC_HEADER);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    debug_assert_eq!(buf.len(), HEADER_SIZE);

    // Data block, collecting an index entry at the head of every
    // INDEX_GRANULARITY bytes of data (and always for the first key).
    let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
    let mut bloom = BloomFilter::for_entries(entries.len());
    let mut tombstone_count = 0u64;
    let mut next_index_at = 0usize;

    for (key, value) in entries {
        let written = buf.len() - HEADER_SIZE;
        if written >= next_index_at {
            index.push((key.clone(), buf.len() as u64));
            next_index_at = written + INDEX_GRANULARITY;
        }

        encoding::put_uvarint(key.len() as u64, &mut buf);
        match value {
            Some(v) => {
                encoding::put_uvarint(v.len() as u64, &mut buf);
                buf.extend_from_slice(key);
                buf.extend_from_slice(v);
            }
            None => {
                encoding::put_uvarint(0, &mut buf);
                buf.extend_from_slice(key);
                tombstone_count += 1;
            }
        }
        bloom.insert(key);
    }

    let index_offset = buf.len() as u64;
    encoding::put_uvarint(index.len() as u64, &mut buf);
    for (key, offset) in &index {
        encoding::put_uvarint(key.len() as u64, &mut buf);
        buf.extend_from_slice(key);
        encoding::put_uvarint(*offset, &mut buf);
    }

    let bloom_offset = buf.len() as u64;
    bloom.encode_to(&mut buf);

    // Footer.  The first and last entries bound the key range because the
    // input is sorted.
    let min_key = &entries[0].0;
    let max_key = &entries[entries.len() - 1].0;
    buf.extend_from_slice(&(HEADER_SIZE as u64).to_le_bytes());
    buf.extend_from_slice(&index_offset.to_le_bytes());
    buf.extend_from_slice(&bloom_offset.to_le_bytes());
    encoding::put_uvarint(min_key.len() as u64, &mut buf);
    buf.extend_from_slice(min_key);
    encoding::put_uvarint(max_key.len() as u64, &mut buf);
    buf.extend_from_slice(max_key);
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    buf.extend_from_slice(&tombstone_count.to_le_bytes());

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&MAGIC_FOOTER);

    // Atomic write: temp name, fsync, rename into place.
    let final_name = file_name(file_id, level);
    let tmp_path = dir.join(format!("{final_name}.tmp"));
    let final_path = dir.join(&final_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, &final_path)?;
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    trace!(
        file_id,
        level,
        entries = entries.len(),
        bytes = buf.len(),
        "wrote SSTable"
    );
    debug!(path = %final_path.display(), "SSTable created");

    SSTable::open(&final_path)
}

/// Removes stale `*.tmp` leftovers from an interrupted build.
pub fn sweep_temp_files(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".tmp"))
        {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}
