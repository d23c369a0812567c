//! Sorted String Table (SSTable) Module
//!
//! An SSTable is an **immutable**, sorted, on-disk key→value file with an
//! index block for block-skipping point lookups and a bloom filter for
//! cheap negative answers.  It is built exactly once from a memtable
//! snapshot (or a compaction merge) and never modified afterwards; the
//! only way an SSTable leaves the system is compaction unlinking it.
//!
//! # On-disk layout
//!
//! ```text
//! magic[4] = 'S','S','T','1'
//! version[4] = 1 (u32 LE)
//! data_block:
//!   repeated { key_len varint | value_len varint (0 = tombstone) | key | value }
//! index_block:
//!   count varint
//!   repeated { key_len varint | key | data_offset varint }
//! bloom_block:
//!   bit_count varint | hash_count varint | bits[ceil(bit_count/8)]
//! footer:
//!   data_offset u64 | index_offset u64 | bloom_offset u64
//!   min_key_len varint | min_key | max_key_len varint | max_key
//!   entry_count u64 | tombstone_count u64
//!   crc32 u32 over everything before it
//! magic[4] = 'S','S','T','E'
//! ```
//!
//! All fixed integers are little-endian; varints are LEB128.  Index
//! granularity is one entry per 16 KiB of data, clamped to at least one
//! per table.  A `value_len` of zero marks a tombstone, so zero-length
//! values are unrepresentable — upper layers never produce them.
//!
//! The footer is variable length and records no self-offset, so
//! [`SSTable::open`] recovers its start by scanning back from the fixed
//! 24-byte tail for the unique position that parses consistently (see
//! [`Footer::locate`]).  The whole-file CRC is verified first, which makes
//! a false match practically impossible.
//!
//! # Concurrency model
//!
//! SSTables are immutable, so reads are lock-free and thread-safe; the
//! file is memory-mapped and shared behind an `Arc` by the engine.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`build_sstable`] writes a table atomically
//!   (temp name + rename + fsync).
//! - [`bloom`] — the bloom filter and its on-disk shape.

pub mod bloom;
pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::build_sstable;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::encoding::{self, EncodingError};
use crate::memtable::Lookup;
use bloom::BloomFilter;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const MAGIC_HEADER: [u8; 4] = *b"SST1";
pub(crate) const MAGIC_FOOTER: [u8; 4] = *b"SSTE";
pub(crate) const FORMAT_VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 8;

/// Fixed bytes at the very end of the file:
/// entry_count u64 | tombstone_count u64 | crc32 u32 | magic[4].
pub(crate) const TAIL_SIZE: usize = 24;

/// One index entry per this many bytes of data.
pub(crate) const INDEX_GRANULARITY: usize = 16 * 1024;

/// SSTable filename extension.
pub const FILE_EXTENSION: &str = "db";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Magic, checksum, or structural mismatch: the file is not a valid
    /// SSTable or has been damaged.
    #[error("corrupted SSTable: {0}")]
    Corrupted(String),

    /// Encoding / decoding error while reading a block.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The builder was handed nothing to write.
    #[error("refusing to build an empty SSTable")]
    EmptyInput,
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Renders the on-disk filename for `(file_id, level)`.
///
/// The 16-hex-digit prefix is the file id; the level rides in the suffix
/// because the file format itself has no level field.
pub fn file_name(file_id: u64, level: u32) -> String {
    format!("{file_id:016x}_{level}.{FILE_EXTENSION}")
}

/// Parses `(file_id, level)` back out of a filename.
///
/// Accepts both `<16-hex>_<level>.db` and a bare `<16-hex>.db`, which
/// loads at level 0.  Returns `None` for files that are not SSTables.
pub fn parse_file_name(name: &str) -> Option<(u64, u32)> {
    let stem = name.strip_suffix(&format!(".{FILE_EXTENSION}"))?;
    let (id_part, level) = match stem.split_once('_') {
        Some((id, lvl)) => (id, lvl.parse::<u32>().ok()?),
        None => (stem, 0),
    };
    if id_part.len() != 16 {
        return None;
    }
    let file_id = u64::from_str_radix(id_part, 16).ok()?;
    Some((file_id, level))
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Decoded footer fields.
pub(crate) struct Footer {
    pub(crate) index_offset: u64,
    pub(crate) bloom_offset: u64,
    pub(crate) min_key: Vec<u8>,
    pub(crate) max_key: Vec<u8>,
    pub(crate) entry_count: u64,
    pub(crate) tombstone_count: u64,
}

impl Footer {
    /// Attempts to parse a footer starting at `start`, requiring the
    /// variable part to land exactly on the fixed tail.
    fn parse_at(buf: &[u8], start: usize) -> Option<Footer> {
        let tail_start = buf.len() - TAIL_SIZE;
        let fixed = buf.get(start..start + 24)?;
        let data_offset = u64::from_le_bytes(fixed[0..8].try_into().ok()?);
        let index_offset = u64::from_le_bytes(fixed[8..16].try_into().ok()?);
        let bloom_offset = u64::from_le_bytes(fixed[16..24].try_into().ok()?);

        if data_offset != HEADER_SIZE as u64
            || index_offset < data_offset
            || bloom_offset < index_offset
            || bloom_offset > start as u64
        {
            return None;
        }

        let mut pos = start + 24;
        let (min_len, n) = encoding::read_uvarint(buf.get(pos..tail_start)?).ok()?;
        pos += n;
        let min_end = pos.checked_add(usize::try_from(min_len).ok()?)?;
        let min_key = buf.get(pos..min_end)?.to_vec();
        pos = min_end;
        let (max_len, n) = encoding::read_uvarint(buf.get(pos..tail_start)?).ok()?;
        pos += n;
        let max_end = pos.checked_add(usize::try_from(max_len).ok()?)?;
        let max_key = buf.get(pos..max_end)?.to_vec();
        pos = max_end;

        if pos != tail_start {
            return None;
        }

        let entry_count = u64::from_le_bytes(buf[tail_start..tail_start + 8].try_into().ok()?);
        let tombstone_count =
            u64::from_le_bytes(buf[tail_start + 8..tail_start + 16].try_into().ok()?);

        Some(Footer {
            index_offset,
            bloom_offset,
            min_key,
            max_key,
            entry_count,
            tombstone_count,
        })
    }

    /// Recovers the footer from a CRC-verified file image.
    ///
    /// Scans candidate start positions backwards from the fixed tail; a
    /// candidate is accepted only if it parses consistently (leading
    /// `data_offset == 8`, monotonic offsets, exact landing on the tail)
    /// and its bloom block parses and ends exactly where the candidate
    /// begins.
    pub(crate) fn locate(buf: &[u8]) -> Result<Footer, SSTableError> {
        // Smallest possible footer: 24 offset bytes + two 1-byte keys
        // with 1-byte varint prefixes.
        let upper = buf
            .len()
            .checked_sub(TAIL_SIZE + 28)
            .ok_or_else(|| SSTableError::Corrupted("file too short for footer".into()))?;

        for start in (HEADER_SIZE..=upper).rev() {
            let Some(footer) = Footer::parse_at(buf, start) else {
                continue;
            };
            let bloom_start = footer.bloom_offset as usize;
            match BloomFilter::decode(&buf[bloom_start..start]) {
                Ok((_, consumed)) if bloom_start + consumed == start => return Ok(footer),
                _ => continue,
            }
        }

        Err(SSTableError::Corrupted("no consistent footer found".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable reader
// ------------------------------------------------------------------------------------------------

/// An open, memory-mapped SSTable.
#[derive(Debug)]
pub struct SSTable {
    /// Monotonically increasing id; larger id = newer data.
    pub file_id: u64,

    /// Compaction level; freshly flushed tables are level 0.
    pub level: u32,

    path: PathBuf,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    entry_count: u64,
    tombstone_count: u64,

    /// End of the data block (== index_offset).
    data_end: usize,
}

/// One index entry: the first key at `offset` within the file.
#[derive(Debug)]
struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
}

impl SSTable {
    /// Opens and fully validates an SSTable file.
    ///
    /// Checks both magics, the format version, and the whole-file CRC
    /// before trusting any block, then decodes the index and bloom
    /// blocks eagerly.  The data block stays on disk behind the mmap.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let (file_id, level) = parse_file_name(name)
            .ok_or_else(|| SSTableError::Corrupted(format!("bad SSTable filename: {name}")))?;

        let file = File::open(&path)?;
        // SAFETY: the file is never truncated or rewritten while mapped;
        // SSTables are immutable until compaction unlinks them, and the
        // mapping is dropped before the unlink.
        let mmap = unsafe { Mmap::map(&file)? };
        let buf: &[u8] = &mmap;

        if buf.len() < HEADER_SIZE + TAIL_SIZE {
            return Err(SSTableError::Corrupted("file too short".into()));
        }
        if buf[0..4] != MAGIC_HEADER {
            return Err(SSTableError::Corrupted("bad header magic".into()));
        }
        let version = u32::from_le_bytes(
            buf[4..8]
                .try_into()
                .map_err(|_| SSTableError::Corrupted("bad header".into()))?,
        );
        if version != FORMAT_VERSION {
            return Err(SSTableError::Corrupted(format!(
                "unsupported format version {version}"
            )));
        }
        if buf[buf.len() - 4..] != MAGIC_FOOTER {
            return Err(SSTableError::Corrupted("bad trailing magic".into()));
        }

        let crc_pos = buf.len() - 8;
        let stored_crc = u32::from_le_bytes(
            buf[crc_pos..crc_pos + 4]
                .try_into()
                .map_err(|_| SSTableError::Corrupted("bad tail".into()))?,
        );
        let actual_crc = crc32fast::hash(&buf[..crc_pos]);
        if stored_crc != actual_crc {
            return Err(SSTableError::Corrupted(format!(
                "checksum mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        let footer = Footer::locate(buf)?;

        let index = Self::decode_index(
            &buf[footer.index_offset as usize..footer.bloom_offset as usize],
        )?;
        let (bloom, _) = BloomFilter::decode(&buf[footer.bloom_offset as usize..])?;

        trace!(
            file_id,
            level,
            entries = footer.entry_count,
            "opened SSTable"
        );

        Ok(Self {
            file_id,
            level,
            path,
            mmap,
            index,
            bloom,
            min_key: footer.min_key,
            max_key: footer.max_key,
            entry_count: footer.entry_count,
            tombstone_count: footer.tombstone_count,
            data_end: footer.index_offset as usize,
        })
    }

    fn decode_index(block: &[u8]) -> Result<Vec<IndexEntry>, SSTableError> {
        let (count, mut pos) = encoding::read_uvarint(block)?;
        let mut index = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (key_len, n) = encoding::read_uvarint(&block[pos..])?;
            pos += n;
            let key = block
                .get(pos..pos + key_len as usize)
                .ok_or_else(|| SSTableError::Corrupted("index key out of bounds".into()))?
                .to_vec();
            pos += key_len as usize;
            let (offset, n) = encoding::read_uvarint(&block[pos..])?;
            pos += n;
            index.push(IndexEntry { key, offset });
        }
        if pos != block.len() {
            return Err(SSTableError::Corrupted("trailing bytes in index block".into()));
        }
        Ok(index)
    }

    /// Bloom-filter pre-check: false means definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key)
    }

    /// Point lookup.
    ///
    /// Binary-searches the index for the closest preceding entry, then
    /// scans the data block forward.  Keys are sorted, so the scan stops
    /// as soon as it passes the target.
    pub fn get(&self, key: &[u8]) -> Result<Lookup, SSTableError> {
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(Lookup::Missing);
        }

        // Last index entry whose key <= target.
        let slot = self.index.partition_point(|e| e.key.as_slice() <= key);
        if slot == 0 {
            return Ok(Lookup::Missing);
        }
        let mut pos = self.index[slot - 1].offset as usize;

        let buf: &[u8] = &self.mmap;
        while pos < self.data_end {
            let (entry_key, value, next) = Self::decode_entry(buf, pos, self.data_end)?;
            match entry_key.cmp(key) {
                std::cmp::Ordering::Less => pos = next,
                std::cmp::Ordering::Equal => {
                    return Ok(match value {
                        Some(v) => Lookup::Value(v.to_vec()),
                        None => Lookup::Tombstone,
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(Lookup::Missing)
    }

    /// Decodes one data-block entry at `pos`.
    ///
    /// Returns `(key, value-or-tombstone, next_pos)` borrowing from `buf`.
    fn decode_entry(
        buf: &[u8],
        pos: usize,
        data_end: usize,
    ) -> Result<(&[u8], Option<&[u8]>, usize), SSTableError> {
        let (key_len, n) = encoding::read_uvarint(&buf[pos..data_end])?;
        let mut cursor = pos + n;
        let (value_len, n) = encoding::read_uvarint(&buf[cursor..data_end])?;
        cursor += n;

        let key_end = cursor + key_len as usize;
        let value_end = key_end + value_len as usize;
        if value_end > data_end {
            return Err(SSTableError::Corrupted("data entry out of bounds".into()));
        }
        let key = &buf[cursor..key_end];
        let value = if value_len == 0 {
            None
        } else {
            Some(&buf[key_end..value_end])
        };
        Ok((key, value, value_end))
    }

    /// Ordered iterator over every entry, tombstones included.
    ///
    /// Used by compaction merges and the contents-preservation tests.
    pub fn iter(&self) -> SSTableIter<'_> {
        SSTableIter {
            table: self,
            pos: HEADER_SIZE,
        }
    }

    /// Smallest and largest keys stored in this table.
    pub fn key_range(&self) -> (&[u8], &[u8]) {
        (&self.min_key, &self.max_key)
    }

    /// True when `[min, max]` of this table intersects the given range.
    pub fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() <= max && min <= self.max_key.as_slice()
    }

    /// Total number of entries, tombstones included.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Number of tombstone entries.
    pub fn tombstone_count(&self) -> u64 {
        self.tombstone_count
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the file mapping.
    ///
    /// Dropping the table has the same effect; this exists for call sites
    /// that want the release to be explicit before unlinking the file.
    pub fn close(self) {}
}

/// Streaming iterator over an SSTable's data block.
pub struct SSTableIter<'a> {
    table: &'a SSTable,
    pos: usize,
}

impl Iterator for SSTableIter<'_> {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>), SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.table.data_end {
            return None;
        }
        match SSTable::decode_entry(&self.table.mmap, self.pos, self.table.data_end) {
            Ok((key, value, next)) => {
                self.pos = next;
                Some(Ok((key.to_vec(), value.map(<[u8]>::to_vec))))
            }
            Err(e) => {
                self.pos = self.table.data_end;
                Some(Err(e))
            }
        }
    }
}
