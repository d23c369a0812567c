//! # Memtable Module
//!
//! ## Design Invariants
//!
//! - Keys are opaque byte sequences ordered lexicographically.
//! - Deletes are represented via tombstones, not physical removal; a
//!   tombstone shadows older values until compaction drops it.
//! - `size_bytes` is always the exact sum of `len(key) + len(value)` over
//!   all entries, with a tombstone's value counted as zero bytes.
//! - Once `size_bytes` reaches `max_size_bytes`, every subsequent write
//!   reports that a flush is due; the memtable itself never refuses a
//!   write.
//!
//! ## Synchronization
//!
//! The memtable is a plain structure with no interior locking.  The engine
//! owns an `RwLock` around its state and serializes writers; a rotated
//! (immutable) memtable is shared behind an `Arc` and is read-only by
//! construction of the engine's state machine:
//! Active → Immutable-Queued → Flushing → Flushed.
//!
//! ## Flush Semantics
//!
//! [`Memtable::snapshot`] returns an ordered, point-in-time copy of all
//! entries, tombstones included.  The SSTable builder consumes exactly one
//! snapshot per memtable; the memtable is discarded afterwards.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The key was empty.  Empty keys are unrepresentable in the SSTable
    /// data block, so they are rejected at the first boundary.
    #[error("invalid key: empty")]
    InvalidKey,
}

// ------------------------------------------------------------------------------------------------
// Lookup result
// ------------------------------------------------------------------------------------------------

/// Three-valued result of a point lookup.
///
/// Distinguishes "never written" from "explicitly deleted": a tombstone
/// must shadow older values in lower layers, so the engine needs to know
/// the difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A live value.
    Value(Vec<u8>),

    /// The key was explicitly deleted at this layer.
    Tombstone,

    /// The key is unknown to this layer.
    Missing,
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// The mutable in-memory write buffer of the storage engine.
///
/// An ordered key→value map with first-class tombstones and exact
/// byte-size accounting.  `put` and `delete` report whether the configured
/// flush threshold has been reached so the engine can rotate the table.
#[derive(Debug)]
pub struct Memtable {
    /// Ordered entries; `None` is a tombstone.
    tree: BTreeMap<Vec<u8>, Option<Vec<u8>>>,

    /// Exact byte footprint: `Σ len(key) + len(value or 0)`.
    size_bytes: usize,

    /// Threshold at which writes start reporting `should_flush`.
    max_size_bytes: usize,
}

impl Memtable {
    /// Creates an empty memtable with the given flush threshold.
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            tree: BTreeMap::new(),
            size_bytes: 0,
            max_size_bytes,
        }
    }

    /// Inserts or replaces a value.
    ///
    /// Returns `Ok(true)` iff `size_bytes >= max_size_bytes` after the
    /// write, i.e. the table should be rotated and flushed.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<bool, MemtableError> {
        if key.is_empty() {
            return Err(MemtableError::InvalidKey);
        }

        let new_len = value.len();
        let key_len = key.len();
        match self.tree.insert(key, Some(value)) {
            None => {
                self.size_bytes += key_len + new_len;
            }
            Some(Some(old)) => {
                self.size_bytes = self.size_bytes - old.len() + new_len;
            }
            Some(None) => {
                // Replacing a tombstone: the key was already accounted.
                self.size_bytes += new_len;
            }
        }

        trace!(size = self.size_bytes, "memtable put");
        Ok(self.size_bytes >= self.max_size_bytes)
    }

    /// Inserts a tombstone for `key`.
    ///
    /// Returns `Ok(true)` iff the flush threshold has been reached, as
    /// with [`Memtable::put`].
    pub fn delete(&mut self, key: Vec<u8>) -> Result<bool, MemtableError> {
        if key.is_empty() {
            return Err(MemtableError::InvalidKey);
        }

        let key_len = key.len();
        match self.tree.insert(key, None) {
            None => {
                self.size_bytes += key_len;
            }
            Some(Some(old)) => {
                self.size_bytes -= old.len();
            }
            Some(None) => {}
        }

        trace!(size = self.size_bytes, "memtable delete");
        Ok(self.size_bytes >= self.max_size_bytes)
    }

    /// Point lookup distinguishing absence from deletion.
    pub fn get(&self, key: &[u8]) -> Lookup {
        match self.tree.get(key) {
            Some(Some(value)) => Lookup::Value(value.clone()),
            Some(None) => Lookup::Tombstone,
            None => Lookup::Missing,
        }
    }

    /// Ordered point-in-time copy of all entries, tombstones included.
    ///
    /// Consumed by the SSTable builder during a flush.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.tree
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Current exact byte footprint.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Number of entries, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.tree.len()
    }

    /// True when the memtable holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
