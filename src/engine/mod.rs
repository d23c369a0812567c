//! # LSM Storage Engine
//!
//! Composes the memtable pipeline with the on-disk SSTable set and owns
//! the background flush and compaction workers.
//!
//! ## Design Overview
//!
//! Data lives in three layers, queried newest-first:
//!
//! 1. **Active memtable** — the single writable in-memory table.
//! 2. **Immutable memtables** — a bounded queue of rotated tables
//!    awaiting flush.
//! 3. **SSTables** — immutable on-disk tables, ordered by file id
//!    (larger id = newer), pre-filtered by bloom filters.
//!
//! A write that fills the active memtable atomically enqueues it, installs
//! a fresh active table, and signals the flush worker.  The flush worker
//! turns the oldest immutable table into a level-0 SSTable; the compaction
//! worker then reshapes the on-disk set per the leveled policy in
//! [`crate::compaction`].
//!
//! The active memtable's lifecycle is
//! Active → Immutable-Queued → Flushing → Flushed; only Active accepts
//! writes, and a table stays readable in the immutable queue until its
//! SSTable is registered.
//!
//! ## Concurrency Model
//!
//! Engine state sits behind a single `RwLock`: reads take the read lock,
//! writes and worker pointer-swaps take the write lock briefly.  All heavy
//! I/O (SSTable builds, merges) happens with no lock held.  Backpressure
//! is a mutex+condvar gate on the immutable-queue length: writers block
//! while the queue is at `max_immutable` and are woken by the flush
//! worker.  Workers hold a `Weak` reference to the shared state plus a
//! shutdown flag, and are joined by [`Engine::close`].
//!
//! ## Guarantees
//!
//! - Writes are linearizable with respect to reads of the same key.
//! - SSTable file-id order strictly reflects flush order; a fresh id is
//!   `max(prior ids, unix-millis clock) + 1` so recency survives restarts.
//! - Compaction never changes visible state: outputs are written and
//!   fsynced before the registry swap, and inputs are unlinked only after.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction::{self, CompactionConfig, CompactionTask, TableMeta};
use crate::memtable::{Lookup, Memtable, MemtableError};
use crate::sstable::{build_sstable, builder::sweep_temp_files, SSTable, SSTableError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An SSTable failed validation (bad magic, checksum, structure).
    #[error("corrupted SSTable: {0}")]
    Corrupted(String),

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned")]
    LockPoisoned,

    /// The engine is closing or closed.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Invalid key surfaced from the memtable.
    #[error(transparent)]
    InvalidKey(#[from] MemtableError),
}

impl From<SSTableError> for EngineError {
    fn from(e: SSTableError) -> Self {
        match e {
            SSTableError::Io(io) => EngineError::Io(io),
            other => EngineError::Corrupted(other.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max active-memtable size (bytes) before rotation.
    pub mem_table_max_bytes: usize,

    /// Max rotated memtables awaiting flush; writers block beyond this.
    pub max_immutable: usize,

    /// Leveled-compaction thresholds.
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mem_table_max_bytes: 4 * 1024 * 1024,
            max_immutable: 4,
            compaction: CompactionConfig::default(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct EngineInner {
    /// The one writable memtable.
    active: Memtable,

    /// Rotated memtables, oldest at the front.  Shared behind `Arc` so
    /// the flush worker can build an SSTable without holding the lock.
    immutables: VecDeque<Arc<Memtable>>,

    /// On-disk tables, newest-first (descending file id).
    sstables: Vec<Arc<SSTable>>,

    /// Set once by `close`; every subsequent operation fails fast.
    shutting_down: bool,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<EngineInner>,

    /// Authoritative immutable-queue length for backpressure.  Lock order
    /// is always gate → state; workers touch the gate only after
    /// releasing the state lock.
    gate: Mutex<usize>,
    gate_cv: Condvar,

    /// Highest file id ever seen or allocated.
    max_file_id: Mutex<u64>,

    /// Serializes flushes: the worker and the public entry point must
    /// never race on the queue front.
    flush_lock: Mutex<()>,

    /// Serializes compaction rounds for the same reason.
    compact_lock: Mutex<()>,

    shutdown: AtomicBool,
    dir: PathBuf,
    config: EngineConfig,
    compact_tx: Sender<()>,
}

impl Shared {
    /// Allocates the next SSTable file id:
    /// `max(prior ids, unix-millis clock) + 1`.
    fn alloc_file_id(&self) -> Result<u64, EngineError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut max = self.max_file_id.lock().map_err(|_| EngineError::LockPoisoned)?;
        let id = (*max).max(now_ms) + 1;
        *max = id;
        Ok(id)
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The LSM engine handle.
///
/// Thread-safe; clone freely — all clones share the same state.
#[derive(Debug)]
pub struct Engine {
    shared: Arc<Shared>,
    flush_tx: Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Opens (or creates) an engine rooted at `dir`.
    ///
    /// Scans the directory for existing SSTable files, registers them
    /// newest-first, sweeps stale temp files, and starts the flush and
    /// compaction workers.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        sweep_temp_files(&dir)?;

        let mut sstables = Vec::new();
        let mut max_file_id = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if crate::sstable::parse_file_name(name).is_none() {
                continue;
            }
            let sst = SSTable::open(&path)?;
            max_file_id = max_file_id.max(sst.file_id);
            sstables.push(Arc::new(sst));
        }
        sstables.sort_by(|a, b| b.file_id.cmp(&a.file_id));
        info!(dir = %dir.display(), sstables = sstables.len(), "engine opened");

        let (flush_tx, flush_rx) = channel::unbounded();
        let (compact_tx, compact_rx) = channel::unbounded();

        let shared = Arc::new(Shared {
            state: RwLock::new(EngineInner {
                active: Memtable::new(config.mem_table_max_bytes),
                immutables: VecDeque::new(),
                sstables,
                shutting_down: false,
            }),
            gate: Mutex::new(0),
            gate_cv: Condvar::new(),
            max_file_id: Mutex::new(max_file_id),
            flush_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            dir,
            config,
            compact_tx: compact_tx.clone(),
        });

        let flush_worker = spawn_worker("rookdb-flush", Arc::downgrade(&shared), flush_rx, |s| {
            flush_oldest(s).map(|_| ())
        })?;
        let compact_worker =
            spawn_worker("rookdb-compact", Arc::downgrade(&shared), compact_rx, |s| {
                while compact_once(s)? {}
                Ok(())
            })?;

        Ok(Self {
            shared,
            flush_tx,
            workers: Mutex::new(vec![flush_worker, compact_worker]),
        })
    }

    /// Insert or replace a key.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        self.write(key, Some(value))
    }

    /// Delete a key by inserting a tombstone.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        self.write(key, None)
    }

    fn write(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<(), EngineError> {
        let shared = &self.shared;

        // Backpressure gate, then state; the flush worker only touches the
        // gate with the state lock released, so this order cannot deadlock.
        let mut queue_len = shared.gate.lock().map_err(|_| EngineError::LockPoisoned)?;
        while *queue_len >= shared.config.max_immutable
            && !shared.shutdown.load(Ordering::Acquire)
        {
            queue_len = shared
                .gate_cv
                .wait(queue_len)
                .map_err(|_| EngineError::LockPoisoned)?;
        }

        let mut state = shared.state.write().map_err(|_| EngineError::LockPoisoned)?;
        if state.shutting_down {
            return Err(EngineError::ShuttingDown);
        }

        let should_flush = match value {
            Some(v) => state.active.put(key, v)?,
            None => state.active.delete(key)?,
        };

        if should_flush {
            let full = std::mem::replace(
                &mut state.active,
                Memtable::new(shared.config.mem_table_max_bytes),
            );
            state.immutables.push_back(Arc::new(full));
            *queue_len = state.immutables.len();
            let _ = self.flush_tx.send(());
            debug!(queued = *queue_len, "memtable rotated");
        }
        Ok(())
    }

    /// Point lookup across all layers, newest-first.
    ///
    /// A tombstone at any layer hides older values; bloom filters skip
    /// SSTables that definitely lack the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| EngineError::LockPoisoned)?;
        if state.shutting_down {
            return Err(EngineError::ShuttingDown);
        }

        match state.active.get(key) {
            Lookup::Value(v) => return Ok(Some(v)),
            Lookup::Tombstone => return Ok(None),
            Lookup::Missing => {}
        }

        for immutable in state.immutables.iter().rev() {
            match immutable.get(key) {
                Lookup::Value(v) => return Ok(Some(v)),
                Lookup::Tombstone => return Ok(None),
                Lookup::Missing => {}
            }
        }

        for sst in &state.sstables {
            if !sst.might_contain(key) {
                continue;
            }
            match sst.get(key)? {
                Lookup::Value(v) => return Ok(Some(v)),
                Lookup::Tombstone => return Ok(None),
                Lookup::Missing => {}
            }
        }
        Ok(None)
    }

    /// Synchronously flushes the oldest immutable memtable, if any.
    ///
    /// The flush worker runs exactly this; it is public so callers (and
    /// tests) can force deterministic flushes.
    pub fn flush_oldest_immutable(&self) -> Result<bool, EngineError> {
        flush_oldest(&self.shared)
    }

    /// Runs one round of compaction planning and execution.
    ///
    /// Returns `Ok(true)` when a merge ran, `Ok(false)` when the tree is
    /// already in shape.
    pub fn compact_once(&self) -> Result<bool, EngineError> {
        compact_once(&self.shared)
    }

    /// Rotates the active memtable onto the immutable queue even below
    /// the size threshold.  No-op when the active table is empty.
    pub fn rotate_active(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        let mut queue_len = shared.gate.lock().map_err(|_| EngineError::LockPoisoned)?;
        let mut state = shared.state.write().map_err(|_| EngineError::LockPoisoned)?;
        if state.shutting_down {
            return Err(EngineError::ShuttingDown);
        }
        if state.active.is_empty() {
            return Ok(());
        }
        let full = std::mem::replace(
            &mut state.active,
            Memtable::new(shared.config.mem_table_max_bytes),
        );
        state.immutables.push_back(Arc::new(full));
        *queue_len = state.immutables.len();
        let _ = self.flush_tx.send(());
        Ok(())
    }

    /// Number of SSTables currently registered.
    pub fn sstable_count(&self) -> Result<usize, EngineError> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| EngineError::LockPoisoned)?;
        Ok(state.sstables.len())
    }

    /// Number of immutable memtables awaiting flush.
    pub fn immutable_count(&self) -> Result<usize, EngineError> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| EngineError::LockPoisoned)?;
        Ok(state.immutables.len())
    }

    /// Gracefully shuts the engine down.
    ///
    /// Stops and joins both workers, then drains the active and immutable
    /// memtables to SSTables so no acknowledged write is lost.  The
    /// engine rejects every operation afterwards.
    pub fn close(&self) -> Result<(), EngineError> {
        {
            let mut state = self
                .shared
                .state
                .write()
                .map_err(|_| EngineError::LockPoisoned)?;
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.gate_cv.notify_all();
        // Wake both workers so they observe the shutdown flag.
        let _ = self.flush_tx.send(());
        let _ = self.shared.compact_tx.send(());

        let handles = {
            let mut workers = self.workers.lock().map_err(|_| EngineError::LockPoisoned)?;
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("engine worker panicked during shutdown");
            }
        }

        // Drain everything left in memory; workers are gone, so this is
        // the only writer.
        loop {
            let drained = flush_oldest(&self.shared)?;
            if !drained {
                break;
            }
        }
        let snapshot = {
            let mut state = self
                .shared
                .state
                .write()
                .map_err(|_| EngineError::LockPoisoned)?;
            if state.active.is_empty() {
                None
            } else {
                let full = std::mem::replace(&mut state.active, Memtable::new(0));
                Some(full.snapshot())
            }
        };
        if let Some(snapshot) = snapshot {
            let file_id = self.shared.alloc_file_id()?;
            let sst = build_sstable(&snapshot, &self.shared.dir, file_id, 0)?;
            let mut state = self
                .shared
                .state
                .write()
                .map_err(|_| EngineError::LockPoisoned)?;
            state.sstables.insert(0, Arc::new(sst));
        }

        info!(dir = %self.shared.dir.display(), "engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Last-resort cleanup for callers that skipped close(); errors
        // here have nowhere to go.
        let _ = self.close();
    }
}

// ------------------------------------------------------------------------------------------------
// Workers
// ------------------------------------------------------------------------------------------------

fn spawn_worker(
    name: &str,
    shared: Weak<Shared>,
    signal: Receiver<()>,
    work: impl Fn(&Shared) -> Result<(), EngineError> + Send + 'static,
) -> Result<JoinHandle<()>, EngineError> {
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while signal.recv().is_ok() {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = work(&shared) {
                    warn!(error = %e, "background worker operation failed");
                }
            }
        })?;
    Ok(handle)
}

/// Flushes the oldest immutable memtable into a level-0 SSTable.
///
/// Returns `Ok(false)` when the queue is empty.  The memtable stays
/// readable in the queue until its SSTable is registered, so reads never
/// observe a gap (Flushing state).
fn flush_oldest(shared: &Shared) -> Result<bool, EngineError> {
    let _serial = shared
        .flush_lock
        .lock()
        .map_err(|_| EngineError::LockPoisoned)?;
    let snapshot = {
        let state = shared.state.read().map_err(|_| EngineError::LockPoisoned)?;
        match state.immutables.front() {
            Some(oldest) => oldest.snapshot(),
            None => return Ok(false),
        }
    };

    // Heavy I/O with no lock held.
    let file_id = shared.alloc_file_id()?;
    let sst = build_sstable(&snapshot, &shared.dir, file_id, 0)?;

    {
        let mut state = shared.state.write().map_err(|_| EngineError::LockPoisoned)?;
        state.sstables.insert(0, Arc::new(sst));
        state.immutables.pop_front();
    }

    // Free a queue slot after the state lock is released (gate → state
    // order is writer-only).
    {
        let mut queue_len = shared.gate.lock().map_err(|_| EngineError::LockPoisoned)?;
        *queue_len = queue_len.saturating_sub(1);
    }
    shared.gate_cv.notify_all();
    let _ = shared.compact_tx.send(());
    debug!(file_id, "memtable flushed to SSTable");
    Ok(true)
}

/// Plans and executes one compaction round.
fn compact_once(shared: &Shared) -> Result<bool, EngineError> {
    let _serial = shared
        .compact_lock
        .lock()
        .map_err(|_| EngineError::LockPoisoned)?;
    let (task, inputs) = {
        let state = shared.state.read().map_err(|_| EngineError::LockPoisoned)?;
        let metas: Vec<TableMeta> = state
            .sstables
            .iter()
            .map(|s| TableMeta {
                file_id: s.file_id,
                level: s.level,
                size_bytes: s.file_size(),
                min_key: s.key_range().0.to_vec(),
                max_key: s.key_range().1.to_vec(),
            })
            .collect();
        let Some(task) = compaction::plan(&metas, &shared.config.compaction) else {
            return Ok(false);
        };
        let inputs: Vec<Arc<SSTable>> = state
            .sstables
            .iter()
            .filter(|s| task.inputs.contains(&s.file_id))
            .cloned()
            .collect();
        (task, inputs)
    };

    merge_tables(shared, &task, &inputs)?;
    Ok(true)
}

/// K-way merge of the input tables, newest file id winning on equal keys.
///
/// The output is written and fsynced before the registry swap; obsolete
/// inputs are unlinked only afterwards, so a crash at any point leaves a
/// readable set.
fn merge_tables(
    shared: &Shared,
    task: &CompactionTask,
    inputs: &[Arc<SSTable>],
) -> Result<(), EngineError> {
    let mut oldest_first: Vec<&Arc<SSTable>> = inputs.iter().collect();
    oldest_first.sort_by_key(|s| s.file_id);

    let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
    for sst in oldest_first {
        for entry in sst.iter() {
            let (key, value) = entry?;
            merged.insert(key, value);
        }
    }
    if task.drops_tombstones {
        merged.retain(|_, v| v.is_some());
    }

    let output = if merged.is_empty() {
        None
    } else {
        let entries: Vec<(Vec<u8>, Option<Vec<u8>>)> = merged.into_iter().collect();
        let file_id = shared.alloc_file_id()?;
        Some(build_sstable(&entries, &shared.dir, file_id, task.target_level)?)
    };

    {
        let mut state = shared.state.write().map_err(|_| EngineError::LockPoisoned)?;
        state
            .sstables
            .retain(|s| !task.inputs.contains(&s.file_id));
        if let Some(sst) = output {
            state.sstables.push(Arc::new(sst));
        }
        state.sstables.sort_by(|a, b| b.file_id.cmp(&a.file_id));
    }

    for sst in inputs {
        if let Err(e) = fs::remove_file(sst.path()) {
            warn!(path = %sst.path().display(), error = %e, "failed to unlink compacted SSTable");
        }
    }
    debug!(
        inputs = inputs.len(),
        target = task.target_level,
        "compaction round complete"
    );
    Ok(())
}
