//! Periodic checkpointing of schema and table state.
//!
//! A single background worker wakes every `persist_interval` and calls
//! [`PersistenceScheduler::perform_persist_to_disk`], which walks three
//! operation classes in order:
//!
//! 1. **Database metadata** — every dirty `<db>.meta` file.  This class
//!    is critical: a failure aborts the remaining classes.
//! 2. **Table storage** — every open table's row blob.
//! 3. **Table replica** — every open table's placement blob.
//!
//! Storage and replica failures are absorbed: the walk continues and the
//! checkpoint reports overall failure at the end.  The checkpoint is
//! **not** atomic across tables — after a crash some tables may be newer
//! on disk than others, and recovery leans on peer resync.
//!
//! ## Gating
//!
//! A checkpoint runs only when the network reports at least one reachable
//! peer (or offline persistence is enabled), and only one checkpoint runs
//! at a time: the `running` flag is a mutex-guarded boolean acquired
//! through an RAII guard, so it is cleared on every exit path including
//! panics.
//!
//! ## Errors
//!
//! Failures are classified transient / persistent / critical
//! ([`ErrorClass`]).  Transient errors retry up to three attempts with
//! 100/200/400 ms backoff, cut short by shutdown.  Persistent errors fail
//! the operation immediately.  Critical errors latch the node unhealthy
//! ([`PersistenceScheduler::is_healthy`] stays false until operator
//! action) and propagate to the caller.  Every failure feeds the error
//! counters behind [`PersistenceScheduler::get_error_metrics`].

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::SchemaCatalog;
use crate::cluster::PeerProvider;
use crate::diskio::CheckpointIo;
use crate::table::{replica_path, storage_path, TableRegistry};

/// Backoff schedule for transient failures, one entry per retry.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

/// How long `shutdown` waits for the worker before abandoning it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors propagated out of the scheduler.  Everything non-critical is
/// absorbed into metrics and the boolean checkpoint result.
#[derive(Debug, Error)]
pub enum PersistError {
    /// A critical failure; the node is now marked unhealthy.
    #[error("critical persistence failure: {0}")]
    Critical(String),

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Failure classification driving retry and health behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff (resets, busy files, timeouts).
    Transient,

    /// Retry is futile (permissions, missing files, bad input).
    Persistent,

    /// The process itself is compromised (out of memory and kin).
    Critical,
}

/// Classifies an I/O error per the retry taxonomy.
pub fn classify_io(error: &io::Error) -> ErrorClass {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted => ErrorClass::Transient,

        ErrorKind::PermissionDenied
        | ErrorKind::NotFound
        | ErrorKind::InvalidInput
        | ErrorKind::InvalidData
        | ErrorKind::AlreadyExists => ErrorClass::Persistent,

        ErrorKind::OutOfMemory => ErrorClass::Critical,

        _ => {
            // Uncategorized kinds fall back to message sniffing for the
            // classic transient shapes, then default to no-retry.
            let message = error.to_string().to_lowercase();
            if message.contains("connection reset")
                || message.contains("busy")
                || message.contains("too many open files")
                || message.contains("timed out")
                || message.contains("concurrent")
            {
                ErrorClass::Transient
            } else {
                ErrorClass::Persistent
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

/// Error counters accumulated across checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorMetrics {
    /// Every recorded failure.
    pub total_errors: u64,

    /// Failures classified transient.
    pub transient_errors: u64,

    /// Failures classified persistent.
    pub persistent_errors: u64,

    /// Failures classified critical.
    pub critical_errors: u64,

    /// Histogram keyed by `io::ErrorKind` debug name.
    pub by_kind: BTreeMap<String, u64>,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between checkpoints.
    pub persist_interval: Duration,

    /// Allow checkpoints with zero reachable peers.
    pub allow_offline_persist: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(60),
            allow_offline_persist: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduler
// ------------------------------------------------------------------------------------------------

struct ClassifiedFailure {
    class: ErrorClass,
    error: io::Error,
}

/// The periodic checkpoint scheduler.
pub struct PersistenceScheduler {
    catalog: Arc<SchemaCatalog>,
    registry: Arc<TableRegistry>,
    peers: Arc<dyn PeerProvider>,
    io: Arc<dyn CheckpointIo>,
    config: SchedulerConfig,

    /// At-most-one-checkpoint flag; cleared on every exit path.
    running: Mutex<bool>,

    /// Latches false on the first critical failure.
    healthy: AtomicBool,

    metrics: Mutex<ErrorMetrics>,

    /// Cancel flag + condvar: wakes the worker's interval sleep and cuts
    /// retry backoff short.
    cancel: (Mutex<bool>, Condvar),

    /// Worker-exited flag for the bounded shutdown wait.
    exited: (Mutex<bool>, Condvar),

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceScheduler {
    /// Builds a scheduler over the node's state.  No worker runs until
    /// [`PersistenceScheduler::start`].
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        registry: Arc<TableRegistry>,
        peers: Arc<dyn PeerProvider>,
        io: Arc<dyn CheckpointIo>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            peers,
            io,
            config,
            running: Mutex::new(false),
            healthy: AtomicBool::new(true),
            metrics: Mutex::new(ErrorMetrics::default()),
            cancel: (Mutex::new(false), Condvar::new()),
            exited: (Mutex::new(false), Condvar::new()),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the background checkpoint worker.
    pub fn start(self: &Arc<Self>) -> Result<(), PersistError> {
        let scheduler = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rookdb-persist".to_string())
            .spawn(move || {
                scheduler.worker_loop();
                let (lock, cv) = &scheduler.exited;
                if let Ok(mut exited) = lock.lock() {
                    *exited = true;
                }
                cv.notify_all();
            })
            .map_err(|e| PersistError::Critical(format!("failed to spawn worker: {e}")))?;

        *self.worker.lock().map_err(|_| PersistError::LockPoisoned)? = Some(handle);
        info!(interval = ?self.config.persist_interval, "persistence scheduler started");
        Ok(())
    }

    fn worker_loop(&self) {
        loop {
            if self.wait_cancelled(self.config.persist_interval) {
                return;
            }
            match self.perform_persist_to_disk() {
                Ok(true) => debug!("checkpoint completed"),
                Ok(false) => debug!("checkpoint skipped or incomplete"),
                Err(e) => error!(error = %e, "critical checkpoint failure"),
            }
        }
    }

    /// Runs one checkpoint now.
    ///
    /// Returns `Ok(true)` when every operation succeeded, `Ok(false)`
    /// when the checkpoint was skipped (gates closed, another checkpoint
    /// running) or partially failed, and `Err` only for critical
    /// failures.
    pub fn perform_persist_to_disk(&self) -> Result<bool, PersistError> {
        if !self.config.allow_offline_persist && self.peers.reachable_peer_count() == 0 {
            debug!("skipping checkpoint: no reachable peers");
            return Ok(false);
        }

        let Some(_running) = RunningGuard::try_acquire(&self.running)? else {
            debug!("skipping checkpoint: another checkpoint is running");
            return Ok(false);
        };

        let started = Instant::now();
        let mut overall_ok = true;

        // Class 1: database metadata (critical — abort on failure).
        let dirty = self
            .catalog
            .dirty_metas()
            .map_err(|e| self.to_critical(format!("catalog snapshot failed: {e}")))?;
        for (name, path, bytes) in dirty {
            match self.write_with_retry(&path, &bytes) {
                Ok(()) => {
                    self.catalog
                        .mark_clean(&name)
                        .map_err(|_| self.to_critical("catalog lock poisoned".into()))?;
                }
                Err(failure) => {
                    warn!(
                        database = %name,
                        error = %failure.error,
                        "database metadata checkpoint failed; aborting remaining classes"
                    );
                    return match failure.class {
                        ErrorClass::Critical => {
                            Err(self.to_critical(format!("meta write failed: {}", failure.error)))
                        }
                        _ => Ok(false),
                    };
                }
            }
        }

        // Class 2: table storage (non-critical — continue on failure).
        for ((db, table), storage) in self.registry.all_storages() {
            let encoded = {
                let storage = storage
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                storage.encode_blob()
            };
            let path = storage_path(self.registry.data_root(), &db, &table);
            self.persist_blob(&path, encoded.map_err(to_io), &mut overall_ok)?;
        }

        // Class 3: table replica (non-critical — continue on failure).
        for ((db, table), replica) in self.registry.all_replicas() {
            let encoded = {
                let replica = replica
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                replica.encode_blob()
            };
            let path = replica_path(self.registry.data_root(), &db, &table);
            self.persist_blob(&path, encoded.map_err(to_io), &mut overall_ok)?;
        }

        debug!(elapsed = ?started.elapsed(), ok = overall_ok, "checkpoint finished");
        Ok(overall_ok)
    }

    /// Writes one non-critical blob, folding failures into `overall_ok`.
    ///
    /// Returns `Ok(false)` when the item was skipped or failed
    /// non-critically; `Err` only for critical failures.
    fn persist_blob(
        &self,
        path: &std::path::Path,
        encoded: Result<Vec<u8>, io::Error>,
        overall_ok: &mut bool,
    ) -> Result<bool, PersistError> {
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_error(&e);
                warn!(path = %path.display(), error = %e, "failed to encode blob");
                *overall_ok = false;
                return Ok(false);
            }
        };
        match self.write_with_retry(path, &bytes) {
            Ok(()) => Ok(true),
            Err(failure) => {
                warn!(path = %path.display(), error = %failure.error, "blob checkpoint failed");
                match failure.class {
                    ErrorClass::Critical => {
                        Err(self.to_critical(format!("blob write failed: {}", failure.error)))
                    }
                    _ => {
                        *overall_ok = false;
                        Ok(false)
                    }
                }
            }
        }
    }

    /// One write, with transient failures retried up to three times on
    /// the 100/200/400 ms backoff schedule.
    fn write_with_retry(
        &self,
        path: &std::path::Path,
        bytes: &[u8],
    ) -> Result<(), ClassifiedFailure> {
        let mut retries = 0usize;
        loop {
            match self.io.write_atomic(path, bytes) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    let class = classify_io(&error);
                    self.record_error(&error);
                    if class != ErrorClass::Transient || retries >= RETRY_BACKOFF.len() {
                        return Err(ClassifiedFailure { class, error });
                    }
                    if self.wait_cancelled(RETRY_BACKOFF[retries]) {
                        // Shutdown cut the backoff short; surface the
                        // original failure without further attempts.
                        return Err(ClassifiedFailure { class, error });
                    }
                    retries += 1;
                }
            }
        }
    }

    fn record_error(&self, error: &io::Error) {
        let class = classify_io(error);
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.total_errors += 1;
            match class {
                ErrorClass::Transient => metrics.transient_errors += 1,
                ErrorClass::Persistent => metrics.persistent_errors += 1,
                ErrorClass::Critical => metrics.critical_errors += 1,
            }
            *metrics
                .by_kind
                .entry(format!("{:?}", error.kind()))
                .or_insert(0) += 1;
        }
    }

    fn to_critical(&self, message: String) -> PersistError {
        self.healthy.store(false, Ordering::Release);
        error!(%message, "node marked unhealthy");
        PersistError::Critical(message)
    }

    /// Sleeps up to `timeout`, returning early (true) on shutdown.
    fn wait_cancelled(&self, timeout: Duration) -> bool {
        let (lock, cv) = &self.cancel;
        let deadline = Instant::now() + timeout;
        let Ok(mut cancelled) = lock.lock() else {
            return true;
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match cv.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return true,
            }
        }
        true
    }

    /// Current error counters.
    pub fn get_error_metrics(&self) -> ErrorMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Resets all error counters to zero.
    pub fn reset_error_metrics(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            *metrics = ErrorMetrics::default();
        }
    }

    /// False once a critical failure has occurred; never self-heals.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Requests worker exit, waits up to five seconds, then abandons it.
    pub fn shutdown(&self) {
        {
            let (lock, cv) = &self.cancel;
            if let Ok(mut cancelled) = lock.lock() {
                *cancelled = true;
            }
            cv.notify_all();
        }

        let handle = self
            .worker
            .lock()
            .ok()
            .and_then(|mut worker| worker.take());
        let Some(handle) = handle else {
            return;
        };

        let (lock, cv) = &self.exited;
        let deadline = Instant::now() + SHUTDOWN_WAIT;
        let mut exited = match lock.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        while !*exited {
            let now = Instant::now();
            if now >= deadline {
                warn!("persistence worker did not stop in time; abandoning it");
                return;
            }
            match cv.wait_timeout(exited, deadline - now) {
                Ok((guard, _)) => exited = guard,
                Err(_) => return,
            }
        }
        drop(exited);
        let _ = handle.join();
        info!("persistence scheduler stopped");
    }
}

/// RAII guard around the `running` flag.
///
/// The flag is cleared in `Drop`, which runs on every exit path out of
/// `perform_persist_to_disk`, panics included.
struct RunningGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> RunningGuard<'a> {
    fn try_acquire(flag: &'a Mutex<bool>) -> Result<Option<Self>, PersistError> {
        let mut running = flag.lock().map_err(|_| PersistError::LockPoisoned)?;
        if *running {
            return Ok(None);
        }
        *running = true;
        Ok(Some(Self { flag }))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = self
            .flag
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *running = false;
    }
}

fn to_io(e: crate::table::TableError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}
