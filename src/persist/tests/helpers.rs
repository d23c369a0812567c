//! Shared fixtures: scripted checkpoint I/O and scheduler assembly.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::catalog::SchemaCatalog;
use crate::cluster::{NodeRecord, StaticRoster};
use crate::diskio::{CheckpointIo, DiskIo};
use crate::persist::{PersistenceScheduler, SchedulerConfig};
use crate::table::TableRegistry;

/// Checkpoint I/O that replays scripted failures before succeeding, and
/// counts every write attempt.
pub struct ScriptedIo {
    failures: Mutex<VecDeque<io::Error>>,
    attempts: AtomicUsize,
    panic_next: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedIo {
    pub fn clean() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            panic_next: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Fails the first `errors.len()` writes with the given errors, in
    /// order, then succeeds.
    pub fn failing_first(errors: Vec<io::Error>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            attempts: AtomicUsize::new(0),
            panic_next: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Every write sleeps for `delay` before succeeding.
    pub fn slow(delay: Duration) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            panic_next: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    /// The next `count` writes panic.
    pub fn panic_times(&self, count: usize) {
        self.panic_next.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl CheckpointIo for ScriptedIo {
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .panic_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("scripted checkpoint panic");
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        DiskIo.write_atomic(path, bytes)
    }
}

/// Scheduler over a catalog holding one dirty database, so every
/// checkpoint performs exactly one metadata write.
pub fn scheduler_with_dirty_db(
    tmp: &TempDir,
    io: Arc<ScriptedIo>,
) -> Arc<PersistenceScheduler> {
    let catalog = Arc::new(SchemaCatalog::open(tmp.path()).unwrap());
    catalog.create_database("db1").unwrap();
    build_scheduler(tmp, catalog, io, true)
}

pub fn build_scheduler(
    tmp: &TempDir,
    catalog: Arc<SchemaCatalog>,
    io: Arc<ScriptedIo>,
    allow_offline: bool,
) -> Arc<PersistenceScheduler> {
    let registry = Arc::new(TableRegistry::new(tmp.path()));
    let roster = Arc::new(StaticRoster::new(
        NodeRecord::new("self", "10.0.0.1"),
        vec![NodeRecord::new("peer", "10.0.0.2")],
    ));
    Arc::new(PersistenceScheduler::new(
        catalog,
        registry,
        roster,
        io,
        SchedulerConfig {
            persist_interval: Duration::from_secs(60),
            allow_offline_persist: allow_offline,
        },
    ))
}

pub fn transient_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "Connection reset")
}

pub fn persistent_error() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied")
}
