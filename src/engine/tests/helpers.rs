//! Shared helpers for engine tests.

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::compaction::CompactionConfig;
use crate::engine::{Engine, EngineConfig};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .try_init();
}

/// Engine with a huge memtable: nothing rotates unless a test asks.
pub fn open_manual_engine(tmp: &TempDir) -> Engine {
    init_tracing();
    Engine::open(
        tmp.path(),
        EngineConfig {
            mem_table_max_bytes: 1 << 30,
            max_immutable: 8,
            compaction: CompactionConfig {
                l0_trigger: 1000,
                level_size_ratio: 10,
            },
        },
    )
    .unwrap()
}

/// Rotates the active memtable and synchronously flushes every queued
/// immutable, leaving the written data in SSTables.
pub fn flush_all(engine: &Engine) {
    engine.rotate_active().unwrap();
    while engine.flush_oldest_immutable().unwrap() {}
    assert_eq!(engine.immutable_count().unwrap(), 0);
}
