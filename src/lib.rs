//! # RookDB
//!
//! The distributed storage core of a small, peer-to-peer row store:
//! crash-safe, eventually-consistent storage across a set of symmetric
//! nodes, built on a **Log-Structured Merge Tree (LSM)** engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Node                              │
//! │                                                            │
//! │  ┌───────────────┐   ┌──────────────────────────────────┐  │
//! │  │ SchemaCatalog │   │          TableRegistry           │  │
//! │  │  <db>.meta    │   │  per (db, table):                │  │
//! │  └───────┬───────┘   │   TableStorage ── LSM Engine     │  │
//! │          │           │   TableReplica    (memtables +   │  │
//! │          │           │                    SSTables)     │  │
//! │          │           └───────┬──────────────────────────┘  │
//! │          │                   │                             │
//! │  ┌───────┴───────────────────┴───────┐  ┌───────────────┐  │
//! │  │       PersistenceScheduler        │  │  Placement    │  │
//! │  │  (periodic checkpoint + retry)    │  │  Policy       │  │
//! │  └───────────────────────────────────┘  └───────────────┘  │
//! │                                                            │
//! │  ┌───────────────────────────────────┐                     │
//! │  │        ReplicationApplier         │◄── peers (POST)     │
//! │  └───────────────────────────────────┘                     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes flow client → placement → primary's `TableStorage` (backed by
//! an LSM engine) → replica record → replication to the secondary.  The
//! persistence scheduler periodically checkpoints catalog, storage, and
//! replica state; recovery after a crash combines those checkpoints with
//! peer resync.
//!
//! The network surface (HTTP endpoints, peer discovery, heartbeats) is a
//! collaborator behind the [`cluster`] traits — this crate contains no
//! sockets.
//!
//! ## Modules
//!
//! - [`memtable`] — in-memory write buffer with tombstones.
//! - [`sstable`] — immutable on-disk tables with bloom filters.
//! - [`engine`] — the LSM engine and its background workers.
//! - [`compaction`] — leveled compaction planning.
//! - [`row`] — lazily-parsed schemaless rows.
//! - [`table`] — per-table row storage and replica placement maps.
//! - [`catalog`] — the database → tables schema catalog.
//! - [`placement`] — primary/secondary selection.
//! - [`persist`] — the periodic checkpoint scheduler.
//! - [`replication`] — replicated mutation records and their applier.
//! - [`cluster`] — node records and network-collaborator traits.
//! - [`node`] — assembly of all of the above.
//! - [`encoding`] — deterministic on-disk serialization.
//! - [`config`] — configuration and environment keys.

pub mod catalog;
pub mod cluster;
pub mod compaction;
pub mod config;
pub mod diskio;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod node;
pub mod persist;
pub mod placement;
pub mod replication;
pub mod row;
pub mod sstable;
pub mod table;

pub use config::Config;
pub use node::{Node, NodeBuilder, NodeError};
