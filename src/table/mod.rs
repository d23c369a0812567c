//! Per-table state: row storage and replica placement.
//!
//! Each `(database, table)` pair owns two persisted structures:
//!
//! - [`TableStorage`] — an ordered `row_id → row` map, serialized as a
//!   single versioned blob at `<root>/<db>/<table>/storage`.
//! - [`TableReplica`] — an ordered `row_id → (primary, secondary)` map at
//!   `<root>/<db>/<table>/replica`, recording which nodes hold each row.
//!
//! Saves are atomic (temp + rename).  Loads tolerate truncated or
//! corrupted files by logging at `warn` and starting empty — a peer
//! resync can repopulate the data, so a damaged blob is degraded, not
//! fatal.  An unknown format version refuses to load instead: that file
//! was written by a newer build and must not be quietly discarded.
//!
//! [`TableRegistry`] owns the live instances process-wide, keyed by the
//! catalog's canonical names; the persistence scheduler, the replication
//! applier, and the node facade all borrow from it.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::diskio;
use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crate::engine::{Engine, EngineConfig, EngineError};
use crate::row::{Row, RowError, RowId};

/// Format version stamped on storage, replica, and index files.
const BLOB_VERSION: u8 = 1;

/// Sentinel node id meaning "no secondary was available".
pub const NO_SECONDARY: &str = "";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table state operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The on-disk blob was written by an unknown format version.
    #[error("unsupported blob version {found} (supported: {BLOB_VERSION})")]
    UnsupportedVersion {
        /// Version byte found in the file.
        found: u8,
    },

    /// The row's embedded id disagrees with the map key.
    #[error("row id mismatch: keyed as {keyed}, row carries {embedded}")]
    RowIdMismatch {
        /// Key the caller used.
        keyed: String,
        /// Id embedded in the row payload.
        embedded: String,
    },

    /// The row payload could not be interpreted.
    #[error(transparent)]
    Row(#[from] RowError),

    /// The attached LSM engine failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Placement
// ------------------------------------------------------------------------------------------------

/// Which nodes hold a row: the primary owner and one secondary copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Node id of the row's owner.
    pub primary: String,

    /// Node id of the replica holder, or [`NO_SECONDARY`] when no peer
    /// was available at insertion time.
    pub secondary: String,
}

impl Placement {
    /// Placement with both slots filled.
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }

    /// Placement with no secondary copy.
    pub fn solo(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: NO_SECONDARY.to_string(),
        }
    }

    /// The secondary node id, unless it is the empty sentinel.
    pub fn secondary_node(&self) -> Option<&str> {
        if self.secondary == NO_SECONDARY {
            None
        } else {
            Some(&self.secondary)
        }
    }
}

impl Encode for Placement {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_str(&self.primary, out)?;
        encoding::put_str(&self.secondary, out)
    }
}

impl Decode for Placement {
    fn decode(r: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            primary: r.read_string()?,
            secondary: r.read_string()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Paths
// ------------------------------------------------------------------------------------------------

/// Directory holding one table's artifacts.
pub fn table_dir(root: &Path, db: &str, table: &str) -> PathBuf {
    root.join(db).join(table)
}

/// Path of the serialized row map.
pub fn storage_path(root: &Path, db: &str, table: &str) -> PathBuf {
    table_dir(root, db, table).join("storage")
}

/// Path of the serialized placement map.
pub fn replica_path(root: &Path, db: &str, table: &str) -> PathBuf {
    table_dir(root, db, table).join("replica")
}

/// Path of the reserved secondary-index placeholder.
pub fn index_path(root: &Path, db: &str, table: &str) -> PathBuf {
    table_dir(root, db, table).join("index")
}

/// Directory for the table's LSM files.
pub fn lsm_dir(root: &Path, db: &str, table: &str) -> PathBuf {
    table_dir(root, db, table).join("lsm")
}

// ------------------------------------------------------------------------------------------------
// TableStorage
// ------------------------------------------------------------------------------------------------

/// Ordered `row_id → row` map for one `(database, table)`.
///
/// Optionally wraps an LSM engine rooted at the table's `lsm/`
/// directory: writes mirror into the engine keyed by row id, and point
/// lookups fall back to it when the in-memory map misses (a damaged
/// blob leaves rows recoverable by id).
#[derive(Debug)]
pub struct TableStorage {
    /// Owning database name (canonical form).
    pub database: String,

    /// Table name (canonical form).
    pub table: String,

    rows: BTreeMap<RowId, Row>,

    lsm: Option<Engine>,
}

impl TableStorage {
    /// Empty storage for a freshly created table.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            rows: BTreeMap::new(),
            lsm: None,
        }
    }

    /// Attaches an LSM engine as the row-level write mirror.
    pub fn attach_engine(&mut self, engine: Engine) {
        self.lsm = Some(engine);
    }

    /// Inserts a row keyed by its id.
    ///
    /// Returns `Ok(false)` when the id is already present (the existing
    /// row is kept).  The row's embedded id must equal `row_id`.
    pub fn insert(&mut self, row_id: RowId, row: Row) -> Result<bool, TableError> {
        self.check_row_id(&row_id, &row)?;
        if self.rows.contains_key(&row_id) {
            return Ok(false);
        }
        if let Some(lsm) = &self.lsm {
            lsm.put(row_id.clone().into_bytes(), row.bytes().to_vec())?;
        }
        self.rows.insert(row_id, row);
        Ok(true)
    }

    /// Replaces an existing row.  Returns `Ok(false)` when absent.
    pub fn update(&mut self, row_id: &str, row: Row) -> Result<bool, TableError> {
        self.check_row_id(row_id, &row)?;
        if !self.rows.contains_key(row_id) {
            return Ok(false);
        }
        if let Some(lsm) = &self.lsm {
            lsm.put(row_id.as_bytes().to_vec(), row.bytes().to_vec())?;
        }
        self.rows.insert(row_id.to_string(), row);
        Ok(true)
    }

    /// Removes a row.  Returns false when it was absent.
    pub fn delete(&mut self, row_id: &str) -> bool {
        if let Some(lsm) = &self.lsm {
            if let Err(e) = lsm.delete(row_id.as_bytes().to_vec()) {
                warn!(row_id, error = %e, "engine delete failed");
            }
        }
        self.rows.remove(row_id).is_some()
    }

    /// Point lookup by row id, falling back to the LSM engine when the
    /// map misses.
    pub fn get(&self, row_id: &str) -> Option<Row> {
        if let Some(row) = self.rows.get(row_id) {
            return Some(row.clone());
        }
        let lsm = self.lsm.as_ref()?;
        match lsm.get(row_id.as_bytes()) {
            Ok(bytes) => bytes.map(Row::from_bytes),
            Err(e) => {
                warn!(row_id, error = %e, "engine lookup failed");
                None
            }
        }
    }

    /// Closes the attached engine, if any.
    pub fn close(&mut self) -> Result<(), TableError> {
        if let Some(lsm) = self.lsm.take() {
            lsm.close()?;
        }
        Ok(())
    }

    /// Row ids whose `column` equals `value`, in id order.
    ///
    /// A linear scan: there are no secondary indexes.
    pub fn select(&self, column: &str, value: &str) -> Vec<RowId> {
        self.rows
            .iter()
            .filter(|(_, row)| row.matches(column, value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// All rows in id order.
    pub fn rows(&self) -> impl Iterator<Item = (&RowId, &Row)> {
        self.rows.iter()
    }

    /// Number of stored rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn check_row_id(&self, row_id: &str, row: &Row) -> Result<(), TableError> {
        let embedded = row.row_id()?;
        if embedded != row_id {
            return Err(TableError::RowIdMismatch {
                keyed: row_id.to_string(),
                embedded,
            });
        }
        Ok(())
    }

    /// Serializes the whole map as one versioned blob.
    pub fn encode_blob(&self) -> Result<Vec<u8>, TableError> {
        let mut buf = vec![BLOB_VERSION];
        encoding::put_str(&self.database, &mut buf)?;
        encoding::put_str(&self.table, &mut buf)?;
        let entries: Vec<StorageEntry> = self
            .rows
            .iter()
            .map(|(id, row)| StorageEntry {
                row_id: id.clone(),
                payload: row.bytes().to_vec(),
            })
            .collect();
        encoding::encode_slice(&entries, &mut buf)?;
        Ok(buf)
    }

    /// Writes the blob atomically, plus the reserved index placeholder.
    pub fn save_to_disk(&self, root: &Path) -> Result<(), TableError> {
        let path = storage_path(root, &self.database, &self.table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        diskio::atomic_write(&path, &self.encode_blob()?)?;

        let index = index_path(root, &self.database, &self.table);
        if !index.exists() {
            diskio::atomic_write(&index, &[BLOB_VERSION])?;
        }
        Ok(())
    }

    /// Loads the blob, tolerating damage by starting empty.
    pub fn load_from_disk(
        root: &Path,
        database: &str,
        table: &str,
    ) -> Result<Self, TableError> {
        let path = storage_path(root, database, table);
        let empty = Self::new(database, table);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty),
            Err(e) => return Err(e.into()),
        };

        match decode_storage_blob(&bytes, database, table) {
            Ok(storage) => Ok(storage),
            Err(TableError::UnsupportedVersion { found }) => {
                error!(
                    path = %path.display(),
                    found,
                    "refusing to load table storage written by unknown format version"
                );
                Err(TableError::UnsupportedVersion { found })
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "table storage blob damaged; starting empty"
                );
                Ok(empty)
            }
        }
    }
}

struct StorageEntry {
    row_id: RowId,
    payload: Vec<u8>,
}

impl Encode for StorageEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_str(&self.row_id, out)?;
        encoding::put_bytes(&self.payload, out)
    }
}

impl Decode for StorageEntry {
    fn decode(r: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            row_id: r.read_string()?,
            payload: r.read_bytes()?,
        })
    }
}

fn decode_storage_blob(bytes: &[u8], database: &str, table: &str) -> Result<TableStorage, TableError> {
    let mut r = Reader::new(bytes);
    let version = r.read_u8()?;
    if version != BLOB_VERSION {
        return Err(TableError::UnsupportedVersion { found: version });
    }
    let _stored_db = r.read_string()?;
    let _stored_table = r.read_string()?;
    let entries: Vec<StorageEntry> = encoding::decode_seq(&mut r)?;

    let mut storage = TableStorage::new(database, table);
    for entry in entries {
        storage
            .rows
            .insert(entry.row_id, Row::from_bytes(entry.payload));
    }
    Ok(storage)
}

// ------------------------------------------------------------------------------------------------
// TableReplica
// ------------------------------------------------------------------------------------------------

/// Ordered `row_id → placement` map for one `(database, table)`.
///
/// On the primary, every stored row has an entry here whose `primary` is
/// this node's id; the map survives node loss and seeds resynchronization.
#[derive(Debug)]
pub struct TableReplica {
    /// Owning database name (canonical form).
    pub database: String,

    /// Table name (canonical form).
    pub table: String,

    placements: BTreeMap<RowId, Placement>,
}

impl TableReplica {
    /// Empty placement map.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            placements: BTreeMap::new(),
        }
    }

    /// Inserts or replaces the placement for `row_id`.
    pub fn insert_or_replace(&mut self, row_id: RowId, placement: Placement) {
        self.placements.insert(row_id, placement);
    }

    /// Removes a placement.  Returns false when it was absent.
    pub fn delete(&mut self, row_id: &str) -> bool {
        self.placements.remove(row_id).is_some()
    }

    /// Placement lookup by row id.
    pub fn get(&self, row_id: &str) -> Option<&Placement> {
        self.placements.get(row_id)
    }

    /// All placements in row-id order.
    pub fn entries(&self) -> impl Iterator<Item = (&RowId, &Placement)> {
        self.placements.iter()
    }

    /// Number of placement entries.
    pub fn entry_count(&self) -> usize {
        self.placements.len()
    }

    /// Serializes the map as one versioned blob.
    pub fn encode_blob(&self) -> Result<Vec<u8>, TableError> {
        let mut buf = vec![BLOB_VERSION];
        encoding::put_str(&self.database, &mut buf)?;
        encoding::put_str(&self.table, &mut buf)?;
        let entries: Vec<ReplicaEntry> = self
            .placements
            .iter()
            .map(|(id, placement)| ReplicaEntry {
                row_id: id.clone(),
                placement: placement.clone(),
            })
            .collect();
        encoding::encode_slice(&entries, &mut buf)?;
        Ok(buf)
    }

    /// Writes the blob atomically.
    pub fn save_to_disk(&self, root: &Path) -> Result<(), TableError> {
        let path = replica_path(root, &self.database, &self.table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        diskio::atomic_write(&path, &self.encode_blob()?)?;
        Ok(())
    }

    /// Loads the blob, tolerating damage by starting empty.
    pub fn load_from_disk(
        root: &Path,
        database: &str,
        table: &str,
    ) -> Result<Self, TableError> {
        let path = replica_path(root, database, table);
        let empty = Self::new(database, table);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty),
            Err(e) => return Err(e.into()),
        };

        match decode_replica_blob(&bytes, database, table) {
            Ok(replica) => Ok(replica),
            Err(TableError::UnsupportedVersion { found }) => {
                error!(
                    path = %path.display(),
                    found,
                    "refusing to load table replica written by unknown format version"
                );
                Err(TableError::UnsupportedVersion { found })
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "table replica blob damaged; starting empty"
                );
                Ok(empty)
            }
        }
    }
}

struct ReplicaEntry {
    row_id: RowId,
    placement: Placement,
}

impl Encode for ReplicaEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_str(&self.row_id, out)?;
        self.placement.encode(out)
    }
}

impl Decode for ReplicaEntry {
    fn decode(r: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            row_id: r.read_string()?,
            placement: Placement::decode(r)?,
        })
    }
}

fn decode_replica_blob(bytes: &[u8], database: &str, table: &str) -> Result<TableReplica, TableError> {
    let mut r = Reader::new(bytes);
    let version = r.read_u8()?;
    if version != BLOB_VERSION {
        return Err(TableError::UnsupportedVersion { found: version });
    }
    let _stored_db = r.read_string()?;
    let _stored_table = r.read_string()?;
    let entries: Vec<ReplicaEntry> = encoding::decode_seq(&mut r)?;

    let mut replica = TableReplica::new(database, table);
    for entry in entries {
        replica.placements.insert(entry.row_id, entry.placement);
    }
    Ok(replica)
}

// ------------------------------------------------------------------------------------------------
// TableRegistry
// ------------------------------------------------------------------------------------------------

/// Shared handle to one table's row storage.
pub type SharedStorage = Arc<RwLock<TableStorage>>;

/// Shared handle to one table's placement map.
pub type SharedReplica = Arc<RwLock<TableReplica>>;

/// Process-wide owner of live [`TableStorage`] / [`TableReplica`]
/// instances, keyed by the catalog's canonical `(database, table)` names.
pub struct TableRegistry {
    data_root: PathBuf,
    storages: RwLock<BTreeMap<(String, String), SharedStorage>>,
    replicas: RwLock<BTreeMap<(String, String), SharedReplica>>,

    /// When set, every opened table gets an LSM engine at its `lsm/`
    /// directory.
    engine_config: Option<EngineConfig>,
}

impl TableRegistry {
    /// Registry rooted at the node's data directory, blob-only.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            storages: RwLock::new(BTreeMap::new()),
            replicas: RwLock::new(BTreeMap::new()),
            engine_config: None,
        }
    }

    /// Registry whose tables wrap an LSM engine.
    pub fn with_engines(data_root: impl Into<PathBuf>, engine_config: EngineConfig) -> Self {
        Self {
            data_root: data_root.into(),
            storages: RwLock::new(BTreeMap::new()),
            replicas: RwLock::new(BTreeMap::new()),
            engine_config: Some(engine_config),
        }
    }

    /// The node's data directory.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Opens (or creates) the live state for a table, loading any
    /// existing blobs from disk.
    pub fn open_table(&self, database: &str, table: &str) -> Result<(), TableError> {
        let key = (database.to_string(), table.to_string());
        let mut storage = TableStorage::load_from_disk(&self.data_root, database, table)?;
        if let Some(engine_config) = &self.engine_config {
            let engine = Engine::open(
                lsm_dir(&self.data_root, database, table),
                engine_config.clone(),
            )?;
            storage.attach_engine(engine);
        }
        let replica = TableReplica::load_from_disk(&self.data_root, database, table)?;

        self.storages
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(storage)));
        self.replicas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(replica)));
        info!(database, table, "table opened");
        Ok(())
    }

    /// Drops the live state and on-disk artifacts for a table.
    pub fn drop_table(&self, database: &str, table: &str) -> Result<(), TableError> {
        let key = (database.to_string(), table.to_string());
        let storage = self
            .storages
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&key);
        if let Some(storage) = storage {
            let mut storage = storage
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Err(e) = storage.close() {
                warn!(database, table, error = %e, "failed to close table engine");
            }
        }
        self.replicas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&key);

        let dir = table_dir(&self.data_root, database, table);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(database, table, "table dropped");
        Ok(())
    }

    /// Drops every table belonging to `database`.
    pub fn drop_database(&self, database: &str) -> Result<(), TableError> {
        let tables: Vec<String> = {
            let storages = self
                .storages
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            storages
                .keys()
                .filter(|(db, _)| db == database)
                .map(|(_, table)| table.clone())
                .collect()
        };
        for table in tables {
            self.drop_table(database, &table)?;
        }
        let db_dir = self.data_root.join(database);
        if db_dir.exists() {
            fs::remove_dir_all(&db_dir)?;
        }
        Ok(())
    }

    /// Live storage handle for a table, if open.
    pub fn storage(&self, database: &str, table: &str) -> Option<SharedStorage> {
        self.storages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(database.to_string(), table.to_string()))
            .cloned()
    }

    /// Live replica handle for a table, if open.
    pub fn replica(&self, database: &str, table: &str) -> Option<SharedReplica> {
        self.replicas
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(database.to_string(), table.to_string()))
            .cloned()
    }

    /// Snapshot of every open storage handle, for the checkpoint loop.
    pub fn all_storages(&self) -> Vec<((String, String), SharedStorage)> {
        self.storages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Snapshot of every open replica handle, for the checkpoint loop.
    pub fn all_replicas(&self) -> Vec<((String, String), SharedReplica)> {
        self.replicas
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Forgets all live state without touching disk.
    pub fn clear(&self) {
        self.storages
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.replicas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
