//! Schema catalog: the process-wide `database → tables` mapping.
//!
//! Names are case-preserving but case-insensitive for lookup, and a table
//! name appears at most once per database.  Every mutation updates the
//! in-memory catalog and marks the database dirty so the next checkpoint
//! rewrites its meta file; the replication path persists immediately
//! instead.
//!
//! One meta file per database lives at `<data_root>/<db>.meta`: a
//! versioned, length-prefixed blob.  A reader that sees an unknown
//! version byte refuses to load it and logs at `error` — that file
//! belongs to a newer build and must never be silently discarded.  Other
//! damage (truncation, torn bytes) is tolerated: the file is skipped with
//! a `warn` and the schema is expected to return via peer resync.
//!
//! Concurrency: a single writer lock guards the catalog; enumerations
//! copy out so readers never hold the lock across I/O.


use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::diskio::CheckpointIo;
use crate::encoding::{self, Decode, Encode, EncodingError, Reader};

/// Format version stamped on meta files.
const META_VERSION: u8 = 1;

/// Meta file extension.
pub const META_EXTENSION: &str = "meta";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Empty database or table name.
    #[error("invalid name: empty")]
    InvalidName,

    /// The named database does not exist.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// A meta file was written by an unknown format version.
    #[error("unsupported meta version {found} (supported: {META_VERSION})")]
    UnsupportedVersion {
        /// Version byte found in the file.
        found: u8,
    },

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned")]
    LockPoisoned,
}

// ------------------------------------------------------------------------------------------------
// DatabaseObject
// ------------------------------------------------------------------------------------------------

/// One database: its canonical name and ordered table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseObject {
    /// Name as first created (case preserved).
    pub name: String,

    /// Table names in creation order (case preserved).
    pub tables: Vec<String>,
}

impl DatabaseObject {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    fn has_table(&self, table: &str) -> bool {
        self.tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }

    /// Canonical (stored) form of a table name, if present.
    pub fn canonical_table(&self, table: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(table))
            .map(String::as_str)
    }
}

impl Encode for DatabaseObject {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_str(&self.name, out)?;
        encoding::encode_slice(&self.tables, out)
    }
}

impl Decode for DatabaseObject {
    fn decode(r: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            name: r.read_string()?,
            tables: encoding::decode_seq(r)?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// SchemaCatalog
// ------------------------------------------------------------------------------------------------

/// Process-wide schema state, persisted one meta file per database.
pub struct SchemaCatalog {
    data_root: PathBuf,

    /// Lowercased name → database object.
    databases: RwLock<BTreeMap<String, DatabaseObject>>,

    /// Lowercased names whose meta file needs rewriting.
    dirty: Mutex<BTreeSet<String>>,
}

impl SchemaCatalog {
    /// Opens the catalog, loading every readable meta file under
    /// `data_root`.
    pub fn open(data_root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let data_root = data_root.into();
        fs::create_dir_all(&data_root)?;

        let mut databases = BTreeMap::new();
        for entry in fs::read_dir(&data_root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            match load_meta_file(&path) {
                Ok(db) => {
                    databases.insert(db.name.to_lowercase(), db);
                }
                Err(CatalogError::UnsupportedVersion { found }) => {
                    error!(
                        path = %path.display(),
                        found,
                        "refusing to load meta file written by unknown format version"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping damaged meta file");
                }
            }
        }
        info!(databases = databases.len(), "schema catalog opened");

        Ok(Self {
            data_root,
            databases: RwLock::new(databases),
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    /// Creates a database.  Returns `Ok(false)` when it already exists.
    pub fn create_database(&self, name: &str) -> Result<bool, CatalogError> {
        if name.is_empty() {
            return Err(CatalogError::InvalidName);
        }
        let key = name.to_lowercase();
        let mut databases = self
            .databases
            .write()
            .map_err(|_| CatalogError::LockPoisoned)?;
        if databases.contains_key(&key) {
            return Ok(false);
        }
        databases.insert(key.clone(), DatabaseObject::new(name));
        drop(databases);
        self.mark_dirty(&key)?;
        info!(database = name, "database created");
        Ok(true)
    }

    /// Drops a database and unlinks its meta file.  Returns `Ok(false)`
    /// when it did not exist.
    pub fn drop_database(&self, name: &str) -> Result<bool, CatalogError> {
        let key = name.to_lowercase();
        let removed = {
            let mut databases = self
                .databases
                .write()
                .map_err(|_| CatalogError::LockPoisoned)?;
            databases.remove(&key)
        };
        let Some(removed) = removed else {
            return Ok(false);
        };
        self.dirty
            .lock()
            .map_err(|_| CatalogError::LockPoisoned)?
            .remove(&key);

        let path = self.meta_path(&removed.name);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to unlink meta file");
            }
        }
        info!(database = %removed.name, "database dropped");
        Ok(true)
    }

    /// Adds a table to a database.  Returns `Ok(false)` when the table
    /// already exists; fails when the database does not.
    pub fn create_table(&self, database: &str, table: &str) -> Result<bool, CatalogError> {
        if table.is_empty() {
            return Err(CatalogError::InvalidName);
        }
        let key = database.to_lowercase();
        {
            let mut databases = self
                .databases
                .write()
                .map_err(|_| CatalogError::LockPoisoned)?;
            let db = databases
                .get_mut(&key)
                .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
            if db.has_table(table) {
                return Ok(false);
            }
            db.tables.push(table.to_string());
        }
        self.mark_dirty(&key)?;
        info!(database, table, "table created");
        Ok(true)
    }

    /// Removes a table from a database.  Returns `Ok(false)` when absent.
    pub fn drop_table(&self, database: &str, table: &str) -> Result<bool, CatalogError> {
        let key = database.to_lowercase();
        let removed = {
            let mut databases = self
                .databases
                .write()
                .map_err(|_| CatalogError::LockPoisoned)?;
            let db = databases
                .get_mut(&key)
                .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
            let before = db.tables.len();
            db.tables.retain(|t| !t.eq_ignore_ascii_case(table));
            db.tables.len() != before
        };
        if removed {
            self.mark_dirty(&key)?;
            info!(database, table, "table dropped");
        }
        Ok(removed)
    }

    /// True when the database exists (case-insensitive).
    pub fn database_exists(&self, name: &str) -> bool {
        self.databases
            .read()
            .map(|dbs| dbs.contains_key(&name.to_lowercase()))
            .unwrap_or(false)
    }

    /// True when the table exists in the database (case-insensitive).
    pub fn table_exists(&self, database: &str, table: &str) -> bool {
        self.databases
            .read()
            .map(|dbs| {
                dbs.get(&database.to_lowercase())
                    .is_some_and(|db| db.has_table(table))
            })
            .unwrap_or(false)
    }

    /// Canonical names of all databases.
    pub fn list_databases(&self) -> Vec<String> {
        self.databases
            .read()
            .map(|dbs| dbs.values().map(|db| db.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Canonical table names of one database, or `None` when it does not
    /// exist.
    pub fn list_tables(&self, database: &str) -> Option<Vec<String>> {
        self.databases
            .read()
            .ok()?
            .get(&database.to_lowercase())
            .map(|db| db.tables.clone())
    }

    /// Copy of one database object.
    pub fn database(&self, name: &str) -> Option<DatabaseObject> {
        self.databases
            .read()
            .ok()?
            .get(&name.to_lowercase())
            .cloned()
    }

    /// The full schema map, canonical names, for `/meta`-style exchange.
    pub fn schema_map(&self) -> BTreeMap<String, Vec<String>> {
        self.databases
            .read()
            .map(|dbs| {
                dbs.values()
                    .map(|db| (db.name.clone(), db.tables.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Meta file path for a database (canonical name).
    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.data_root.join(format!("{name}.{META_EXTENSION}"))
    }

    /// Databases whose meta file is stale, as (canonical name, path,
    /// encoded bytes) tuples ready to write.
    pub fn dirty_metas(&self) -> Result<Vec<(String, PathBuf, Vec<u8>)>, CatalogError> {
        let dirty: Vec<String> = {
            let dirty = self.dirty.lock().map_err(|_| CatalogError::LockPoisoned)?;
            dirty.iter().cloned().collect()
        };
        let databases = self
            .databases
            .read()
            .map_err(|_| CatalogError::LockPoisoned)?;
        let mut out = Vec::new();
        for key in dirty {
            if let Some(db) = databases.get(&key) {
                out.push((db.name.clone(), self.meta_path(&db.name), encode_meta(db)?));
            }
        }
        Ok(out)
    }

    /// Clears a database's dirty mark after a successful meta write.
    pub fn mark_clean(&self, name: &str) -> Result<(), CatalogError> {
        self.dirty
            .lock()
            .map_err(|_| CatalogError::LockPoisoned)?
            .remove(&name.to_lowercase());
        Ok(())
    }

    /// Persists one database's meta file right now (replication path).
    pub fn save_database_now(
        &self,
        name: &str,
        io: &dyn CheckpointIo,
    ) -> Result<(), CatalogError> {
        let Some(db) = self.database(name) else {
            return Err(CatalogError::DatabaseNotFound(name.to_string()));
        };
        io.write_atomic(&self.meta_path(&db.name), &encode_meta(&db)?)?;
        self.mark_clean(name)?;
        Ok(())
    }

    /// Forgets every database (in-memory only).
    pub fn clear(&self) -> Result<(), CatalogError> {
        self.databases
            .write()
            .map_err(|_| CatalogError::LockPoisoned)?
            .clear();
        self.dirty
            .lock()
            .map_err(|_| CatalogError::LockPoisoned)?
            .clear();
        Ok(())
    }

    fn mark_dirty(&self, key: &str) -> Result<(), CatalogError> {
        self.dirty
            .lock()
            .map_err(|_| CatalogError::LockPoisoned)?
            .insert(key.to_string());
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Meta file format
// ------------------------------------------------------------------------------------------------

fn encode_meta(db: &DatabaseObject) -> Result<Vec<u8>, CatalogError> {
    let mut buf = vec![META_VERSION];
    db.encode(&mut buf)?;
    Ok(buf)
}

fn load_meta_file(path: &Path) -> Result<DatabaseObject, CatalogError> {
    let bytes = fs::read(path)?;
    let mut r = Reader::new(&bytes);
    let version = r.read_u8()?;
    if version != META_VERSION {
        return Err(CatalogError::UnsupportedVersion { found: version });
    }
    Ok(DatabaseObject::decode(&mut r)?)
}
