//! Replication records and their applier.
//!
//! Every mutation that travels between nodes is a self-describing JSON
//! record tagged by its `type` field.  [`ReplicationApplier`] is the
//! receiving end: it applies records to local state and **never**
//! re-broadcasts — broadcast belongs to the originator of a client-facing
//! mutation, which is what keeps replication storms impossible by
//! construction.
//!
//! Records arriving from the same originator are applied in arrival
//! order; there is no global order across originators.  Malformed records
//! are logged at `warn` and ignored, and the idempotent record types
//! (creates, drops, deletes, replica upserts) can be applied repeatedly
//! without changing the final state.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{CatalogError, SchemaCatalog};
use crate::diskio::CheckpointIo;
use crate::row::{Row, RowId};
use crate::table::{Placement, TableError, TableRegistry};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned while applying a replication record.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Schema mutation failed.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Table state mutation failed.
    #[error("table error: {0}")]
    Table(#[from] TableError),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// One replicated mutation (or read request), tagged by `type` on the
/// wire.  Variant and field names follow the wire protocol exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicationRecord {
    /// Create a database if absent.
    #[serde(rename = "createDatabase")]
    CreateDatabase {
        /// Database name.
        db: String,
    },

    /// Drop a database if present.
    #[serde(rename = "dropDatabase")]
    DropDatabase {
        /// Database name.
        db: String,
    },

    /// Create a table if absent.
    #[serde(rename = "createTable")]
    CreateTable {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
    },

    /// Drop a table if present.
    #[serde(rename = "dropTable")]
    DropTable {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
    },

    /// Insert a row whose id is embedded in the payload.
    #[serde(rename = "insert")]
    Insert {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Row payload (JSON object carrying `__uuid`).
        row: Value,
    },

    /// Upsert one placement entry.
    TableReplicaInsert {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Row the placement describes.
        row_id: RowId,
        /// Primary and secondary node ids.
        #[serde(flatten)]
        placement: Placement,
    },

    /// Remove one placement entry.
    TableReplicaDelete {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Row the placement described.
        row_id: RowId,
    },

    /// Insert a row under an explicit id (secondary copy path).
    ReplicateInsertObject {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Row id.
        row_id: RowId,
        /// Row payload.
        row: Value,
    },

    /// Update one field of a row identified by id.
    ReplicateUpdateObject {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Row id.
        row_id: RowId,
        /// Column the originator matched on.
        where_col: String,
        /// Value the originator matched on.
        where_val: String,
        /// Field to set.
        update_key: String,
        /// New value.
        update_val: Value,
    },

    /// Delete a row by id.
    ReplicateDeleteObject {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Row id.
        row_id: RowId,
    },

    /// Read-only select on behalf of a peer.
    SelectRespond {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Column to match.
        col: String,
        /// Value to match.
        val: String,
        /// `"*"` for whole rows, or a column name for a projection.
        #[serde(rename = "selectWhat")]
        select_what: String,
    },

    /// Stream this node's replica map for one table to the requester.
    SendTableReplicaToNode {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
        /// Requesting node's id.
        node_id: String,
        /// Requesting node's address.
        node_ip: String,
    },

    /// Drop all data on this node (test / reset path).
    DeleteEverything,
}

// ------------------------------------------------------------------------------------------------
// Replies
// ------------------------------------------------------------------------------------------------

/// Typed result of applying a record.
#[derive(Debug, PartialEq)]
pub enum ApplyReply {
    /// The mutation was applied (possibly as a no-op re-application).
    Applied,

    /// The record was understood but had nothing to act on.
    Ignored,

    /// Whole-row results of a [`ReplicationRecord::SelectRespond`].
    Rows(Vec<Value>),

    /// Projected-column results of a [`ReplicationRecord::SelectRespond`].
    Column(Vec<Value>),

    /// Replica-map contents for [`ReplicationRecord::SendTableReplicaToNode`].
    Replica(Vec<(RowId, Placement)>),
}

// ------------------------------------------------------------------------------------------------
// Applier
// ------------------------------------------------------------------------------------------------

/// Applies externally-delivered mutations to local state.
pub struct ReplicationApplier {
    catalog: Arc<SchemaCatalog>,
    registry: Arc<TableRegistry>,
    io: Arc<dyn CheckpointIo>,
}

impl ReplicationApplier {
    /// Applier over the node's catalog and table registry.
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        registry: Arc<TableRegistry>,
        io: Arc<dyn CheckpointIo>,
    ) -> Self {
        Self {
            catalog,
            registry,
            io,
        }
    }

    /// Parses and applies a raw record.
    ///
    /// Malformed payloads are logged and ignored; a peer must never be
    /// able to wedge the applier with bad bytes.
    pub fn apply_bytes(&self, bytes: &[u8]) -> Result<ApplyReply, ReplicationError> {
        match serde_json::from_slice::<ReplicationRecord>(bytes) {
            Ok(record) => self.apply(record),
            Err(e) => {
                warn!(error = %e, "ignoring malformed replication record");
                Ok(ApplyReply::Ignored)
            }
        }
    }

    /// Applies one record.  Never re-broadcasts.
    pub fn apply(&self, record: ReplicationRecord) -> Result<ApplyReply, ReplicationError> {
        match record {
            ReplicationRecord::CreateDatabase { db } => {
                if self.catalog.create_database(&db)? {
                    self.catalog.save_database_now(&db, self.io.as_ref())?;
                }
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::DropDatabase { db } => {
                self.registry.drop_database(&db)?;
                self.catalog.drop_database(&db)?;
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::CreateTable { db, table } => {
                // A peer may replicate a table for a database this node
                // has not seen yet; adopt the database first.
                if !self.catalog.database_exists(&db) {
                    self.catalog.create_database(&db)?;
                }
                if self.catalog.create_table(&db, &table)? {
                    self.registry.open_table(&db, &table)?;
                }
                self.catalog.save_database_now(&db, self.io.as_ref())?;
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::DropTable { db, table } => {
                if !self.catalog.database_exists(&db) {
                    return Ok(ApplyReply::Ignored);
                }
                self.registry.drop_table(&db, &table)?;
                if self.catalog.drop_table(&db, &table)? {
                    self.catalog.save_database_now(&db, self.io.as_ref())?;
                }
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::Insert { db, table, row } => {
                let row = Row::from_bytes(match serde_json::to_vec(&row) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "ignoring insert with unserializable row");
                        return Ok(ApplyReply::Ignored);
                    }
                });
                let Ok(row_id) = row.row_id() else {
                    warn!(%db, %table, "ignoring insert without a row id");
                    return Ok(ApplyReply::Ignored);
                };
                self.insert_row(&db, &table, row_id, row)
            }

            ReplicationRecord::ReplicateInsertObject {
                db,
                table,
                row_id,
                row,
            } => {
                let row = Row::from_bytes(match serde_json::to_vec(&row) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "ignoring replicated insert with unserializable row");
                        return Ok(ApplyReply::Ignored);
                    }
                });
                self.insert_row(&db, &table, row_id, row)
            }

            ReplicationRecord::ReplicateUpdateObject {
                db,
                table,
                row_id,
                where_col: _,
                where_val: _,
                update_key,
                update_val,
            } => {
                let Some(storage) = self.registry.storage(&db, &table) else {
                    warn!(%db, %table, "ignoring update for unknown table");
                    return Ok(ApplyReply::Ignored);
                };
                let mut storage = storage
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let Some(existing) = storage.get(&row_id) else {
                    return Ok(ApplyReply::Ignored);
                };
                let updated = match existing.with_field(&update_key, update_val) {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!(error = %e, "ignoring update on unreadable row");
                        return Ok(ApplyReply::Ignored);
                    }
                };
                storage.update(&row_id, updated)?;
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::ReplicateDeleteObject { db, table, row_id } => {
                let Some(storage) = self.registry.storage(&db, &table) else {
                    return Ok(ApplyReply::Ignored);
                };
                storage
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .delete(&row_id);
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::TableReplicaInsert {
                db,
                table,
                row_id,
                placement,
            } => {
                let Some(replica) = self.registry.replica(&db, &table) else {
                    warn!(%db, %table, "ignoring replica upsert for unknown table");
                    return Ok(ApplyReply::Ignored);
                };
                replica
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert_or_replace(row_id, placement);
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::TableReplicaDelete { db, table, row_id } => {
                let Some(replica) = self.registry.replica(&db, &table) else {
                    return Ok(ApplyReply::Ignored);
                };
                replica
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .delete(&row_id);
                Ok(ApplyReply::Applied)
            }

            ReplicationRecord::SelectRespond {
                db,
                table,
                col,
                val,
                select_what,
            } => {
                let Some(storage) = self.registry.storage(&db, &table) else {
                    return Ok(ApplyReply::Rows(Vec::new()));
                };
                let storage = storage
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let row_ids = storage.select(&col, &val);
                if select_what == "*" {
                    let rows = row_ids
                        .iter()
                        .filter_map(|id| storage.get(id))
                        .filter_map(|row| row.user_fields().ok())
                        .map(Value::Object)
                        .collect();
                    Ok(ApplyReply::Rows(rows))
                } else {
                    let column = row_ids
                        .iter()
                        .filter_map(|id| storage.get(id))
                        .filter_map(|row| row.fields().ok())
                        .filter_map(|mut fields| fields.remove(&select_what))
                        .collect();
                    Ok(ApplyReply::Column(column))
                }
            }

            ReplicationRecord::SendTableReplicaToNode {
                db,
                table,
                node_id,
                node_ip,
            } => {
                let Some(replica) = self.registry.replica(&db, &table) else {
                    return Ok(ApplyReply::Replica(Vec::new()));
                };
                let entries: Vec<(RowId, Placement)> = replica
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .entries()
                    .map(|(id, placement)| (id.clone(), placement.clone()))
                    .collect();
                info!(%db, %table, %node_id, %node_ip, entries = entries.len(),
                    "serving replica map to peer");
                Ok(ApplyReply::Replica(entries))
            }

            ReplicationRecord::DeleteEverything => {
                let databases = self.catalog.list_databases();
                for db in &databases {
                    self.registry.drop_database(db)?;
                }
                self.catalog.clear()?;
                for db in &databases {
                    let meta = self.catalog.meta_path(db);
                    if meta.exists() {
                        if let Err(e) = std::fs::remove_file(&meta) {
                            warn!(path = %meta.display(), error = %e, "failed to unlink meta file");
                        }
                    }
                }
                self.registry.clear();
                info!("deleted everything on request");
                Ok(ApplyReply::Applied)
            }
        }
    }

    fn insert_row(
        &self,
        db: &str,
        table: &str,
        row_id: RowId,
        row: Row,
    ) -> Result<ApplyReply, ReplicationError> {
        let Some(storage) = self.registry.storage(db, table) else {
            warn!(db, table, "ignoring insert for unknown table");
            return Ok(ApplyReply::Ignored);
        };
        let inserted = storage
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(row_id, row)?;
        if inserted {
            Ok(ApplyReply::Applied)
        } else {
            Ok(ApplyReply::Ignored)
        }
    }
}
