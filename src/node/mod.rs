//! Node assembly: the context struct that owns the storage core.
//!
//! A [`Node`] wires together the schema catalog, the table registry (with
//! per-table LSM engines), the placement policy, the replication applier,
//! and the persistence scheduler, against collaborator traits for the
//! network surface.  There is no module-level mutable state anywhere: the
//! builder assembles the components and the resulting `Node` owns them
//! for the process lifetime.
//!
//! ## Write path
//!
//! A client insert picks `(primary, secondary)` through the placement
//! policy.  When this node is the primary it stores the row, records the
//! placement, replicates the row to the secondary, and shares the
//! placement entry with its peers; otherwise it forwards the row to the
//! chosen primary and secondary.  Broadcasting is strictly an originator
//! concern — the applier never re-broadcasts.
//!
//! ## Startup resync
//!
//! After peer discovery, [`Node::bootstrap`] pulls each peer's schema
//! map, adopts locally-missing databases and tables, and rebuilds
//! placement metadata from the peer's replica maps.  Row data is fetched
//! lazily: a local read miss consults the replica map and asks the
//! recorded primary for the row.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{CatalogError, SchemaCatalog};
use crate::cluster::{NodeRecord, PeerClient, PeerProvider, ReplicaTransport};
use crate::config::Config;
use crate::diskio::{CheckpointIo, DiskIo};
use crate::engine::EngineConfig;
use crate::compaction::CompactionConfig;
use crate::persist::{PersistError, PersistenceScheduler, SchedulerConfig};
use crate::placement::PlacementPolicy;
use crate::replication::{ApplyReply, ReplicationApplier, ReplicationError, ReplicationRecord};
use crate::row::{Row, RowError, RowId};
use crate::table::{Placement, TableError, TableRegistry};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by node-level operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Schema operation failed.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Table state operation failed.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Replication apply failed.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Row payload could not be interpreted.
    #[error(transparent)]
    Row(#[from] RowError),

    /// Scheduler failure (critical only).
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The referenced table is not in the schema.
    #[error("unknown table {database}.{table}")]
    UnknownTable {
        /// Database name as given by the caller.
        database: String,
        /// Table name as given by the caller.
        table: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

/// Assembles a [`Node`] from configuration and collaborators.
pub struct NodeBuilder {
    config: Config,
    peers: Arc<dyn PeerProvider>,
    client: Arc<dyn PeerClient>,
    transport: Arc<dyn ReplicaTransport>,
    io: Arc<dyn CheckpointIo>,
}

impl NodeBuilder {
    /// Builder over the network collaborators.
    pub fn new(
        config: Config,
        peers: Arc<dyn PeerProvider>,
        client: Arc<dyn PeerClient>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        Self {
            config,
            peers,
            client,
            transport,
            io: Arc::new(DiskIo),
        }
    }

    /// Replaces the checkpoint I/O implementation (tests).
    pub fn checkpoint_io(mut self, io: Arc<dyn CheckpointIo>) -> Self {
        self.io = io;
        self
    }

    /// Opens all persisted state and wires the components together.
    pub fn build(self) -> Result<Node, NodeError> {
        let catalog = Arc::new(SchemaCatalog::open(&self.config.data_path)?);
        let registry = Arc::new(TableRegistry::with_engines(
            &self.config.data_path,
            EngineConfig {
                mem_table_max_bytes: self.config.mem_table_max_bytes,
                max_immutable: self.config.max_immutable_mem_tables,
                compaction: CompactionConfig {
                    l0_trigger: self.config.l0_compaction_trigger,
                    level_size_ratio: self.config.level_size_ratio,
                },
            },
        ));

        // Reopen every table the catalog knows about.
        for db in catalog.list_databases() {
            for table in catalog.list_tables(&db).unwrap_or_default() {
                registry.open_table(&db, &table)?;
            }
        }

        let applier = ReplicationApplier::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&self.io),
        );
        let scheduler = Arc::new(PersistenceScheduler::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&self.peers),
            Arc::clone(&self.io),
            SchedulerConfig {
                persist_interval: self.config.persist_interval,
                allow_offline_persist: self.config.allow_offline_persist,
            },
        ));

        Ok(Node {
            catalog,
            registry,
            applier,
            scheduler,
            placement: PlacementPolicy,
            peers: self.peers,
            client: self.client,
            transport: self.transport,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

/// One symmetric node of the cluster: the full storage core plus its
/// collaborator handles.
pub struct Node {
    catalog: Arc<SchemaCatalog>,
    registry: Arc<TableRegistry>,
    applier: ReplicationApplier,
    scheduler: Arc<PersistenceScheduler>,
    placement: PlacementPolicy,
    peers: Arc<dyn PeerProvider>,
    client: Arc<dyn PeerClient>,
    transport: Arc<dyn ReplicaTransport>,
}

impl Node {
    /// Starts the background persistence worker.
    pub fn start(&self) -> Result<(), NodeError> {
        self.scheduler.start()?;
        Ok(())
    }

    /// Stops background work; bounded wait, then abandon.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// The schema catalog.
    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// The table registry.
    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// The persistence scheduler (health, metrics, manual checkpoints).
    pub fn scheduler(&self) -> &PersistenceScheduler {
        &self.scheduler
    }

    /// Entry point for mutations delivered by peers (`POST /post`).
    pub fn apply_replicated(&self, record: ReplicationRecord) -> Result<ApplyReply, NodeError> {
        Ok(self.applier.apply(record)?)
    }

    /// Raw-bytes variant of [`Node::apply_replicated`].
    pub fn apply_replicated_bytes(&self, bytes: &[u8]) -> Result<ApplyReply, NodeError> {
        Ok(self.applier.apply_bytes(bytes)?)
    }

    // --------------------------------------------------------------------------------------------
    // Client-facing schema mutations (this node is the originator).
    // --------------------------------------------------------------------------------------------

    /// Creates a database and broadcasts the mutation.
    pub fn create_database(&self, name: &str) -> Result<bool, NodeError> {
        let created = self.catalog.create_database(name)?;
        if created {
            self.catalog.save_database_now(name, &DiskIo)?;
            self.broadcast(&ReplicationRecord::CreateDatabase {
                db: name.to_string(),
            });
        }
        Ok(created)
    }

    /// Drops a database and broadcasts the mutation.
    pub fn drop_database(&self, name: &str) -> Result<bool, NodeError> {
        self.registry.drop_database(name)?;
        let dropped = self.catalog.drop_database(name)?;
        if dropped {
            self.broadcast(&ReplicationRecord::DropDatabase {
                db: name.to_string(),
            });
        }
        Ok(dropped)
    }

    /// Creates a table and broadcasts the mutation.
    pub fn create_table(&self, database: &str, table: &str) -> Result<bool, NodeError> {
        let created = self.catalog.create_table(database, table)?;
        if created {
            self.registry.open_table(database, table)?;
            self.catalog.save_database_now(database, &DiskIo)?;
            self.broadcast(&ReplicationRecord::CreateTable {
                db: database.to_string(),
                table: table.to_string(),
            });
        }
        Ok(created)
    }

    /// Drops a table and broadcasts the mutation.
    pub fn drop_table(&self, database: &str, table: &str) -> Result<bool, NodeError> {
        self.registry.drop_table(database, table)?;
        let dropped = self.catalog.drop_table(database, table)?;
        if dropped {
            self.catalog.save_database_now(database, &DiskIo)?;
            self.broadcast(&ReplicationRecord::DropTable {
                db: database.to_string(),
                table: table.to_string(),
            });
        }
        Ok(dropped)
    }

    // --------------------------------------------------------------------------------------------
    // Client-facing row mutations.
    // --------------------------------------------------------------------------------------------

    /// Inserts a row: picks placement, stores or forwards, replicates.
    ///
    /// Returns the row id (generated unless the caller provided one).
    pub fn insert_row(
        &self,
        database: &str,
        table: &str,
        fields: Map<String, Value>,
    ) -> Result<RowId, NodeError> {
        self.require_table(database, table)?;
        let (row_id, row) = Row::with_generated_id(fields)?;

        let self_id = self.peers.self_node().id;
        let peer_list = self.peers.peers();
        let placement = self.placement.choose(&self_id, &peer_list, false);

        let row_value: Value = serde_json::from_slice(row.bytes()).map_err(RowError::from)?;

        // Each chosen holder either stores the row locally (when it is
        // this node) or receives a copy; every other node only ever sees
        // the placement entry.
        for holder in [Some(placement.primary.as_str()), placement.secondary_node()]
            .into_iter()
            .flatten()
        {
            if holder == self_id {
                let storage = self.storage_handle(database, table)?;
                storage
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(row_id.clone(), row.clone())?;
            } else {
                self.send_to(
                    holder,
                    &ReplicationRecord::ReplicateInsertObject {
                        db: database.to_string(),
                        table: table.to_string(),
                        row_id: row_id.clone(),
                        row: row_value.clone(),
                    },
                );
            }
        }
        self.record_placement(database, table, &row_id, &placement);

        // Placement entries travel to every peer so any survivor can
        // rebuild the map.
        self.broadcast(&ReplicationRecord::TableReplicaInsert {
            db: database.to_string(),
            table: table.to_string(),
            row_id: row_id.clone(),
            placement,
        });
        Ok(row_id)
    }

    /// Updates every matching row locally and replicates per placement.
    ///
    /// Returns the number of rows updated.
    pub fn update_rows(
        &self,
        database: &str,
        table: &str,
        where_col: &str,
        where_val: &str,
        update_key: &str,
        update_val: Value,
    ) -> Result<usize, NodeError> {
        self.require_table(database, table)?;
        let storage = self.storage_handle(database, table)?;

        let matches: Vec<RowId> = {
            let storage = storage
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            storage.select(where_col, where_val)
        };

        let mut updated = 0usize;
        for row_id in &matches {
            let changed = {
                let mut storage = storage
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match storage.get(row_id) {
                    Some(row) => {
                        let new_row = row.with_field(update_key, update_val.clone())?;
                        storage.update(row_id, new_row)?
                    }
                    None => false,
                }
            };
            if !changed {
                continue;
            }
            updated += 1;
            self.replicate_to_holders(
                database,
                table,
                row_id,
                &ReplicationRecord::ReplicateUpdateObject {
                    db: database.to_string(),
                    table: table.to_string(),
                    row_id: row_id.clone(),
                    where_col: where_col.to_string(),
                    where_val: where_val.to_string(),
                    update_key: update_key.to_string(),
                    update_val: update_val.clone(),
                },
            );
        }
        Ok(updated)
    }

    /// Deletes every matching row locally and replicates per placement.
    ///
    /// Returns the number of rows deleted.
    pub fn delete_rows(
        &self,
        database: &str,
        table: &str,
        where_col: &str,
        where_val: &str,
    ) -> Result<usize, NodeError> {
        self.require_table(database, table)?;
        let storage = self.storage_handle(database, table)?;

        let matches: Vec<RowId> = {
            let storage = storage
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            storage.select(where_col, where_val)
        };

        let mut deleted = 0usize;
        for row_id in &matches {
            let removed = storage
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .delete(row_id);
            if !removed {
                continue;
            }
            deleted += 1;
            self.replicate_to_holders(
                database,
                table,
                row_id,
                &ReplicationRecord::ReplicateDeleteObject {
                    db: database.to_string(),
                    table: table.to_string(),
                    row_id: row_id.clone(),
                },
            );
            if let Some(replica) = self.registry.replica(database, table) {
                replica
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .delete(row_id);
            }
            self.broadcast(&ReplicationRecord::TableReplicaDelete {
                db: database.to_string(),
                table: table.to_string(),
                row_id: row_id.clone(),
            });
        }
        Ok(deleted)
    }

    /// Local select: user-visible fields of every matching row.
    pub fn select_rows(
        &self,
        database: &str,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Map<String, Value>>, NodeError> {
        self.require_table(database, table)?;
        let storage = self.storage_handle(database, table)?;
        let storage = storage
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut rows = Vec::new();
        for row_id in storage.select(column, value) {
            if let Some(row) = storage.get(&row_id) {
                rows.push(row.user_fields()?);
            }
        }
        Ok(rows)
    }

    /// Point read by row id, fetching lazily from the recorded primary
    /// on a local miss.
    pub fn get_row(
        &self,
        database: &str,
        table: &str,
        row_id: &str,
    ) -> Result<Option<Map<String, Value>>, NodeError> {
        self.require_table(database, table)?;
        let storage = self.storage_handle(database, table)?;
        {
            let storage = storage
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(row) = storage.get(row_id) {
                return Ok(Some(row.user_fields()?));
            }
        }

        // Local miss: consult the replica map and ask the row's owner.
        let placement = self
            .registry
            .replica(database, table)
            .and_then(|replica| {
                replica
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .get(row_id)
                    .cloned()
            });
        let Some(placement) = placement else {
            return Ok(None);
        };

        let self_id = self.peers.self_node().id;
        for holder in [Some(placement.primary.as_str()), placement.secondary_node()]
            .into_iter()
            .flatten()
        {
            if holder == self_id {
                continue;
            }
            let Some(peer) = self.peer_by_id(holder) else {
                continue;
            };
            match self.client.fetch_row(&peer, database, table, row_id) {
                Ok(Some(bytes)) => {
                    let row = Row::from_bytes(bytes);
                    return Ok(Some(row.user_fields()?));
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "lazy row fetch failed");
                }
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Startup resync
    // --------------------------------------------------------------------------------------------

    /// Pulls schema and placement metadata from every peer.
    ///
    /// Peer failures are tolerated: whatever was learned before the
    /// failure is kept.
    pub fn bootstrap(&self) -> Result<(), NodeError> {
        for peer in self.peers.peers() {
            let meta = match self.client.fetch_meta(&peer) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "schema fetch failed; skipping peer");
                    continue;
                }
            };

            for (db, tables) in meta {
                if !self.catalog.database_exists(&db) {
                    self.catalog.create_database(&db)?;
                    self.catalog.save_database_now(&db, &DiskIo)?;
                }
                for table in tables {
                    if self.catalog.table_exists(&db, &table) {
                        continue;
                    }
                    self.catalog.create_table(&db, &table)?;
                    self.registry.open_table(&db, &table)?;
                    self.catalog.save_database_now(&db, &DiskIo)?;

                    match self.client.fetch_table_replica(&peer, &db, &table) {
                        Ok(entries) => {
                            if let Some(replica) = self.registry.replica(&db, &table) {
                                let mut replica = replica
                                    .write()
                                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                                for (row_id, placement) in entries {
                                    replica.insert_or_replace(row_id, placement);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                peer = %peer,
                                %db, %table, error = %e,
                                "replica fetch failed; placement stays empty until next sync"
                            );
                        }
                    }
                }
            }
        }
        info!("bootstrap resync complete");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn require_table(&self, database: &str, table: &str) -> Result<(), NodeError> {
        if !self.catalog.table_exists(database, table) {
            return Err(NodeError::UnknownTable {
                database: database.to_string(),
                table: table.to_string(),
            });
        }
        Ok(())
    }

    fn storage_handle(
        &self,
        database: &str,
        table: &str,
    ) -> Result<crate::table::SharedStorage, NodeError> {
        self.registry
            .storage(database, table)
            .ok_or_else(|| NodeError::UnknownTable {
                database: database.to_string(),
                table: table.to_string(),
            })
    }

    fn record_placement(&self, database: &str, table: &str, row_id: &str, placement: &Placement) {
        if let Some(replica) = self.registry.replica(database, table) {
            replica
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert_or_replace(row_id.to_string(), placement.clone());
        }
    }

    /// Sends a record to the row's holders (other than self).
    fn replicate_to_holders(
        &self,
        database: &str,
        table: &str,
        row_id: &str,
        record: &ReplicationRecord,
    ) {
        let placement = self.registry.replica(database, table).and_then(|replica| {
            replica
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(row_id)
                .cloned()
        });
        let Some(placement) = placement else {
            return;
        };
        let self_id = self.peers.self_node().id;
        for holder in [Some(placement.primary.as_str()), placement.secondary_node()]
            .into_iter()
            .flatten()
        {
            if holder != self_id {
                self.send_to(holder, record);
            }
        }
    }

    fn peer_by_id(&self, node_id: &str) -> Option<NodeRecord> {
        self.peers.peers().into_iter().find(|p| p.id == node_id)
    }

    /// Best-effort delivery to one peer by id.
    fn send_to(&self, node_id: &str, record: &ReplicationRecord) {
        let Some(peer) = self.peer_by_id(node_id) else {
            warn!(node_id, "replication target is not in the roster");
            return;
        };
        if let Err(e) = self.transport.send(&peer, record) {
            warn!(peer = %peer, error = %e, "replication send failed");
        }
    }

    /// Best-effort delivery to every peer.
    fn broadcast(&self, record: &ReplicationRecord) {
        for peer in self.peers.peers() {
            if let Err(e) = self.transport.send(&peer, record) {
                warn!(peer = %peer, error = %e, "broadcast send failed");
            }
        }
    }
}
