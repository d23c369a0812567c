//! Cluster collaborators: the node record and the traits the network
//! layer implements.
//!
//! The storage core does not speak HTTP.  Peer discovery, the node-to-node
//! endpoints (`GET /`, `GET /meta`, `POST /post`), and heartbeat timeouts
//! live in a network collaborator; the core consumes them through the
//! traits below, which makes every distributed code path testable with
//! in-process fakes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::replication::ReplicationRecord;
use crate::row::RowId;
use crate::table::Placement;

/// Identifier of a node in the cluster.
pub type NodeId = String;

// ------------------------------------------------------------------------------------------------
// Node record
// ------------------------------------------------------------------------------------------------

/// One known node, as exchanged over the wire and used for placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Stable node id.
    pub id: NodeId,

    /// Reachable address of the node.
    pub ip: String,

    /// Unix millis of the last successful contact.
    pub last_checked: u64,

    /// Free disk in bytes, for operator dashboards and future placement
    /// heuristics.
    #[serde(default)]
    pub disk_free_bytes: u64,

    /// Load average of the node.
    #[serde(default)]
    pub cpu_load: f64,

    /// Free memory in bytes.
    #[serde(default)]
    pub memory_free_bytes: u64,
}

impl NodeRecord {
    /// Minimal record for a node known only by id and address.
    pub fn new(id: impl Into<NodeId>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            last_checked: 0,
            disk_free_bytes: 0,
            cpu_load: 0.0,
            memory_free_bytes: 0,
        }
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.ip)
    }
}

// ------------------------------------------------------------------------------------------------
// Collaborator traits
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by network collaborators.
///
/// The core treats them as opaque transient conditions: a failed peer
/// call degrades the operation (skip, retry later, fall back to local
/// state) instead of aborting the node.
#[derive(Debug, thiserror::Error)]
#[error("peer error: {0}")]
pub struct PeerError(pub String);

/// Roster access: who is in the cluster right now.
pub trait PeerProvider: Send + Sync {
    /// This node's own record.
    fn self_node(&self) -> NodeRecord;

    /// Every currently-known peer, excluding self.
    fn peers(&self) -> Vec<NodeRecord>;

    /// Number of peers believed reachable; gates offline persistence.
    fn reachable_peer_count(&self) -> usize {
        self.peers().len()
    }
}

/// Outbound requests the core makes against one peer.
pub trait PeerClient: Send + Sync {
    /// `GET /meta` — the peer's database → tables map.
    fn fetch_meta(&self, peer: &NodeRecord) -> Result<BTreeMap<String, Vec<String>>, PeerError>;

    /// Fetch the peer's replica map for one table.
    fn fetch_table_replica(
        &self,
        peer: &NodeRecord,
        database: &str,
        table: &str,
    ) -> Result<Vec<(RowId, Placement)>, PeerError>;

    /// Fetch one row by id from the peer that owns it.
    fn fetch_row(
        &self,
        peer: &NodeRecord,
        database: &str,
        table: &str,
        row_id: &str,
    ) -> Result<Option<Vec<u8>>, PeerError>;
}

/// Delivery of replication records to one peer (`POST /post`).
pub trait ReplicaTransport: Send + Sync {
    /// Sends one record; the receiver applies it without re-broadcast.
    fn send(&self, peer: &NodeRecord, record: &ReplicationRecord) -> Result<(), PeerError>;
}

// ------------------------------------------------------------------------------------------------
// Static roster
// ------------------------------------------------------------------------------------------------

/// Fixed roster for single-node deployments and tests.
pub struct StaticRoster {
    self_node: NodeRecord,
    peers: Vec<NodeRecord>,
}

impl StaticRoster {
    /// Roster with a fixed peer list.
    pub fn new(self_node: NodeRecord, peers: Vec<NodeRecord>) -> Self {
        Self { self_node, peers }
    }

    /// Roster containing only this node.
    pub fn solo(self_node: NodeRecord) -> Self {
        Self {
            self_node,
            peers: Vec::new(),
        }
    }
}

impl PeerProvider for StaticRoster {
    fn self_node(&self) -> NodeRecord {
        self.self_node.clone()
    }

    fn peers(&self) -> Vec<NodeRecord> {
        self.peers.clone()
    }
}
