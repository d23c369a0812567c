//! In-process cluster fakes for node tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::cluster::{
    NodeRecord, PeerClient, PeerError, ReplicaTransport, StaticRoster,
};
use crate::config::Config;
use crate::node::{Node, NodeBuilder};
use crate::replication::ReplicationRecord;
use crate::row::RowId;
use crate::table::Placement;

/// Transport that records every send instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, ReplicationRecord)>>,
}

impl ReplicaTransport for RecordingTransport {
    fn send(&self, peer: &NodeRecord, record: &ReplicationRecord) -> Result<(), PeerError> {
        self.sent
            .lock()
            .unwrap()
            .push((peer.id.clone(), record.clone()));
        Ok(())
    }
}

impl RecordingTransport {
    pub fn sent_to(&self, node_id: &str) -> Vec<ReplicationRecord> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

/// Peer client answering from canned data.
#[derive(Default)]
pub struct CannedClient {
    pub meta: BTreeMap<String, Vec<String>>,
    pub replicas: BTreeMap<(String, String), Vec<(RowId, Placement)>>,
    pub rows: BTreeMap<(String, String, String), Vec<u8>>,
}

impl PeerClient for CannedClient {
    fn fetch_meta(&self, _peer: &NodeRecord) -> Result<BTreeMap<String, Vec<String>>, PeerError> {
        Ok(self.meta.clone())
    }

    fn fetch_table_replica(
        &self,
        _peer: &NodeRecord,
        database: &str,
        table: &str,
    ) -> Result<Vec<(RowId, Placement)>, PeerError> {
        Ok(self
            .replicas
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_row(
        &self,
        _peer: &NodeRecord,
        database: &str,
        table: &str,
        row_id: &str,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        Ok(self
            .rows
            .get(&(
                database.to_string(),
                table.to_string(),
                row_id.to_string(),
            ))
            .cloned())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Node "self" with the given peers, a recording transport, and a canned
/// client.
pub fn build_node(
    tmp: &TempDir,
    peers: Vec<NodeRecord>,
    client: Arc<CannedClient>,
) -> (Node, Arc<RecordingTransport>) {
    init_tracing();
    let transport = Arc::new(RecordingTransport::default());
    let config = Config {
        data_path: tmp.path().to_path_buf(),
        allow_offline_persist: true,
        ..Config::default()
    };
    let node = NodeBuilder::new(
        config,
        Arc::new(StaticRoster::new(NodeRecord::new("self", "10.0.0.1"), peers)),
        client,
        Arc::clone(&transport) as Arc<dyn ReplicaTransport>,
    )
    .build()
    .unwrap();
    (node, transport)
}
