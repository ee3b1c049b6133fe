//! Persisted routing state, so a restarted node re-enters the network with
//! its previous id and a set of known-recent contacts instead of from
//! scratch.

use crate::{compact, id::NodeId, routing::node::NodeHandle};
use serde::{Deserialize, Serialize};
use std::{io, path::Path};
use tokio::fs;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: NodeId,

    #[serde(
        rename = "nodes",
        with = "compact::nodes_v4",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes_v4: Vec<NodeHandle>,

    #[serde(
        rename = "nodes6",
        with = "compact::nodes_v6",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes_v6: Vec<NodeHandle>,
}

impl Snapshot {
    pub fn new(id: NodeId, nodes: &[NodeHandle]) -> Self {
        let (nodes_v4, nodes_v6) = compact::split_by_family(nodes);
        Self {
            id,
            nodes_v4,
            nodes_v6,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes_v4.iter().chain(self.nodes_v6.iter())
    }

    /// Load a snapshot. A missing or unreadable or corrupt file yields
    /// `None`: failure to restore previous state is always recoverable by
    /// starting fresh.
    pub async fn load(path: &Path) -> Option<Self> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != io::ErrorKind::NotFound {
                    log::warn!("failed to read state file {path:?}: {error}");
                }
                return None;
            }
        };

        match serde_bencode::from_bytes(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                log::warn!("discarding corrupt state file {path:?}: {error}");
                None
            }
        }
    }

    /// Save the snapshot, atomically replacing any previous one.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_bencode::to_bytes(self)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

        // Write to a sibling file first so a crash mid-write cannot corrupt
        // the previous snapshot.
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &content).await?;
        fs::rename(&tmp_path, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[tokio::test]
    async fn positive_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.state");

        let nodes: Vec<_> = test::dummy_block_node_ids(4)
            .into_iter()
            .zip(test::dummy_block_socket_addrs(4))
            .map(|(id, addr)| NodeHandle::new(id, addr))
            .collect();
        let snapshot = Snapshot::new(test::dummy_node_id(), &nodes);

        snapshot.save(&path).await.unwrap();

        assert_eq!(Snapshot::load(&path).await, Some(snapshot));
    }

    #[tokio::test]
    async fn negative_missing_file_recoverable() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(Snapshot::load(&dir.path().join("nonexistent")).await, None);
    }

    #[tokio::test]
    async fn negative_corrupt_file_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.state");

        tokio::fs::write(&path, b"definitely not bencode")
            .await
            .unwrap();

        assert_eq!(Snapshot::load(&path).await, None);
    }

    #[tokio::test]
    async fn positive_mixed_families_split() {
        let snapshot = Snapshot::new(
            test::dummy_node_id(),
            &[
                NodeHandle::new(test::dummy_block_node_ids(2)[0], test::dummy_socket_addr_v4()),
                NodeHandle::new(test::dummy_block_node_ids(2)[1], test::dummy_socket_addr_v6()),
            ],
        );

        assert_eq!(snapshot.nodes_v4.len(), 1);
        assert_eq!(snapshot.nodes_v6.len(), 1);
    }
}
