//! Node assembly and the replicated store.
//!
//! Builds the Raft instance from the static peer list, serves the peer RPC
//! listener, and exposes the node as a [`wag_store::Store`]: writes go
//! through consensus (forwarded to the leader when needed), reads and
//! watches come from the local engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::InitializeError;
use openraft::error::RaftError;
use openraft::BasicNode;
use openraft::Config;
use openraft::Raft;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use wag_core::ClusteringConfig;
use wag_store::Command;
use wag_store::CommandOutcome;
use wag_store::MvccEngine;
use wag_store::SortOrder;
use wag_store::Store;
use wag_store::StoreEntry;
use wag_store::StoreError;
use wag_store::Txn;
use wag_store::TxnOutcome;
use wag_store::WatchStream;

use crate::health::publish_status;
use crate::health::ClusterStatus;
use crate::log_store::LogStore;
use crate::network::forward_client_write;
use crate::network::serve_peer_rpc;
use crate::network::NetworkFactory;
use crate::state_machine::StateMachine;
use crate::NodeId;
use crate::TypeConfig;

/// How long a starting node waits for the cluster to elect a leader.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Deterministic node-id assignment from the static member list.
///
/// Every node derives the same mapping from the same config: ids are the
/// 1-based rank of the node name in the sorted list of all member names.
#[derive(Debug, Clone)]
pub struct NodeAddresses {
    members: BTreeMap<NodeId, (String, BasicNode)>,
    self_id: NodeId,
}

impl NodeAddresses {
    pub fn from_config(clustering: &ClusteringConfig) -> Self {
        let mut names: Vec<(String, String)> = clustering
            .peers
            .iter()
            .map(|(name, addr)| (name.clone(), addr.clone()))
            .collect();
        names.push((clustering.name.clone(), clustering.listen_address.clone()));
        names.sort();

        let mut members = BTreeMap::new();
        let mut self_id = 0;
        for (index, (name, addr)) in names.into_iter().enumerate() {
            let id = index as NodeId + 1;
            if name == clustering.name {
                self_id = id;
            }
            members.insert(id, (name, BasicNode { addr }));
        }

        Self { members, self_id }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn addr_of(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(|(_, node)| node.addr.as_str())
    }

    fn initial_members(&self) -> BTreeMap<NodeId, BasicNode> {
        self.members.iter().map(|(id, (_, node))| (*id, node.clone())).collect()
    }
}

/// A running consensus node.
pub struct RaftNode {
    id: NodeId,
    raft: Raft<TypeConfig>,
    engine: Arc<MvccEngine>,
    addresses: NodeAddresses,
    status_rx: watch::Receiver<ClusterStatus>,
}

impl RaftNode {
    /// Start the node: bind the peer listener, boot Raft, and bootstrap
    /// membership from the static peer list.
    ///
    /// Every node calls `initialize` with the identical member set; on all
    /// but the first boot this is rejected and ignored.
    pub async fn start(
        clustering: &ClusteringConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, StoreError> {
        let addresses = NodeAddresses::from_config(clustering);
        let id = addresses.self_id();

        let store_dir = clustering.store_dir();
        std::fs::create_dir_all(&store_dir).map_err(|err| StoreError::Unavailable {
            reason: format!("unable to create store directory {}: {err}", store_dir.display()),
        })?;

        let engine = Arc::new(MvccEngine::new());
        let state_machine = StateMachine::new(engine.clone(), Some(&store_dir));
        let log_store = LogStore::new(Some(&store_dir));
        if let Some(baseline) = state_machine.restored_log_id() {
            // The log is volatile; the restored snapshot is its baseline.
            log_store.set_purged_baseline(baseline);
        }

        let config = Config {
            cluster_name: "wag".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            ..Default::default()
        }
        .validate()
        .map_err(|err| StoreError::Internal {
            reason: format!("invalid raft config: {err}"),
        })?;

        let raft = Raft::new(id, Arc::new(config), NetworkFactory, log_store, state_machine)
            .await
            .map_err(|err| StoreError::Internal {
                reason: format!("unable to start raft: {err}"),
            })?;

        let listener = TcpListener::bind(&clustering.listen_address)
            .await
            .map_err(|err| StoreError::Unavailable {
                reason: format!("unable to bind {}: {err}", clustering.listen_address),
            })?;
        tokio::spawn(serve_peer_rpc(listener, raft.clone(), shutdown_rx.clone()));

        match raft.initialize(addresses.initial_members()).await {
            Ok(()) => info!(node = id, "cluster membership initialised"),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                // Already initialised on a previous boot.
            }
            Err(err) => {
                return Err(StoreError::Unavailable {
                    reason: format!("cluster initialisation failed: {err}"),
                });
            }
        }

        let status_rx = publish_status(raft.metrics(), shutdown_rx);

        Ok(Arc::new(Self {
            id,
            raft,
            engine,
            addresses,
            status_rx,
        }))
    }

    /// Wait for the cluster to become able to serve writes.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), StoreError> {
        let mut metrics = self.raft.metrics();
        let wait = async {
            loop {
                if metrics.borrow().current_leader.is_some() {
                    return;
                }
                if metrics.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StoreError::Unavailable {
                reason: "store took too long to start".to_string(),
            })?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Cluster status channel consumed by the health monitor.
    pub fn status_channel(&self) -> watch::Receiver<ClusterStatus> {
        self.status_rx.clone()
    }

    /// The store view of this node.
    pub fn store(self: &Arc<Self>) -> Arc<RaftStore> {
        Arc::new(RaftStore { node: self.clone() })
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.raft.shutdown().await {
            warn!(error = %err, "raft shutdown reported an error");
        }
    }

    async fn write(&self, command: Command) -> Result<CommandOutcome, StoreError> {
        match self.raft.client_write(command.clone()).await {
            Ok(response) => Ok(response.data),
            Err(err) => {
                let Some(forward) = err.forward_to_leader() else {
                    return Err(StoreError::Unavailable {
                        reason: err.to_string(),
                    });
                };
                let leader = forward.leader_id;
                // The hint usually carries the leader's address; fall back
                // to the static peer map when it does not.
                let leader_addr = forward
                    .leader_node
                    .as_ref()
                    .map(|node| node.addr.clone())
                    .or_else(|| leader.and_then(|id| self.addresses.addr_of(id).map(str::to_string)));
                let Some(leader_addr) = leader_addr else {
                    return Err(StoreError::NotLeader {
                        leader,
                        reason: "leader unknown".to_string(),
                    });
                };

                match forward_client_write(&leader_addr, command).await {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(remote)) => Err(StoreError::NotLeader {
                        leader,
                        reason: format!("leader rejected forwarded write: {remote}"),
                    }),
                    Err(err) => Err(StoreError::Unavailable {
                        reason: format!("unable to reach leader: {err}"),
                    }),
                }
            }
        }
    }
}

/// [`Store`] served by a consensus node.
pub struct RaftStore {
    node: Arc<RaftNode>,
}

#[async_trait]
impl Store for RaftStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        Ok(self.node.engine.get(key))
    }

    async fn list(&self, prefix: &str, order: SortOrder) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self.node.engine.list(prefix, order))
    }

    async fn put(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let outcome = self
            .node
            .write(Command::Put {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(outcome.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let outcome = self.node.write(Command::Delete { key: key.to_string() }).await?;
        Ok(outcome.deleted)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let outcome = self
            .node
            .write(Command::DeletePrefix {
                prefix: prefix.to_string(),
            })
            .await?;
        Ok(outcome.prev_entries)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnOutcome, StoreError> {
        let outcome = self.node.write(Command::Txn(txn)).await?;
        Ok(outcome.txn.unwrap_or_default())
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        self.node.engine.subscribe(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustering(name: &str, peers: &[(&str, &str)]) -> ClusteringConfig {
        ClusteringConfig {
            name: name.to_string(),
            listen_address: "127.0.0.1:4780".to_string(),
            peers: peers.iter().map(|(n, a)| (n.to_string(), a.to_string())).collect(),
            database_location: std::path::PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn node_ids_are_rank_of_sorted_names() {
        let addresses = NodeAddresses::from_config(&clustering(
            "beta",
            &[("alpha", "127.0.0.1:1"), ("gamma", "127.0.0.1:3")],
        ));
        // Sorted: alpha=1, beta=2, gamma=3.
        assert_eq!(addresses.self_id(), 2);
        assert_eq!(addresses.addr_of(1), Some("127.0.0.1:1"));
        assert_eq!(addresses.addr_of(2), Some("127.0.0.1:4780"));
        assert_eq!(addresses.addr_of(3), Some("127.0.0.1:3"));
    }

    #[test]
    fn every_node_derives_the_same_mapping() {
        let from_beta = NodeAddresses::from_config(&clustering("beta", &[("alpha", "127.0.0.1:1")]));
        let from_alpha = NodeAddresses::from_config(&ClusteringConfig {
            name: "alpha".to_string(),
            listen_address: "127.0.0.1:1".to_string(),
            peers: [("beta".to_string(), "127.0.0.1:4780".to_string())].into_iter().collect(),
            database_location: std::path::PathBuf::from("/tmp"),
        });
        assert_eq!(from_beta.initial_members(), from_alpha.initial_members());
        assert_eq!(from_alpha.self_id(), 1);
        assert_eq!(from_beta.self_id(), 2);
    }
}
