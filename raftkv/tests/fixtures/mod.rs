//! Fixtures for testing the replicated store.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use memkv::MemKv;
use raftkv::async_trait::async_trait;
use raftkv::error::CommitError;
use raftkv::message::Message;
use raftkv::message::RaftTransport;
use raftkv::metrics::Wait;
use raftkv::Config;
use raftkv::Consistency;
use raftkv::NodeId;
use raftkv::RaftKv;
use raftkv::RaftMetrics;
use raftkv::RoleKind;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete node type used during testing.
pub type MemRaft = RaftKv<MemKv, RaftRouter>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// The network address a node's identity maps to.
pub fn address_of(id: &str) -> String {
    format!("addr:{}", id)
}

fn identity_of(address: &str) -> Option<NodeId> {
    address.strip_prefix("addr:").map(|id| id.to_string())
}

struct NodeHandle {
    raft: MemRaft,
    store: Arc<MemKv>,
    _dir: tempfile::TempDir,
}

/// A type which emulates a network transport and implements the
/// `RaftTransport` trait.
pub struct RaftRouter {
    /// The runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, NodeHandle>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: &str) {
        let dir = tempfile::tempdir().expect("temp dir for log store");
        let store = Arc::new(MemKv::new());
        let raft = RaftKv::spawn(
            id.to_string(),
            dir.path(),
            self.config.clone(),
            store.clone(),
            self.clone(),
        )
        .expect("spawning raft node");
        let mut rt = self.routing_table.write().await;
        rt.insert(
            id.to_string(),
            NodeHandle {
                raft,
                store,
                _dir: dir,
            },
        );
    }

    /// Build a cluster: `leader` is initialized as a single-node cluster and
    /// every other member is added through a config change.
    pub async fn build_cluster(self: &Arc<Self>, leader: &str, others: &[&str]) -> Result<()> {
        self.new_raft_node(leader).await;
        self.node(leader).await?.initialize(address_of(leader)).await?;
        self.wait(leader, None).await?.role(RoleKind::Leader, "init leader").await?;

        for id in others {
            self.new_raft_node(id).await;
            self.node(leader)
                .await?
                .config_change(id.to_string(), Some(address_of(id)))
                .await
                .map_err(|err| anyhow!("adding {}: {}", id, err))?;
        }

        let mut members: Vec<NodeId> = others.iter().map(|id| id.to_string()).collect();
        members.push(leader.to_string());
        members.sort();
        let mut all: Vec<&str> = others.to_vec();
        all.push(leader);
        for id in all {
            self.wait(id, Some(Duration::from_secs(5)))
                .await?
                .members(members.clone(), "cluster formed")
                .await?;
        }
        Ok(())
    }

    /// Shut a node down and start it again over the same log directory and
    /// state machine.
    pub async fn restart_node(self: &Arc<Self>, id: &str) -> Result<()> {
        let handle = {
            let mut rt = self.routing_table.write().await;
            rt.remove(id).with_context(|| format!("node {} not found in routing table", id))?
        };
        handle.raft.shutdown().await?;

        let raft = RaftKv::spawn(
            id.to_string(),
            handle._dir.path(),
            self.config.clone(),
            handle.store.clone(),
            self.clone(),
        )?;
        let mut rt = self.routing_table.write().await;
        rt.insert(
            id.to_string(),
            NodeHandle {
                raft,
                store: handle.store,
                _dir: handle._dir,
            },
        );
        Ok(())
    }

    pub async fn node(&self, id: &str) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let handle = rt.get(id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(handle.raft.clone())
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, id: &str) -> Result<Arc<MemKv>> {
        let rt = self.routing_table.read().await;
        let handle = rt.get(id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(handle.store.clone())
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: &str) {
        tracing::info!(id, "isolating node");
        self.isolated_nodes.write().await.insert(id.to_string());
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: &str) {
        tracing::info!(id, "restoring node");
        self.isolated_nodes.write().await.remove(id);
    }

    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<Wait> {
        let node = self.node(id).await?;
        Ok(node.wait(timeout.or(Some(Duration::from_secs(5)))))
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|handle| handle.raft.status()).collect()
    }

    /// The ID of the current non-isolated leader, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.role == RoleKind::Leader && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    /// Wait for every listed node to observe the same non-isolated leader.
    pub async fn wait_for_leader(&self, ids: &[&str], msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(leader) = self.leader().await {
                let mut agreed = true;
                for id in ids {
                    if self.node(id).await?.current_leader().as_ref() != Some(&leader) {
                        agreed = false;
                        break;
                    }
                }
                if agreed {
                    return Ok(leader);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timed out waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for the listed nodes to have applied at least `want` entries.
    pub async fn wait_for_log(&self, ids: &[&str], want: u64, msg: &str) -> Result<()> {
        for id in ids {
            self.wait(id, Some(Duration::from_secs(5))).await?.log(want, msg).await?;
        }
        Ok(())
    }

    /// Commit a put through a transaction on the given node.
    pub async fn put(&self, id: &str, key: &[u8], value: &[u8]) -> Result<(), CommitError> {
        let node = self.node(id).await.map_err(|e| CommitError::Invalid(e.to_string()))?;
        let tx = node.create_transaction(Consistency::Linearizable).await?;
        tx.put(key.to_vec(), value.to_vec())?;
        tx.commit().await
    }

    /// Read a key through a transaction on the given node.
    pub async fn get(&self, id: &str, key: &[u8], consistency: Consistency) -> Result<Option<Vec<u8>>, CommitError> {
        let node = self.node(id).await.map_err(|e| CommitError::Invalid(e.to_string()))?;
        let tx = node.create_transaction(consistency).await?;
        let value = tx.get(key)?;
        tx.set_read_only(true)?;
        tx.commit().await?;
        Ok(value)
    }

    /// Assert that every listed node's state machine holds identical
    /// contents.
    pub async fn assert_same_store_contents(&self, ids: &[&str]) {
        let mut dumps = Vec::new();
        for id in ids {
            let store = self.get_storage_handle(id).await.expect("storage handle");
            dumps.push((id.to_string(), store.dump().await));
        }
        let (first_id, first) = &dumps[0];
        for (id, dump) in &dumps[1..] {
            assert_eq!(
                dump, first,
                "store contents of {} diverge from {}",
                id, first_id
            );
        }
    }
}

#[async_trait]
impl RaftTransport for RaftRouter {
    async fn send(&self, address: &str, msg: Message) -> Result<()> {
        let target = identity_of(address).ok_or_else(|| anyhow!("unroutable address {}", address))?;
        let sender = msg.header().sender_id.clone();

        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&sender) {
            return Err(anyhow!("node is isolated"));
        }
        drop(isolated);

        // Round-trip through the wire format, as a real transport would.
        let bytes = msg.to_bytes();
        let msg = Message::from_bytes(&bytes).expect("wire format round-trip");

        let rt = self.routing_table.read().await;
        let handle = rt.get(&target).ok_or_else(|| anyhow!("unknown node {}", target))?;
        handle.raft.submit_message(msg, address_of(&sender));
        Ok(())
    }
}
