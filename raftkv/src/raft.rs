//! Public interface to a running Raft node.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::CommitError;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::message::Message;
use crate::message::RaftTransport;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::txn::Consistency;
use crate::txn::Transaction;
use crate::txn::TxShared;
use crate::watch::WatchToken;
use crate::NodeId;

/// A message into the node core.
pub(crate) enum RaftMsg<A: AtomicKvStore> {
    /// A wire message delivered by the transport, with the address it came
    /// from.
    Incoming { msg: Message, sender_address: String },
    OpenTx {
        consistency: Consistency,
        resp: oneshot::Sender<Result<Arc<TxShared<A::Snapshot>>, CommitError>>,
    },
    CommitTx {
        tx_id: u64,
        resp: oneshot::Sender<Result<(), CommitError>>,
    },
    RollbackTx {
        tx_id: u64,
    },
    SetHighPriority {
        tx_id: u64,
        high_priority: bool,
    },
    WatchKey {
        key: Vec<u8>,
        resp: oneshot::Sender<WatchToken>,
    },
    Initialize {
        address: String,
        resp: oneshot::Sender<Result<(), CommitError>>,
    },
    StepDown {
        resp: oneshot::Sender<Result<(), CommitError>>,
    },
    StartElection {
        resp: oneshot::Sender<Result<(), CommitError>>,
    },
}

struct RaftKvInner<A: AtomicKvStore, T: RaftTransport> {
    id: NodeId,
    tx_api: mpsc::UnboundedSender<RaftMsg<A>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_t: std::marker::PhantomData<T>,
}

/// A replicated, transactional key/value store node.
///
/// This type spawns and wraps the node's core task. It is cheap to clone;
/// all clones refer to the same node.
///
/// A pristine node belongs to no cluster and passively waits to be adopted
/// by one. Call [`RaftKv::initialize`] on exactly one node to form a new
/// single-node cluster, then grow it with [`RaftKv::config_change`].
pub struct RaftKv<A: AtomicKvStore, T: RaftTransport> {
    inner: Arc<RaftKvInner<A, T>>,
}

impl<A: AtomicKvStore, T: RaftTransport> Clone for RaftKv<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: AtomicKvStore, T: RaftTransport> RaftKv<A, T> {
    /// Open the log store in `dir` and spawn the node core.
    #[tracing::instrument(level="debug", skip(config, store, transport), fields(cluster=%config.cluster_name))]
    pub fn spawn(
        id: NodeId,
        dir: &Path,
        config: Arc<Config>,
        store: Arc<A>,
        transport: Arc<T>,
    ) -> RaftResult<Self> {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(
            id.clone(),
            dir,
            config,
            store,
            transport,
            rx_api,
            tx_metrics,
            rx_shutdown,
        )?;
        let inner = RaftKvInner {
            id,
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_t: std::marker::PhantomData,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// This node's identity.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Deliver a wire message to this node. `sender_address` is the network
    /// address the message arrived from, as reported by the transport.
    pub fn submit_message(&self, msg: Message, sender_address: String) {
        let _ = self.inner.tx_api.send(RaftMsg::Incoming { msg, sender_address });
    }

    /// Open a new transaction at the given consistency level.
    pub async fn create_transaction(&self, consistency: Consistency) -> Result<Transaction<A>, CommitError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::OpenTx {
                consistency,
                resp: resp_tx,
            })
            .map_err(|_| CommitError::Retry("raft node is shutting down".into()))?;
        let shared = resp_rx.await.map_err(|_| CommitError::Retry("raft node is shutting down".into()))??;
        Ok(Transaction {
            shared,
            api: self.inner.tx_api.clone(),
        })
    }

    /// Form a new single-node cluster with this node as its only member,
    /// reachable at `address`. Only valid on a pristine node.
    pub async fn initialize(&self, address: String) -> Result<(), CommitError> {
        self.control(|resp| RaftMsg::Initialize { address, resp }).await
    }

    /// Add (`Some(address)`) or remove (`None`) a cluster member. Must be
    /// invoked on the cluster leader.
    pub async fn config_change(&self, identity: NodeId, address: Option<String>) -> Result<(), CommitError> {
        let tx = self.create_transaction(Consistency::Linearizable).await?;
        tx.config_change(identity, address)?;
        tx.commit().await
    }

    /// Ask the leader to voluntarily step down.
    pub async fn step_down(&self) -> Result<(), CommitError> {
        self.control(|resp| RaftMsg::StepDown { resp }).await
    }

    /// Ask a follower to start an election immediately.
    pub async fn start_election(&self) -> Result<(), CommitError> {
        self.control(|resp| RaftMsg::StartElection { resp }).await
    }

    async fn control(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), CommitError>>) -> RaftMsg<A>,
    ) -> Result<(), CommitError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(make(resp_tx))
            .map_err(|_| CommitError::Retry("raft node is shutting down".into()))?;
        resp_rx.await.map_err(|_| CommitError::Retry("raft node is shutting down".into()))?
    }

    /// A handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// The current node status.
    pub fn status(&self) -> RaftMetrics {
        self.inner.rx_metrics.borrow().clone()
    }

    /// The identity of the current leader, if known.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader.clone()
    }

    /// A handle for awaiting metrics conditions.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut the node down and await its core task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<A: AtomicKvStore, T: RaftTransport> std::fmt::Debug for RaftKv<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftKv").field("id", &self.inner.id).finish()
    }
}
