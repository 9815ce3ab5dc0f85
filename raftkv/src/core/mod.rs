//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod commit;
mod install_snapshot;
mod leader;
mod vote;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::message::ClusterConfig;
use crate::message::Message;
use crate::message::MessageHeader;
use crate::message::RaftTransport;
use crate::metrics::RaftMetrics;
pub use crate::metrics::RoleKind;
use crate::raft::RaftMsg;
use crate::replication::FollowerRep;
use crate::replication::PeerQueues;
use crate::replication::SnapshotTransmit;
use crate::storage::LogStore;
use crate::txn::TxFailure;
use crate::txn::TxShared;
use crate::watch::WatchHandle;
use crate::MessageSummary;
use crate::NodeId;

/// How long a snapshot transfer may run before it is abandoned.
const SNAPSHOT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How many snapshot chunks are queued per follower per heartbeat tick.
const SNAPSHOT_CHUNKS_PER_TICK: usize = 4;

/// State of an in-progress snapshot installation on a follower.
pub(crate) struct SnapshotReceive {
    pub term: u64,
    pub index: u64,
    pub config: ClusterConfig,
    pub next_pair_index: u64,
    pub previous_key: Option<Vec<u8>>,
}

/// A registered key watch.
pub(crate) struct KeyWatch {
    pub key: Vec<u8>,
    pub handle: WatchHandle,
}

/// The core type implementing the Raft protocol for one node.
///
/// The core is owned by a single spawned task; all state transitions happen
/// on that task, driven by the API channel, timers and the shutdown signal.
pub struct RaftCore<A: AtomicKvStore, T: RaftTransport> {
    /// This node's identity.
    id: NodeId,
    config: Arc<Config>,
    /// The state machine the committed log is applied to.
    store: Arc<A>,
    /// The durable log and node metadata.
    log: LogStore,
    /// Outbound per-peer FIFO queues.
    peers: PeerQueues<T>,

    /// The role the main loop should be running.
    target_role: RoleKind,

    /// Highest log index known committed cluster-wide. Monotonic.
    commit_index: u64,

    /// The cluster membership derived from the applied config plus all
    /// retained log entry deltas.
    cluster_config: ClusterConfig,

    current_leader: Option<NodeId>,
    /// The address the current leader's messages arrive from.
    leader_address: Option<String>,

    /// The node's current lease view: on the leader, the computed lease
    /// timeout; on a follower, the last lease timeout advertised by the
    /// leader. `None` when no lease is established.
    lease_timeout: Option<u64>,

    /// Origin for this node's monotonic millisecond clock.
    clock_origin: Instant,

    /// On a two-member cluster's leader: the lone follower's most recently
    /// echoed leader timestamp, for staleness reporting.
    single_follower_echo: Option<u64>,

    /// Open transactions by id.
    txns: HashMap<u64, Arc<TxShared<A::Snapshot>>>,
    next_tx_id: u64,
    /// Commit responders for transactions whose commit is in progress.
    commit_waiters: HashMap<u64, oneshot::Sender<Result<(), crate::error::CommitError>>>,
    /// The one transaction (if any) with high-priority conflict resolution.
    high_priority_tx: Option<u64>,

    /// Entry payloads this node already holds for entries the leader may
    /// send without data (commits this node forwarded), keyed by index.
    pending_entry_data: HashMap<u64, (u64, crate::kv::Writes, Option<crate::message::ConfigChange>)>,

    /// In-progress snapshot installation, if any.
    snapshot_receive: Option<SnapshotReceive>,

    /// Registered key watches.
    watches: Vec<KeyWatch>,

    /// The deadline for the next election timeout.
    next_election_timeout: Option<Instant>,
    /// Peers that answered the current pre-election probe round.
    probe_responses: HashSet<NodeId>,
    probe_round: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<A>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        dir: &Path,
        config: Arc<Config>,
        store: Arc<A>,
        transport: Arc<T>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<A>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> RaftResult<JoinHandle<RaftResult<()>>> {
        let log = LogStore::open(dir, config.disable_sync).map_err(RaftError::Storage)?;
        let cluster_config = log.current_config();
        // Entries already applied are committed by definition; everything
        // beyond that must be re-established through the protocol.
        let commit_index = log.last_applied().index;

        let this = Self {
            id,
            config,
            store,
            log,
            peers: PeerQueues::new(transport),
            target_role: RoleKind::Follower,
            commit_index,
            cluster_config,
            current_leader: None,
            leader_address: None,
            lease_timeout: None,
            clock_origin: Instant::now(),
            single_follower_echo: None,
            txns: HashMap::new(),
            next_tx_id: 1,
            commit_waiters: HashMap::new(),
            high_priority_tx: None,
            pending_entry_data: HashMap::new(),
            snapshot_receive: None,
            watches: Vec::new(),
            next_election_timeout: None,
            probe_responses: HashSet::new(),
            probe_round: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        Ok(tokio::spawn(this.main().instrument(tracing::debug_span!("spawn"))))
    }

    /// The main loop: delegate to the current role's state controller until
    /// a shutdown is requested.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!(
            term = self.log.current_term(),
            last_log = self.log.last_index(),
            members = self.cluster_config.len(),
            "raft node starting"
        );
        self.report_metrics();

        loop {
            match self.target_role {
                RoleKind::Leader => LeaderState::new(&mut self).run().await?,
                RoleKind::Candidate => CandidateState::new(&mut self).run().await?,
                RoleKind::Follower => FollowerState::new(&mut self).run().await?,
                RoleKind::Shutdown => {
                    tracing::info!(id=%self.id, "node has shut down");
                    self.fail_all_transactions(|| TxFailure::Retry("raft node is shutting down".into()));
                    // Dropping the watch handles completes all key watches
                    // spuriously.
                    self.watches.clear();
                    self.report_metrics();
                    return Ok(());
                }
            }
        }
    }

    /// Milliseconds since this node started; the node's monotonic clock.
    pub(crate) fn now_ts(&self) -> u64 {
        self.clock_origin.elapsed().as_millis() as u64
    }

    /// True if this node is a voting member of the current config.
    fn is_voter(&self) -> bool {
        self.cluster_config.contains_key(&self.id)
    }

    fn majority(&self) -> usize {
        self.cluster_config.len() / 2 + 1
    }

    fn address_of(&self, identity: &NodeId) -> Option<String> {
        self.cluster_config.get(identity).cloned()
    }

    fn header_to(&self, recipient: &NodeId) -> MessageHeader {
        MessageHeader::new(
            self.log.cluster_id().unwrap_or(0),
            self.id.clone(),
            recipient.clone(),
            self.log.current_term(),
        )
    }

    /// Enqueue `msg` for the peer at `address`.
    fn send_to_address(&mut self, address: &str, msg: Message) {
        tracing::trace!(address, "send {}", msg.summary());
        self.peers.send(address, msg);
    }

    /// Update the target role, normalizing by membership: a node outside the
    /// current config never campaigns.
    fn set_target_role(&mut self, role: RoleKind) {
        if role == RoleKind::Candidate && !self.is_voter() {
            self.target_role = RoleKind::Follower;
        } else {
            self.target_role = role;
        }
        self.report_metrics();
    }

    /// Derive the cluster config from the log again, e.g. after an append,
    /// truncation or snapshot install.
    fn refresh_cluster_config(&mut self) {
        let config = self.log.current_config();
        if config != self.cluster_config {
            tracing::debug!(members = config.len(), "cluster config updated");
            self.cluster_config = config;
            if !self.is_voter() && self.target_role == RoleKind::Candidate {
                self.set_target_role(RoleKind::Follower);
            }
        }
    }

    /// The deadline after which this node should start (or consider) an
    /// election. Non-voters never time out.
    fn election_deadline(&mut self) -> Instant {
        if !self.is_voter() {
            return Instant::now() + Duration::from_secs(3600);
        }
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Push the election timeout out by a fresh random interval.
    fn update_election_timeout(&mut self) {
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(Instant::now() + t);
    }

    /// Durably adopt `term` (clearing the recorded vote) if it is newer.
    async fn update_current_term(&mut self, term: u64, voted_for: Option<NodeId>) -> RaftResult<()> {
        if term <= self.log.current_term() {
            return Ok(());
        }
        let cluster_id = self.log.cluster_id();
        self.log
            .save_term_and_vote(term, voted_for, cluster_id)
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(())
    }

    /// Record a fatal storage error: the node steps down and shuts down, and
    /// all in-flight transactions abort.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(id=%self.id, error=?err, "fatal storage error, shutting down");
        let message = err.to_string();
        self.fail_all_transactions(|| TxFailure::Durability(message.clone()));
        self.set_target_role(RoleKind::Shutdown);
        RaftError::Storage(err)
    }

    /// Common handling for every incoming wire message. Returns the message
    /// for role-specific dispatch, or `None` if it was dropped.
    async fn preprocess_incoming(&mut self, msg: Message) -> RaftResult<Option<Message>> {
        let header = msg.header();

        if header.recipient_id != self.id {
            tracing::debug!("dropping message for {}: {}", header.recipient_id, msg.summary());
            return Ok(None);
        }

        // Cluster membership: an unconfigured node is adopted by the first
        // leader that contacts it; a configured node ignores other clusters.
        match self.log.cluster_id() {
            Some(cluster_id) => {
                if header.cluster_id != cluster_id {
                    tracing::warn!(
                        theirs = header.cluster_id,
                        ours = cluster_id,
                        "dropping message from foreign cluster"
                    );
                    return Ok(None);
                }
            }
            None => match &msg {
                Message::AppendRequest(_) | Message::InstallSnapshot(_) => {
                    tracing::info!(cluster_id = header.cluster_id, "joining cluster");
                    let term = self.log.current_term();
                    let voted_for = self.log.voted_for().cloned();
                    self.log
                        .save_term_and_vote(term, voted_for, Some(header.cluster_id))
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                }
                _ => return Ok(None),
            },
        }

        // A higher term in any message steps this node down.
        if header.term > self.log.current_term() {
            tracing::debug!(
                new_term = header.term,
                old_term = self.log.current_term(),
                "observed higher term, stepping down"
            );
            self.update_current_term(header.term, None).await?;
            self.current_leader = None;
            self.leader_address = None;
            self.lease_timeout = None;
            self.set_target_role(RoleKind::Follower);
        }

        Ok(Some(msg))
    }

    fn report_metrics(&self) {
        let metrics = RaftMetrics {
            id: self.id.clone(),
            role: self.target_role,
            current_term: self.log.current_term(),
            last_log_index: self.log.last_index(),
            last_applied: self.log.last_applied(),
            commit_index: self.commit_index,
            current_leader: self.current_leader.clone(),
            config: self.cluster_config.clone(),
            single_follower_echo_age_ms: match self.target_role {
                RoleKind::Leader => self.single_follower_echo.map(|ts| self.now_ts().saturating_sub(ts)),
                _ => None,
            },
        };
        let _ = self.tx_metrics.send(metrics);
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
pub(crate) struct LeaderState<'a, A: AtomicKvStore, T: RaftTransport> {
    pub(super) core: &'a mut RaftCore<A, T>,
    /// Replication bookkeeping per follower in the current config.
    pub(super) followers: std::collections::BTreeMap<NodeId, FollowerRep>,
    /// Active snapshot transfers by follower identity.
    pub(super) transmits: HashMap<NodeId, SnapshotTransmit<A::Snapshot>>,
    /// The index of the no-op entry appended when this leader took office;
    /// config changes are refused until it commits.
    pub(super) first_term_index: u64,
    /// The index of the most recent config-change entry this leader knows
    /// of. A removed member keeps its replication stream until it has
    /// replicated past this, so it learns about its own removal.
    pub(super) last_config_change_index: u64,
}

impl<'a, A: AtomicKvStore, T: RaftTransport> LeaderState<'a, A, T> {
    pub(self) fn new(core: &'a mut RaftCore<A, T>) -> Self {
        Self {
            core,
            followers: std::collections::BTreeMap::new(),
            transmits: HashMap::new(),
            first_term_index: 0,
            last_config_change_index: 0,
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_role="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id.clone());
        self.core.leader_address = self.core.address_of(&self.core.id);
        self.last_config_change_index = self.core.log.unapplied_config_change_index().unwrap_or(0);
        self.refresh_followers();
        self.update_lease();
        self.core.report_metrics();

        // A new leader appends an initial entry in its own term so commit
        // advancement has something in the current term to bite on.
        let noop = self.append_entry(crate::kv::Writes::new(), None).await;
        match noop {
            Ok(entry) => self.first_term_index = entry.log_id.index,
            Err(failure) => {
                tracing::error!(?failure, "could not append initial leader entry");
                // The storage error already forced a shutdown.
                return Ok(());
            }
        }

        let mut heartbeat = interval(Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if self.core.target_role != RoleKind::Leader {
                tracing::info!(id=%self.core.id, role=?self.core.target_role, "leaving leader state");
                return Ok(());
            }

            tokio::select! {
                _ = heartbeat.tick() => self.on_heartbeat().await?,
                Some(msg) = self.core.rx_api.recv() => self.handle_msg(msg).await?,
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(RoleKind::Shutdown),
            }
        }
    }

    async fn handle_msg(&mut self, msg: RaftMsg<A>) -> RaftResult<()> {
        match msg {
            RaftMsg::Incoming { msg, sender_address } => {
                let msg = match self.core.preprocess_incoming(msg).await? {
                    Some(msg) => msg,
                    None => return Ok(()),
                };
                if self.core.target_role != RoleKind::Leader {
                    // Stepped down during preprocessing; let the follower
                    // state pick up from here, except for messages that must
                    // be handled in any role.
                    return self.core.handle_incoming_any_role(msg, sender_address).await;
                }
                match msg {
                    Message::AppendRequest(m) => self.core.handle_append_request(m, sender_address).await?,
                    Message::AppendResponse(m) => self.handle_append_response(m).await?,
                    Message::CommitRequest(m) => self.handle_commit_request(m, sender_address).await?,
                    Message::RequestVote(m) => self.core.handle_request_vote(m, sender_address).await?,
                    Message::InstallSnapshot(m) => self.core.handle_install_snapshot(m, sender_address).await?,
                    Message::PingRequest(m) => self.core.handle_ping_request(m, sender_address),
                    Message::PingResponse(m) => self.core.handle_ping_response(m),
                    Message::CommitResponse(m) => {
                        tracing::debug!(tx_id = m.tx_id, "leader ignoring commit response");
                    }
                    Message::GrantVote(_) => {}
                }
            }
            RaftMsg::OpenTx { consistency, resp } => self.core.open_transaction(consistency, resp).await,
            RaftMsg::CommitTx { tx_id, resp } => self.check_ready_transaction(tx_id, resp).await?,
            RaftMsg::RollbackTx { tx_id } => self.core.rollback_transaction(tx_id),
            RaftMsg::SetHighPriority { tx_id, high_priority } => {
                self.core.set_high_priority(tx_id, high_priority)
            }
            RaftMsg::WatchKey { key, resp } => self.core.register_watch(key, resp),
            RaftMsg::Initialize { resp, .. } => {
                let _ = resp.send(Err(crate::error::CommitError::Invalid(
                    "node already belongs to a cluster".into(),
                )));
            }
            RaftMsg::StepDown { resp } => {
                tracing::info!(id=%self.core.id, "leader stepping down by request");
                self.core.current_leader = None;
                self.core.leader_address = None;
                self.core.lease_timeout = None;
                self.core.set_target_role(RoleKind::Follower);
                let _ = resp.send(Ok(()));
            }
            RaftMsg::StartElection { resp } => {
                let _ = resp.send(Err(crate::error::CommitError::Invalid("node is already leader".into())));
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a node in candidate state.
pub(crate) struct CandidateState<'a, A: AtomicKvStore, T: RaftTransport> {
    core: &'a mut RaftCore<A, T>,
    /// Identities that granted their vote for the current term, self
    /// included.
    votes_granted: HashSet<NodeId>,
}

impl<'a, A: AtomicKvStore, T: RaftTransport> CandidateState<'a, A, T> {
    pub(self) fn new(core: &'a mut RaftCore<A, T>) -> Self {
        Self {
            core,
            votes_granted: HashSet::new(),
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_role="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop is a new term.
        loop {
            if self.core.target_role != RoleKind::Candidate {
                return Ok(());
            }

            self.votes_granted.clear();
            self.votes_granted.insert(self.core.id.clone());
            self.core.start_new_election_term().await?;

            // A lone voter wins unopposed.
            if self.votes_granted.len() >= self.core.majority() {
                self.core.set_target_role(RoleKind::Leader);
                return Ok(());
            }

            loop {
                if self.core.target_role != RoleKind::Candidate {
                    return Ok(());
                }
                let deadline = self.core.election_deadline();

                tokio::select! {
                    // This election timed out; start a new term.
                    _ = sleep_until(deadline) => {
                        self.core.update_election_timeout();
                        break;
                    }
                    Some(msg) = self.core.rx_api.recv() => self.handle_msg(msg).await?,
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(RoleKind::Shutdown),
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: RaftMsg<A>) -> RaftResult<()> {
        match msg {
            RaftMsg::Incoming { msg, sender_address } => {
                let msg = match self.core.preprocess_incoming(msg).await? {
                    Some(msg) => msg,
                    None => return Ok(()),
                };
                match msg {
                    Message::AppendRequest(m) => self.core.handle_append_request(m, sender_address).await?,
                    Message::RequestVote(m) => self.core.handle_request_vote(m, sender_address).await?,
                    Message::InstallSnapshot(m) => self.core.handle_install_snapshot(m, sender_address).await?,
                    Message::GrantVote(m) => {
                        if m.header.term == self.core.log.current_term() {
                            self.votes_granted.insert(m.header.sender_id.clone());
                            if self.votes_granted.len() >= self.core.majority() {
                                tracing::info!(
                                    id=%self.core.id,
                                    term = self.core.log.current_term(),
                                    votes = self.votes_granted.len(),
                                    "won election"
                                );
                                self.core.set_target_role(RoleKind::Leader);
                            }
                        }
                    }
                    Message::CommitResponse(m) => self.core.handle_commit_response(m),
                    Message::CommitRequest(m) => self.core.reject_commit_request(&m, &sender_address),
                    Message::PingRequest(m) => self.core.handle_ping_request(m, sender_address),
                    Message::PingResponse(m) => self.core.handle_ping_response(m),
                    Message::AppendResponse(_) => {}
                }
            }
            RaftMsg::OpenTx { consistency, resp } => self.core.open_transaction(consistency, resp).await,
            RaftMsg::CommitTx { tx_id, resp } => self.core.forward_commit(tx_id, resp),
            RaftMsg::RollbackTx { tx_id } => self.core.rollback_transaction(tx_id),
            RaftMsg::SetHighPriority { tx_id, high_priority } => {
                self.core.set_high_priority(tx_id, high_priority)
            }
            RaftMsg::WatchKey { key, resp } => self.core.register_watch(key, resp),
            RaftMsg::Initialize { resp, .. } => {
                let _ = resp.send(Err(crate::error::CommitError::Invalid(
                    "node already belongs to a cluster".into(),
                )));
            }
            RaftMsg::StepDown { resp } => {
                let _ = resp.send(Err(crate::error::CommitError::Invalid("node is not the leader".into())));
            }
            RaftMsg::StartElection { resp } => {
                // Already campaigning.
                let _ = resp.send(Ok(()));
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a node in follower state.
pub(crate) struct FollowerState<'a, A: AtomicKvStore, T: RaftTransport> {
    core: &'a mut RaftCore<A, T>,
}

impl<'a, A: AtomicKvStore, T: RaftTransport> FollowerState<'a, A, T> {
    pub(self) fn new(core: &'a mut RaftCore<A, T>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_role="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if self.core.target_role != RoleKind::Follower {
                return Ok(());
            }
            let deadline = self.core.election_deadline();

            tokio::select! {
                _ = sleep_until(deadline) => self.core.handle_election_timeout(),
                Some(msg) = self.core.rx_api.recv() => self.handle_msg(msg).await?,
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(RoleKind::Shutdown),
            }
        }
    }

    async fn handle_msg(&mut self, msg: RaftMsg<A>) -> RaftResult<()> {
        match msg {
            RaftMsg::Incoming { msg, sender_address } => {
                let msg = match self.core.preprocess_incoming(msg).await? {
                    Some(msg) => msg,
                    None => return Ok(()),
                };
                self.core.handle_incoming_any_role(msg, sender_address).await?;
            }
            RaftMsg::OpenTx { consistency, resp } => self.core.open_transaction(consistency, resp).await,
            RaftMsg::CommitTx { tx_id, resp } => self.core.forward_commit(tx_id, resp),
            RaftMsg::RollbackTx { tx_id } => self.core.rollback_transaction(tx_id),
            RaftMsg::SetHighPriority { tx_id, high_priority } => {
                self.core.set_high_priority(tx_id, high_priority)
            }
            RaftMsg::WatchKey { key, resp } => self.core.register_watch(key, resp),
            RaftMsg::Initialize { address, resp } => self.core.handle_initialize(address, resp).await?,
            RaftMsg::StepDown { resp } => {
                let _ = resp.send(Err(crate::error::CommitError::Invalid("node is not the leader".into())));
            }
            RaftMsg::StartElection { resp } => {
                if self.core.is_voter() {
                    tracing::info!(id=%self.core.id, "starting election by request");
                    self.core.set_target_role(RoleKind::Candidate);
                    let _ = resp.send(Ok(()));
                } else {
                    let _ = resp.send(Err(crate::error::CommitError::Invalid(
                        "node is not a voting cluster member".into(),
                    )));
                }
            }
        }
        Ok(())
    }
}

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    /// Dispatch an incoming message the way a follower would; used by the
    /// follower loop and by other roles right after stepping down.
    async fn handle_incoming_any_role(&mut self, msg: Message, sender_address: String) -> RaftResult<()> {
        match msg {
            Message::AppendRequest(m) => self.handle_append_request(m, sender_address).await?,
            Message::RequestVote(m) => self.handle_request_vote(m, sender_address).await?,
            Message::InstallSnapshot(m) => self.handle_install_snapshot(m, sender_address).await?,
            Message::CommitResponse(m) => self.handle_commit_response(m),
            Message::CommitRequest(m) => self.reject_commit_request(&m, &sender_address),
            Message::PingRequest(m) => self.handle_ping_request(m, sender_address),
            Message::PingResponse(m) => self.handle_ping_response(m),
            Message::AppendResponse(_) | Message::GrantVote(_) => {
                tracing::trace!("ignoring leader-directed message while not leader");
            }
        }
        Ok(())
    }
}
