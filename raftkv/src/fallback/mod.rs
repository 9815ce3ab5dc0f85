//! The partition-tolerant fallback layer.
//!
//! A [`FallbackKv`] wraps a priority-ascending list of replicated targets
//! plus one local standalone store. An availability detector probes each
//! target on its own interval; hysteresis keeps the controller from chasing
//! flapping targets; and on every transition the configured merge strategy
//! reconciles the two stores before new transactions move over.

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::SystemTime;

use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::codec;
use crate::error::CommitError;
use crate::error::FallbackError;
use crate::kv::AtomicKvStore;
use crate::kv::KeyRange;
use crate::kv::KvPair;
use crate::kv::MutableView;
use crate::message::RaftTransport;
use crate::raft::RaftKv;
use crate::txn::Consistency;
use crate::txn::Transaction;
use crate::watch::completion_pair;
use crate::watch::WatchToken;

const STATE_FILE_MAGIC: u32 = 0xe2bd_1a96;
const STATE_FILE_VERSION: u8 = 1;

/// A read/write surface a merge strategy uses to reconcile two stores.
pub trait MergeTx {
    fn get_range(&self, min: &[u8], max: Option<&[u8]>) -> Result<Vec<KvPair>, CommitError>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CommitError>;
    fn remove_range(&self, min: &[u8], max: Option<&[u8]>) -> Result<(), CommitError>;
}

/// Policy applied during migration to reconcile source and destination.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, source: &dyn MergeTx, destination: &dyn MergeTx) -> Result<(), CommitError>;
    fn name(&self) -> &'static str;
}

/// Replace the destination's contents with the source's.
pub struct OverwriteMergeStrategy;

impl MergeStrategy for OverwriteMergeStrategy {
    fn merge(&self, source: &dyn MergeTx, destination: &dyn MergeTx) -> Result<(), CommitError> {
        destination.remove_range(b"", None)?;
        for (key, value) in source.get_range(b"", None)? {
            destination.put(key, value)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "overwrite"
    }
}

/// Leave the destination exactly as it is.
pub struct NullMergeStrategy;

impl MergeStrategy for NullMergeStrategy {
    fn merge(&self, _source: &dyn MergeTx, _destination: &dyn MergeTx) -> Result<(), CommitError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// One replicated target the controller can route transactions to.
///
/// Targets are held in priority-ascending order: the controller prefers the
/// highest-index target whose cluster is available.
pub struct FallbackTarget<A: AtomicKvStore, T: RaftTransport> {
    /// This process's node in the target cluster.
    pub raft: RaftKv<A, T>,
    /// Deadline for the availability probe transaction.
    pub transaction_timeout: Duration,
    /// How often to re-check availability.
    pub check_interval: Duration,
    /// How long the target must stay available before migrating up to it.
    pub min_available_time: Duration,
    /// How long the target must stay unavailable before migrating away.
    pub min_unavailable_time: Duration,
    /// Strategy when migrating away from this target (moving down).
    pub unavailable_merge_strategy: Arc<dyn MergeStrategy>,
    /// Strategy when migrating back up to this target.
    pub rejoin_merge_strategy: Arc<dyn MergeStrategy>,
}

impl<A: AtomicKvStore, T: RaftTransport> FallbackTarget<A, T> {
    pub fn new(raft: RaftKv<A, T>) -> Self {
        Self {
            raft,
            transaction_timeout: Duration::from_millis(1000),
            check_interval: Duration::from_millis(2000),
            min_available_time: Duration::from_millis(10_000),
            min_unavailable_time: Duration::from_millis(30_000),
            unavailable_merge_strategy: Arc::new(OverwriteMergeStrategy),
            rejoin_merge_strategy: Arc::new(NullMergeStrategy),
        }
    }

    /// The follower staleness beyond which a two-node leader is not trusted
    /// to serve current data.
    fn max_follower_staleness(&self) -> Duration {
        self.transaction_timeout * 2
    }
}

/// Mutable per-target runtime state.
#[derive(Debug)]
struct TargetRuntime {
    available: bool,
    last_change: Option<Instant>,
    last_active_ms: i64,
    last_linearizable_commit: Option<Instant>,
}

/// Controller state guarded by a plain mutex (never held across awaits).
#[derive(Debug)]
struct ControllerState {
    /// Index of the active target; -1 means the standalone store.
    current_target_index: i32,
    /// Targets above this index are never selected; -1 forces standalone.
    maximum_target_index: i32,
    per_target: Vec<TargetRuntime>,
    standalone_last_active_ms: i64,
}

/// The decision inputs for one target, split out so the hysteresis rule is a
/// pure, testable function.
#[derive(Clone, Copy, Debug)]
struct HysteresisInput {
    available: bool,
    time_since_change: Option<Duration>,
    currently_at_or_above: bool,
    min_available_time: Duration,
    min_unavailable_time: Duration,
}

/// The hysteresis rule: a target must hold its state for the configured
/// minimum before the controller reacts to it.
fn hysteresis_available(input: HysteresisInput) -> bool {
    let since = input.time_since_change;
    if input.currently_at_or_above {
        if input.available {
            true
        } else {
            matches!(since, Some(since) if since < input.min_unavailable_time)
        }
    } else if input.available {
        matches!(since, Some(since) if since >= input.min_available_time)
    } else {
        false
    }
}

/// The persisted controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PersistentState {
    current_target_index: i32,
    standalone_last_active_ms: i64,
    per_target_last_active_ms: Vec<i64>,
}

fn encode_state(state: &PersistentState) -> Vec<u8> {
    let mut buf = Vec::new();
    codec::put_u32(&mut buf, STATE_FILE_MAGIC);
    codec::put_u8(&mut buf, STATE_FILE_VERSION);
    codec::put_uvarint(&mut buf, state.per_target_last_active_ms.len() as u64);
    codec::put_ivarint(&mut buf, state.current_target_index as i64);
    codec::put_i64(&mut buf, state.standalone_last_active_ms);
    for ms in &state.per_target_last_active_ms {
        codec::put_i64(&mut buf, *ms);
    }
    buf
}

/// Decode a state file. Returns `None` (use defaults) when the file is for a
/// different target count or otherwise unusable.
fn decode_state(bytes: &[u8], num_targets: usize) -> Option<PersistentState> {
    let mut input = bytes;
    if codec::get_u32(&mut input).ok()? != STATE_FILE_MAGIC {
        return None;
    }
    if codec::get_u8(&mut input).ok()? != STATE_FILE_VERSION {
        return None;
    }
    let file_targets = codec::get_uvarint(&mut input).ok()? as usize;
    if file_targets != num_targets {
        return None;
    }
    let current_target_index = codec::get_ivarint(&mut input).ok()? as i32;
    if current_target_index < -1 || current_target_index >= num_targets as i32 {
        return None;
    }
    let standalone_last_active_ms = codec::get_i64(&mut input).ok()?;
    let mut per_target_last_active_ms = Vec::with_capacity(file_targets);
    for _ in 0..file_targets {
        per_target_last_active_ms.push(codec::get_i64(&mut input).ok()?);
    }
    Some(PersistentState {
        current_target_index,
        standalone_last_active_ms,
        per_target_last_active_ms,
    })
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A point-in-time status report for the controller.
#[derive(Debug, Clone)]
pub struct FallbackStatus {
    pub current_target_index: i32,
    pub maximum_target_index: i32,
    pub migration_count: u64,
    pub migrating: bool,
    pub target_available: Vec<bool>,
}

/// A policy hook consulted before migrating from one target index to
/// another (-1 denotes the standalone store).
pub type MigrationFilter = Box<dyn Fn(i32, i32) -> bool + Send + Sync>;

struct FallbackShared<A: AtomicKvStore, T: RaftTransport> {
    targets: Vec<FallbackTarget<A, T>>,
    standalone: Arc<A>,
    state_file: PathBuf,
    state: StdMutex<ControllerState>,
    migration_count: AtomicU64,
    migrating: AtomicBool,
    migration_tx: watch::Sender<u64>,
    migration_rx: watch::Receiver<u64>,
    shutdown_tx: watch::Sender<bool>,
    migration_filter: StdMutex<Option<MigrationFilter>>,
}

impl<A: AtomicKvStore, T: RaftTransport> FallbackShared<A, T> {
    fn migration_allowed(&self, from: i32, to: i32) -> bool {
        match self.migration_filter.lock().unwrap().as_ref() {
            Some(filter) => filter(from, to),
            None => true,
        }
    }
}

/// A key/value store that transparently fails over between replicated
/// clusters and a local standalone store.
pub struct FallbackKv<A: AtomicKvStore, T: RaftTransport> {
    shared: Arc<FallbackShared<A, T>>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: AtomicKvStore, T: RaftTransport> FallbackKv<A, T> {
    /// Start the controller.
    ///
    /// `targets` is priority-ascending; the controller initially routes to
    /// the target recorded in the state file, or to the highest-priority
    /// target when no usable state file exists.
    pub fn start(
        targets: Vec<FallbackTarget<A, T>>,
        standalone: Arc<A>,
        state_file: &Path,
    ) -> Result<Self, FallbackError> {
        if targets.is_empty() {
            return Err(FallbackError::Migration("at least one target is required".into()));
        }

        let persisted = match fs::read(state_file) {
            Ok(bytes) => {
                let decoded = decode_state(&bytes, targets.len());
                if decoded.is_none() {
                    tracing::warn!(file=?state_file, "ignoring unusable fallback state file");
                }
                decoded
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(FallbackError::StateFile(err.into())),
        };

        let (current, standalone_ms, per_ms) = match persisted {
            Some(state) => (
                state.current_target_index,
                state.standalone_last_active_ms,
                state.per_target_last_active_ms,
            ),
            None => (targets.len() as i32 - 1, 0, vec![0; targets.len()]),
        };

        let per_target = per_ms
            .into_iter()
            .map(|last_active_ms| TargetRuntime {
                available: false,
                last_change: None,
                last_active_ms,
                last_linearizable_commit: None,
            })
            .collect();

        let (migration_tx, migration_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let maximum_target_index = targets.len() as i32 - 1;
        let shared = Arc::new(FallbackShared {
            targets,
            standalone,
            state_file: state_file.to_path_buf(),
            state: StdMutex::new(ControllerState {
                current_target_index: current,
                maximum_target_index,
                per_target,
                standalone_last_active_ms: standalone_ms,
            }),
            migration_count: AtomicU64::new(0),
            migrating: AtomicBool::new(false),
            migration_tx,
            migration_rx,
            shutdown_tx,
            migration_filter: StdMutex::new(None),
        });

        let checker = tokio::spawn(
            checker_loop(shared.clone(), shutdown_rx).instrument(tracing::debug_span!("fallback-checker")),
        );

        Ok(Self {
            shared,
            checker: Mutex::new(Some(checker)),
        })
    }

    /// Open a transaction bound to the currently selected store.
    ///
    /// The transaction remains usable while a migration runs, but if the
    /// controller migrates before it commits, the commit fails with a retry
    /// error.
    pub async fn create_transaction(
        &self,
        consistency: Consistency,
    ) -> Result<FallbackTransaction<A, T>, CommitError> {
        let target_index = self.shared.state.lock().unwrap().current_target_index;
        let created_migration_count = self.shared.migration_count.load(Ordering::SeqCst);

        let inner = if target_index >= 0 {
            let raft = &self.shared.targets[target_index as usize].raft;
            FallbackTxInner::Raft(raft.create_transaction(consistency).await?)
        } else {
            FallbackTxInner::Standalone(StandaloneTx::open(self.shared.standalone.clone()).await?)
        };

        Ok(FallbackTransaction {
            inner,
            shared: self.shared.clone(),
            created_migration_count,
            target_index,
            consistency,
        })
    }

    /// Current controller status.
    pub fn status(&self) -> FallbackStatus {
        let state = self.shared.state.lock().unwrap();
        FallbackStatus {
            current_target_index: state.current_target_index,
            maximum_target_index: state.maximum_target_index,
            migration_count: self.shared.migration_count.load(Ordering::SeqCst),
            migrating: self.shared.migrating.load(Ordering::SeqCst),
            target_available: state.per_target.iter().map(|t| t.available).collect(),
        }
    }

    /// Install a policy consulted before any migration; returning false
    /// leaves the controller where it is for that round.
    pub fn set_migration_filter(&self, filter: Option<MigrationFilter>) {
        *self.shared.migration_filter.lock().unwrap() = filter;
    }

    /// Force the controller onto the standalone store (or release it).
    pub fn force_standalone(&self, on: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.maximum_target_index = if on {
            -1
        } else {
            self.shared.targets.len() as i32 - 1
        };
        tracing::info!(maximum = state.maximum_target_index, "fallback maximum target changed");
    }

    /// The number of migrations performed since start.
    pub fn migration_count(&self) -> u64 {
        self.shared.migration_count.load(Ordering::SeqCst)
    }

    /// Stop the controller, waiting out any in-progress migration.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.shared.shutdown_tx.send(true);
        if let Some(handle) = self.checker.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// The controller's periodic availability / migration loop.
async fn checker_loop<A: AtomicKvStore, T: RaftTransport>(
    shared: Arc<FallbackShared<A, T>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let now = Instant::now();
    let mut next_checks: Vec<Instant> = shared.targets.iter().map(|_| now).collect();

    loop {
        let next = next_checks.iter().copied().min().expect("at least one target");
        tokio::select! {
            _ = sleep_until(next) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("fallback checker stopping");
                    return;
                }
            }
        }

        let now = Instant::now();
        for index in 0..shared.targets.len() {
            if next_checks[index] > now {
                continue;
            }
            next_checks[index] = now + shared.targets[index].check_interval;
            let available = check_availability(&shared, index).await;
            let mut state = shared.state.lock().unwrap();
            let target = &mut state.per_target[index];
            if target.available != available {
                tracing::info!(target = index, available, "fallback target availability changed");
                target.available = available;
                target.last_change = Some(Instant::now());
            }
        }

        let (best, current) = {
            let state = shared.state.lock().unwrap();
            (select_best_target(&shared, &state), state.current_target_index)
        };

        if best != current && shared.migration_allowed(current, best) {
            migrate(&shared, current, best).await;
        }
    }
}

/// Probe one target for availability.
async fn check_availability<A: AtomicKvStore, T: RaftTransport>(
    shared: &Arc<FallbackShared<A, T>>,
    index: usize,
) -> bool {
    let target = &shared.targets[index];

    // A recent successful linearizable commit is proof enough.
    {
        let state = shared.state.lock().unwrap();
        if let Some(at) = state.per_target[index].last_linearizable_commit {
            if at.elapsed() < target.check_interval {
                return true;
            }
        }
    }

    // A two-node leader whose lone follower has gone quiet may be serving
    // stale reads during a partition; report it unavailable.
    let metrics = target.raft.status();
    if metrics.role == crate::metrics::RoleKind::Leader && metrics.config.len() == 2 {
        let stale = match metrics.single_follower_echo_age_ms {
            Some(age) => Duration::from_millis(age) > target.max_follower_staleness(),
            None => true,
        };
        if stale {
            tracing::debug!(target = index, "two-node leader with stale follower, reporting unavailable");
            return false;
        }
    }

    let probe = async {
        let tx = target.raft.create_transaction(Consistency::Linearizable).await?;
        tx.set_read_only(true)?;
        tx.set_timeout(target.transaction_timeout)?;
        let _ = tx.get(b"")?;
        tx.commit().await
    };
    match tokio::time::timeout(target.transaction_timeout, probe).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::debug!(target = index, error=%err, "availability probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(target = index, "availability probe timed out");
            false
        }
    }
}

/// Pick the highest hysteresis-available target, or -1 for standalone.
fn select_best_target<A: AtomicKvStore, T: RaftTransport>(
    shared: &FallbackShared<A, T>,
    state: &ControllerState,
) -> i32 {
    let max = state.maximum_target_index.min(shared.targets.len() as i32 - 1);
    for index in (0..=max).rev() {
        let target = &shared.targets[index as usize];
        let runtime = &state.per_target[index as usize];
        let input = HysteresisInput {
            available: runtime.available,
            time_since_change: runtime.last_change.map(|at| at.elapsed()),
            currently_at_or_above: state.current_target_index >= index,
            min_available_time: target.min_available_time,
            min_unavailable_time: target.min_unavailable_time,
        };
        if hysteresis_available(input) {
            return index;
        }
    }
    -1
}

/// Migrate from `from` to `to`, merging state across per the configured
/// strategy. On a retryable failure the controller stays where it is and
/// tries again on a later round; any other failure is logged and the switch
/// proceeds without the merge.
async fn migrate<A: AtomicKvStore, T: RaftTransport>(shared: &Arc<FallbackShared<A, T>>, from: i32, to: i32) {
    shared.migrating.store(true, Ordering::SeqCst);
    tracing::info!(from, to, "fallback migration starting");

    let merged = perform_merge(shared, from, to).await;
    let proceed = match merged {
        Ok(()) => true,
        Err(err) if err.is_retryable() || matches!(err, CommitError::Timeout) => {
            tracing::warn!(from, to, error=%err, "fallback migration failed, will retry");
            false
        }
        Err(err) => {
            tracing::error!(from, to, error=%err, "fallback merge failed fatally, switching without merge");
            true
        }
    };

    if proceed {
        let now_ms = wall_clock_ms();
        let persistent = {
            let mut state = shared.state.lock().unwrap();
            if from >= 0 {
                state.per_target[from as usize].last_active_ms = now_ms;
            } else {
                state.standalone_last_active_ms = now_ms;
            }
            state.current_target_index = to;
            PersistentState {
                current_target_index: to,
                standalone_last_active_ms: state.standalone_last_active_ms,
                per_target_last_active_ms: state.per_target.iter().map(|t| t.last_active_ms).collect(),
            }
        };

        let count = shared.migration_count.fetch_add(1, Ordering::SeqCst) + 1;
        // Completes (spuriously) every key watch bound to the old target.
        let _ = shared.migration_tx.send(count);

        if let Err(err) = write_state_file(&shared.state_file, &persistent) {
            tracing::error!(error=%err, "could not persist fallback state file");
        }
        tracing::info!(from, to, migrations = count, "fallback migration complete");
    }

    shared.migrating.store(false, Ordering::SeqCst);
}

async fn perform_merge<A: AtomicKvStore, T: RaftTransport>(
    shared: &Arc<FallbackShared<A, T>>,
    from: i32,
    to: i32,
) -> Result<(), CommitError> {
    let created_migration_count = shared.migration_count.load(Ordering::SeqCst);

    // Source: a read-only view of where we are leaving. For a replicated
    // source this uses eventual consistency so no majority is required.
    let source_inner = if from >= 0 {
        let tx = shared.targets[from as usize].raft.create_transaction(Consistency::Eventual).await?;
        tx.set_read_only(true)?;
        FallbackTxInner::Raft(tx)
    } else {
        FallbackTxInner::Standalone(StandaloneTx::open(shared.standalone.clone()).await?)
    };
    let source = FallbackTransaction {
        inner: source_inner,
        shared: shared.clone(),
        created_migration_count,
        target_index: from,
        consistency: Consistency::Eventual,
    };

    let destination_inner = if to >= 0 {
        FallbackTxInner::Raft(shared.targets[to as usize].raft.create_transaction(Consistency::Linearizable).await?)
    } else {
        FallbackTxInner::Standalone(StandaloneTx::open(shared.standalone.clone()).await?)
    };
    let destination = FallbackTransaction {
        inner: destination_inner,
        shared: shared.clone(),
        created_migration_count,
        target_index: to,
        consistency: Consistency::Linearizable,
    };

    // Moving down uses the source's strategy; moving up the destination's.
    let strategy = if to < from {
        shared.targets[from as usize].unavailable_merge_strategy.clone()
    } else {
        shared.targets[to as usize].rejoin_merge_strategy.clone()
    };
    tracing::debug!(strategy = strategy.name(), "merging stores");

    strategy.merge(&source, &destination)?;
    destination.commit().await?;
    source.rollback();
    Ok(())
}

fn write_state_file(path: &Path, state: &PersistentState) -> anyhow::Result<()> {
    let bytes = encode_state(state);
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// A transaction against the standalone store: an MVCC view over a snapshot,
/// committed as one atomic mutation.
pub struct StandaloneTx<A: AtomicKvStore> {
    store: Arc<A>,
    view: StdMutex<Option<MutableView<A::Snapshot>>>,
}

impl<A: AtomicKvStore> StandaloneTx<A> {
    async fn open(store: Arc<A>) -> Result<Self, CommitError> {
        let snapshot = store.snapshot().await.map_err(|err| CommitError::Durability(err.to_string()))?;
        let mut view = MutableView::new(snapshot);
        // There is no conflict detection against a standalone store.
        view.set_track_reads(false);
        Ok(Self {
            store,
            view: StdMutex::new(Some(view)),
        })
    }

    fn with_view<R>(
        &self,
        f: impl FnOnce(&mut MutableView<A::Snapshot>) -> R,
    ) -> Result<R, CommitError> {
        match self.view.lock().unwrap().as_mut() {
            Some(view) => Ok(f(view)),
            None => Err(CommitError::Stale("transaction is no longer usable".into())),
        }
    }

    async fn commit(&self) -> Result<(), CommitError> {
        let writes = match self.view.lock().unwrap().take() {
            Some(view) => view.writes().clone(),
            None => return Err(CommitError::Stale("transaction is no longer usable".into())),
        };
        if writes.is_empty() {
            return Ok(());
        }
        self.store
            .mutate(writes, true)
            .await
            .map_err(|err| CommitError::Durability(err.to_string()))
    }

    fn rollback(&self) {
        self.view.lock().unwrap().take();
    }
}

enum FallbackTxInner<A: AtomicKvStore> {
    Raft(Transaction<A>),
    Standalone(StandaloneTx<A>),
}

/// A transaction opened through the fallback controller.
///
/// The transaction binds to whichever store was selected when it was
/// created. If the controller migrates before the transaction commits, the
/// commit fails with a retry error and the work must be redone on the new
/// store.
pub struct FallbackTransaction<A: AtomicKvStore, T: RaftTransport> {
    inner: FallbackTxInner<A>,
    shared: Arc<FallbackShared<A, T>>,
    created_migration_count: u64,
    target_index: i32,
    consistency: Consistency,
}

impl<A: AtomicKvStore, T: RaftTransport> FallbackTransaction<A, T> {
    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CommitError> {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.get(key),
            FallbackTxInner::Standalone(tx) => tx.with_view(|view| view.get(key)),
        }
    }

    pub fn get_range(&self, min: &[u8], max: Option<&[u8]>, reverse: bool) -> Result<Vec<KvPair>, CommitError> {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.get_range(min, max, reverse),
            FallbackTxInner::Standalone(tx) => tx.with_view(|view| view.get_range(min, max, reverse)),
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CommitError> {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.put(key, value),
            FallbackTxInner::Standalone(tx) => tx.with_view(|view| view.put(key, value)),
        }
    }

    pub fn remove(&self, key: &[u8]) -> Result<(), CommitError> {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.remove(key),
            FallbackTxInner::Standalone(tx) => tx.with_view(|view| view.remove(key)),
        }
    }

    pub fn remove_key_range(&self, min: &[u8], max: Option<&[u8]>) -> Result<(), CommitError> {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.remove_range(min, max),
            FallbackTxInner::Standalone(tx) => {
                let range = KeyRange::new(min.to_vec(), max.map(|m| m.to_vec()));
                tx.with_view(|view| view.remove_range(range))
            }
        }
    }

    pub fn adjust_counter(&self, key: &[u8], delta: i64) -> Result<(), CommitError> {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.adjust_counter(key, delta),
            FallbackTxInner::Standalone(tx) => tx.with_view(|view| view.adjust(key, delta)),
        }
    }

    /// Watch `key`; the returned token also completes (spuriously) when the
    /// controller migrates away from the store the watch was placed on.
    pub async fn watch_key(&self, key: &[u8]) -> Result<WatchToken, CommitError> {
        let inner_token = match &self.inner {
            FallbackTxInner::Raft(tx) => Some(tx.watch_key(key).await?),
            FallbackTxInner::Standalone(_) => None,
        };

        let (handle, token) = completion_pair();
        let mut migration_rx = self.shared.migration_rx.clone();
        let created = self.created_migration_count;
        tokio::spawn(async move {
            let migrated = async move {
                loop {
                    if *migration_rx.borrow() != created {
                        return;
                    }
                    if migration_rx.changed().await.is_err() {
                        return;
                    }
                }
            };
            match inner_token {
                Some(mut inner) => {
                    tokio::select! {
                        _ = inner.completed() => {}
                        _ = migrated => {}
                    }
                }
                None => migrated.await,
            }
            handle.complete();
        });
        Ok(token)
    }

    /// Commit the transaction, unless the controller migrated since it was
    /// opened.
    pub async fn commit(&self) -> Result<(), CommitError> {
        if self.shared.migration_count.load(Ordering::SeqCst) != self.created_migration_count {
            self.rollback();
            return Err(CommitError::Retry("fallback controller migrated to another store".into()));
        }

        let result = match &self.inner {
            FallbackTxInner::Raft(tx) => tx.commit().await,
            FallbackTxInner::Standalone(tx) => tx.commit().await,
        };

        if result.is_ok() && self.target_index >= 0 && self.consistency == Consistency::Linearizable {
            let mut state = self.shared.state.lock().unwrap();
            state.per_target[self.target_index as usize].last_linearizable_commit = Some(Instant::now());
        }
        result
    }

    /// Roll the transaction back; idempotent and infallible.
    pub fn rollback(&self) {
        match &self.inner {
            FallbackTxInner::Raft(tx) => tx.rollback(),
            FallbackTxInner::Standalone(tx) => tx.rollback(),
        }
    }
}

impl<A: AtomicKvStore, T: RaftTransport> MergeTx for FallbackTransaction<A, T> {
    fn get_range(&self, min: &[u8], max: Option<&[u8]>) -> Result<Vec<KvPair>, CommitError> {
        FallbackTransaction::get_range(self, min, max, false)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CommitError> {
        FallbackTransaction::put(self, key, value)
    }

    fn remove_range(&self, min: &[u8], max: Option<&[u8]>) -> Result<(), CommitError> {
        self.remove_key_range(min, max)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn state_file_roundtrip() {
        let state = PersistentState {
            current_target_index: 1,
            standalone_last_active_ms: 123_456,
            per_target_last_active_ms: vec![111, 222],
        };
        let bytes = encode_state(&state);
        assert_eq!(decode_state(&bytes, 2), Some(state));
    }

    #[test]
    fn state_file_target_count_mismatch_is_ignored() {
        let state = PersistentState {
            current_target_index: 0,
            standalone_last_active_ms: 0,
            per_target_last_active_ms: vec![0, 0],
        };
        let bytes = encode_state(&state);
        assert_eq!(decode_state(&bytes, 3), None);
    }

    #[test]
    fn state_file_garbage_is_ignored() {
        assert_eq!(decode_state(&[], 1), None);
        assert_eq!(decode_state(&[1, 2, 3, 4, 5, 6], 1), None);

        let state = PersistentState {
            current_target_index: 5,
            standalone_last_active_ms: 0,
            per_target_last_active_ms: vec![0],
        };
        // Out-of-range current target index.
        assert_eq!(decode_state(&encode_state(&state), 1), None);
    }

    fn input(available: bool, since_ms: Option<u64>, at_or_above: bool) -> HysteresisInput {
        HysteresisInput {
            available,
            time_since_change: since_ms.map(Duration::from_millis),
            currently_at_or_above: at_or_above,
            min_available_time: Duration::from_millis(1000),
            min_unavailable_time: Duration::from_millis(2000),
        }
    }

    #[test]
    fn hysteresis_holds_position_while_available() {
        assert!(hysteresis_available(input(true, Some(0), true)));
        assert!(hysteresis_available(input(true, Some(10_000), true)));
    }

    #[test]
    fn hysteresis_grants_grace_after_losing_availability() {
        // Recently became unavailable: still treated as available.
        assert!(hysteresis_available(input(false, Some(500), true)));
        // Unavailable long enough: give it up.
        assert!(!hysteresis_available(input(false, Some(2500), true)));
        // Never observed a change while at-or-above and unavailable: no
        // grace to measure, so unavailable.
        assert!(!hysteresis_available(input(false, None, true)));
    }

    #[test]
    fn hysteresis_requires_sustained_availability_to_move_up() {
        assert!(!hysteresis_available(input(true, Some(500), false)));
        assert!(hysteresis_available(input(true, Some(1500), false)));
        assert!(!hysteresis_available(input(true, None, false)));
        assert!(!hysteresis_available(input(false, Some(10_000), false)));
    }

    #[test]
    fn flapping_target_never_clears_either_threshold() {
        // A target flapping every 300ms never accumulates 1000ms of
        // availability to move up to, nor 2000ms of unavailability to move
        // away from.
        for since in [0u64, 100, 200, 300] {
            assert!(!hysteresis_available(input(true, Some(since), false)));
            assert!(hysteresis_available(input(false, Some(since), true)));
        }
    }
}
