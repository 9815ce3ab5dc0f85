//! Client-side transactions over the replicated store.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::error::CommitError;
use crate::kv::AtomicKvStore;
use crate::kv::KeyRange;
use crate::kv::KvPair;
use crate::kv::KvSnapshot;
use crate::kv::MutableView;
use crate::message::ConfigChange;
use crate::raft::RaftMsg;
use crate::watch::WatchToken;
use crate::NodeId;

/// The consistency level of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Reads and writes are linearizable with respect to all other
    /// linearizable transactions in the cluster. The default.
    Linearizable,
    /// Reads come from the local applied state and may be stale; read-only
    /// transactions commit without any network traffic.
    Eventual,
    /// Like `Eventual`, but reads may also observe log entries that are not
    /// yet committed and could still be lost.
    Uncommitted,
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::Linearizable
    }
}

/// Where a transaction is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxPhase {
    /// Accepting reads and writes.
    Executing,
    /// `commit()` was invoked and the commit is being arranged.
    CommitReady,
    /// A commit position is known; waiting for it to become durable.
    CommitWaiting {
        commit_term: u64,
        commit_index: u64,
        /// For linearizable read-only transactions: the lease point that
        /// must be covered before the reads are known current.
        min_lease: Option<u64>,
    },
    /// Terminal: committed.
    Completed,
    /// Terminal: rolled back (by the user or by a conflict).
    RolledBack,
}

impl TxPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxPhase::Completed | TxPhase::RolledBack)
    }
}

/// Why a transaction was rolled back, recorded so the eventual `commit()`
/// caller sees the original cause.
#[derive(Clone, Debug)]
pub(crate) enum TxFailure {
    Stale(String),
    Retry(String),
    Conflict(String),
    Invalid(String),
    Durability(String),
}

impl TxFailure {
    pub fn to_commit_error(&self) -> CommitError {
        match self {
            TxFailure::Stale(m) => CommitError::Stale(m.clone()),
            TxFailure::Retry(m) => CommitError::Retry(m.clone()),
            TxFailure::Conflict(m) => CommitError::Conflict(m.clone()),
            TxFailure::Invalid(m) => CommitError::Invalid(m.clone()),
            TxFailure::Durability(m) => CommitError::Durability(m.clone()),
        }
    }
}

/// The state of one transaction, guarded by its own mutex (the "view" lock).
///
/// User threads lock it for reads and writes; the node core locks it briefly
/// for rebase and commit arrangement. The lock is never held across an await
/// point, and no thread ever holds two of them.
pub(crate) struct TxInner<S: KvSnapshot> {
    pub consistency: Consistency,
    pub base_term: u64,
    pub base_index: u64,
    pub view: MutableView<S>,
    pub phase: TxPhase,
    pub failure: Option<TxFailure>,
    pub read_only: bool,
    pub timeout: Duration,
    pub config_change: Option<ConfigChange>,
}

impl<S: KvSnapshot> TxInner<S> {
    /// True if the transaction will not append a log entry.
    pub fn is_effectively_read_only(&self) -> bool {
        (self.read_only || self.view.is_read_only()) && self.config_change.is_none()
    }

    /// Move to `RolledBack` with the given cause, if not already terminal.
    pub fn fail(&mut self, failure: TxFailure) {
        if !self.phase.is_terminal() {
            self.phase = TxPhase::RolledBack;
            self.failure = Some(failure);
        }
    }
}

pub(crate) struct TxShared<S: KvSnapshot> {
    pub id: u64,
    pub inner: Mutex<TxInner<S>>,
}

/// A transaction against the replicated key/value store.
///
/// Reads and writes accumulate in a local MVCC view over a snapshot taken
/// when the transaction was opened; nothing is visible to other transactions
/// until `commit()` succeeds. Dropping the transaction rolls it back.
pub struct Transaction<A: AtomicKvStore> {
    pub(crate) shared: Arc<TxShared<A::Snapshot>>,
    pub(crate) api: mpsc::UnboundedSender<RaftMsg<A>>,
}

impl<A: AtomicKvStore> Transaction<A> {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn consistency(&self) -> Consistency {
        self.shared.inner.lock().unwrap().consistency
    }

    fn with_executing<R>(
        &self,
        f: impl FnOnce(&mut TxInner<A::Snapshot>) -> Result<R, CommitError>,
    ) -> Result<R, CommitError> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.phase {
            TxPhase::Executing => f(&mut inner),
            _ => match &inner.failure {
                Some(failure) => Err(failure.to_commit_error()),
                None => Err(CommitError::Stale("transaction is no longer executing".into())),
            },
        }
    }

    fn with_mutable<R>(
        &self,
        f: impl FnOnce(&mut TxInner<A::Snapshot>) -> R,
    ) -> Result<R, CommitError> {
        self.with_executing(|inner| {
            if inner.read_only {
                return Err(CommitError::Invalid("transaction is read-only".into()));
            }
            Ok(f(inner))
        })
    }

    /// Get the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CommitError> {
        self.with_executing(|inner| Ok(inner.view.get(key)))
    }

    /// The first pair with key at or above `min`.
    pub fn get_at_least(&self, min: &[u8]) -> Result<Option<KvPair>, CommitError> {
        self.with_executing(|inner| Ok(inner.view.get_at_least(min, None)))
    }

    /// The last pair with key strictly below `max` (unbounded when `None`).
    pub fn get_at_most(&self, max: Option<&[u8]>) -> Result<Option<KvPair>, CommitError> {
        self.with_executing(|inner| Ok(inner.view.get_at_most(b"", max)))
    }

    /// All pairs in `[min, max)`, reversed when `reverse` is set.
    pub fn get_range(&self, min: &[u8], max: Option<&[u8]>, reverse: bool) -> Result<Vec<KvPair>, CommitError> {
        self.with_executing(|inner| Ok(inner.view.get_range(min, max, reverse)))
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CommitError> {
        self.with_mutable(|inner| inner.view.put(key, value))
    }

    pub fn remove(&self, key: &[u8]) -> Result<(), CommitError> {
        self.with_mutable(|inner| inner.view.remove(key))
    }

    /// Remove every key in the half-open range `[min, max)`.
    pub fn remove_range(&self, min: &[u8], max: Option<&[u8]>) -> Result<(), CommitError> {
        let range = KeyRange::new(min.to_vec(), max.map(|m| m.to_vec()));
        self.with_mutable(|inner| inner.view.remove_range(range))
    }

    /// Adjust the counter stored under `key` by `delta`.
    pub fn adjust_counter(&self, key: &[u8], delta: i64) -> Result<(), CommitError> {
        self.with_mutable(|inner| inner.view.adjust(key, delta))
    }

    /// Mark the transaction read-only; committing it will never append a log
    /// entry. Fails if writes have already been recorded.
    pub fn set_read_only(&self, read_only: bool) -> Result<(), CommitError> {
        self.with_executing(|inner| {
            if read_only && !inner.view.is_read_only() {
                return Err(CommitError::Invalid(
                    "transaction has writes and cannot become read-only".into(),
                ));
            }
            inner.read_only = read_only;
            Ok(())
        })
    }

    /// Set the commit deadline for this transaction.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), CommitError> {
        self.with_executing(|inner| {
            inner.timeout = timeout;
            Ok(())
        })
    }

    /// Request high-priority conflict resolution for this transaction: other
    /// transactions whose writes would invalidate this one's reads fail
    /// instead.
    pub fn set_high_priority(&self, high_priority: bool) -> Result<(), CommitError> {
        self.with_executing(|_| Ok(()))?;
        self.api
            .send(RaftMsg::SetHighPriority {
                tx_id: self.shared.id,
                high_priority,
            })
            .map_err(|_| CommitError::Retry("raft node is shutting down".into()))
    }

    /// Attach a cluster configuration change to this transaction. Adding or
    /// re-addressing `identity` when `address` is `Some`, removing it when
    /// `None`. Leader-privileged at commit time.
    pub fn config_change(&self, identity: NodeId, address: Option<String>) -> Result<(), CommitError> {
        self.with_executing(|inner| {
            if inner.config_change.is_some() {
                return Err(CommitError::Invalid("transaction already has a config change".into()));
            }
            inner.config_change = Some(ConfigChange { identity, address });
            Ok(())
        })
    }

    /// Watch `key` for changes committed after now. The returned token
    /// completes when the key is mutated by a committed log entry, and may
    /// complete spuriously on shutdown or fallback migration.
    pub async fn watch_key(&self, key: &[u8]) -> Result<WatchToken, CommitError> {
        // Record the read so the watch is positioned against this
        // transaction's view of the key.
        self.with_executing(|inner| {
            inner.view.get(key);
            Ok(())
        })?;
        let (resp_tx, resp_rx) = oneshot::channel();
        self.api
            .send(RaftMsg::WatchKey {
                key: key.to_vec(),
                resp: resp_tx,
            })
            .map_err(|_| CommitError::Retry("raft node is shutting down".into()))?;
        resp_rx.await.map_err(|_| CommitError::Retry("raft node is shutting down".into()))
    }

    /// Commit the transaction.
    ///
    /// Blocks until the transaction is durably committed (and applied
    /// locally), or fails with one of the commit errors; `Retry` and
    /// `Conflict` mean a new transaction should be opened and the work
    /// retried.
    #[tracing::instrument(level = "debug", skip(self), fields(tx_id = self.shared.id))]
    pub async fn commit(&self) -> Result<(), CommitError> {
        let timeout = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.phase {
                TxPhase::Executing => {}
                TxPhase::Completed => {
                    return Err(CommitError::Stale("transaction already committed".into()));
                }
                TxPhase::RolledBack => {
                    return Err(match &inner.failure {
                        Some(failure) => failure.to_commit_error(),
                        None => CommitError::Stale("transaction rolled back".into()),
                    });
                }
                _ => return Err(CommitError::Stale("commit already in progress".into())),
            }

            // Read-only transactions below linearizable consistency commit
            // locally against their snapshot, with no network traffic.
            if inner.consistency != Consistency::Linearizable && inner.is_effectively_read_only() {
                inner.phase = TxPhase::Completed;
                return Ok(());
            }

            inner.phase = TxPhase::CommitReady;
            inner.timeout
        };

        let (resp_tx, resp_rx) = oneshot::channel();
        self.api
            .send(RaftMsg::CommitTx {
                tx_id: self.shared.id,
                resp: resp_tx,
            })
            .map_err(|_| CommitError::Retry("raft node is shutting down".into()))?;

        match tokio::time::timeout(timeout, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommitError::Retry("raft node is shutting down".into())),
            Err(_) => {
                self.shared
                    .inner
                    .lock()
                    .unwrap()
                    .fail(TxFailure::Retry("commit timed out".into()));
                let _ = self.api.send(RaftMsg::RollbackTx { tx_id: self.shared.id });
                Err(CommitError::Timeout)
            }
        }
    }

    /// Roll the transaction back. Idempotent and infallible; rolling back a
    /// completed transaction is a no-op.
    pub fn rollback(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.phase == TxPhase::Completed {
                return;
            }
            if !inner.phase.is_terminal() {
                inner.phase = TxPhase::RolledBack;
            }
        }
        let _ = self.api.send(RaftMsg::RollbackTx { tx_id: self.shared.id });
    }
}

impl<A: AtomicKvStore> Drop for Transaction<A> {
    fn drop(&mut self) {
        let terminal = self.shared.inner.lock().unwrap().phase.is_terminal();
        if !terminal {
            self.rollback();
        } else {
            // Let the core drop its registry entry.
            let _ = self.api.send(RaftMsg::RollbackTx { tx_id: self.shared.id });
        }
    }
}
