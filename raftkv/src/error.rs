//! Error types.

use thiserror::Error;

use crate::NodeId;

/// A fatal error from the Raft node itself.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The node is shutting down and can accept no more work.
    #[error("raft node is shutting down")]
    Shutdown,
    /// A storage failure. Durability can no longer be guaranteed, so the node
    /// steps down and shuts down.
    #[error("storage failure: {0}")]
    Storage(anyhow::Error),
    /// A transport failure while sending a message.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}

pub type RaftResult<T> = Result<T, RaftError>;

/// An error completing a transaction.
///
/// `Retry` and `Conflict` indicate the transaction itself was sound but lost
/// a race; the caller should open a new transaction and try again. `Stale`,
/// `Timeout` and `Invalid` are caller-visible terminal conditions, and
/// `Durability` means the node can no longer guarantee its data and is
/// shutting down.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The transaction is no longer usable (already completed or rolled
    /// back, or its base log entry was overwritten).
    #[error("stale transaction: {0}")]
    Stale(String),
    /// A transient failure; reopen a new transaction and retry.
    #[error("retry transaction: {0}")]
    Retry(String),
    /// The per-transaction or commit deadline elapsed.
    #[error("transaction timed out")]
    Timeout,
    /// The transaction's reads conflict with a committed write or with a
    /// higher-priority transaction.
    #[error("transaction conflict: {0}")]
    Conflict(String),
    /// An argument or state precondition was violated.
    #[error("invalid operation: {0}")]
    Invalid(String),
    /// An I/O or fsync failure; fatal to the node.
    #[error("durability failure: {0}")]
    Durability(String),
    /// The request must be served by the leader; `leader` names it if known.
    #[error("not the cluster leader")]
    NotLeader { leader: Option<NodeId> },
}

impl CommitError {
    /// True if reopening a new transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommitError::Retry(_) | CommitError::Conflict(_) | CommitError::NotLeader { .. })
    }
}

impl From<RaftError> for CommitError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::Shutdown => CommitError::Retry("raft node is shutting down".to_string()),
            RaftError::Storage(err) => CommitError::Durability(err.to_string()),
            RaftError::Transport(err) => CommitError::Retry(err.to_string()),
        }
    }
}

/// An error from the fallback controller.
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback controller is not running")]
    NotRunning,
    #[error("state file error: {0}")]
    StateFile(anyhow::Error),
    #[error("migration failed: {0}")]
    Migration(String),
}
