//! A replicated, strongly consistent, transactional key/value store built on
//! the Raft consensus algorithm, together with a partition-tolerant fallback
//! layer that opportunistically switches between the replicated store and a
//! local standalone store when the cluster is unreachable.
//!
//! The crate provides three tightly coupled pieces:
//!
//! - the replication engine itself ([`raft::RaftKv`]): leader election, log
//!   replication, snapshot installation, membership change and commitment;
//! - the MVCC transaction layer ([`txn::Transaction`]) offering linearizable,
//!   eventual and uncommitted consistency on top of the replicated log;
//! - the fallback controller ([`fallback::FallbackKv`]) with its availability
//!   detector and merge-on-transition protocol.
//!
//! The single-node storage primitive ([`kv::AtomicKvStore`]) and the message
//! transport ([`message::RaftTransport`]) are traits supplied by the caller;
//! the `memkv` crate provides an in-memory store implementation suitable for
//! testing and for the fallback controller's standalone store.

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod fallback;
pub mod kv;
pub mod message;
pub mod metrics;
pub mod raft;
pub(crate) mod replication;
pub mod storage;
pub mod txn;
pub mod watch;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;
pub use config::Config;
pub use config::ConfigBuilder;
pub use error::CommitError;
pub use error::RaftError;
pub use fallback::FallbackKv;
pub use fallback::FallbackStatus;
pub use fallback::FallbackTarget;
pub use fallback::FallbackTransaction;
pub use fallback::MergeStrategy;
pub use fallback::MergeTx;
pub use fallback::MigrationFilter;
pub use fallback::NullMergeStrategy;
pub use fallback::OverwriteMergeStrategy;
pub use kv::AtomicKvStore;
pub use kv::KeyRange;
pub use kv::KeyRanges;
pub use kv::KvPair;
pub use kv::KvSnapshot;
pub use kv::MutableView;
pub use kv::Reads;
pub use kv::Writes;
pub use message::RaftTransport;
pub use metrics::RaftMetrics;
pub use metrics::RoleKind;
pub use raft::RaftKv;
pub use txn::Consistency;
pub use txn::Transaction;
pub use watch::WatchToken;

/// A node's stable identity within a cluster.
///
/// Identities are compared lexicographically; the comparison is used to
/// deterministically resolve two nodes claiming leadership of the same term.
pub type NodeId = String;

/// The id of a log entry: its term and its position in the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait for producing a one-line summary of a message for logging.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
