//! Observability into a running Raft node.
//!
//! Every state change publishes a [`RaftMetrics`] snapshot on a watch
//! channel; [`Wait`] lets callers await a condition on that stream with a
//! timeout.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::message::ClusterConfig;
use crate::LogId;
use crate::NodeId;

/// The externally visible role of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    /// Replicating entries from the leader.
    Follower,
    /// Campaigning to become leader.
    Candidate,
    /// The cluster leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

/// A snapshot of a node's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub role: RoleKind,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: LogId,
    pub commit_index: u64,
    pub current_leader: Option<NodeId>,
    pub config: ClusterConfig,
    /// On the leader of a two-member cluster: how long ago the lone follower
    /// last echoed a heartbeat, in milliseconds. `None` elsewhere, or when
    /// the follower has never been heard from.
    pub single_follower_echo_age_ms: Option<u64>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: RoleKind::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: LogId::default(),
            commit_index: 0,
            current_leader: None,
            config: ClusterConfig::new(),
            single_follower_echo_age_ms: None,
        }
    }
}

/// An error from [`Wait`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),
    #[error("raft node shut down while waiting for {0}")]
    Shutdown(String),
}

/// Waits for a [`RaftMetrics`] condition to hold, up to a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for the latest metrics.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        let deadline = Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {}", msg);
                return Ok(latest);
            }

            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown(msg.to_string())),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the log to reach `want_log` entries.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.last_applied.index >= want_log,
            &format!("{} log >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for the node to enter `want_role`.
    pub async fn role(&self, want_role: RoleKind, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.role == want_role,
            &format!("{} role == {:?}", msg, want_role),
        )
        .await
    }

    /// Wait for the node to observe `leader` as the current leader.
    pub async fn current_leader(&self, leader: NodeId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader.as_ref() == Some(&leader),
            &format!("{} leader == {}", msg, leader),
        )
        .await
    }

    /// Wait for `commit_index` to reach `want`.
    pub async fn commit(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.commit_index >= want,
            &format!("{} commit >= {}", msg, want),
        )
        .await
    }

    /// Wait for the cluster config to contain exactly `members`.
    pub async fn members(&self, members: Vec<NodeId>, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.config.keys().cloned().collect::<Vec<_>>() == members,
            &format!("{} members == {:?}", msg, members),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_when_condition_holds() {
        let (tx, rx) = watch::channel(RaftMetrics::new_initial("node-a".into()));
        let wait = Wait {
            timeout: Duration::from_millis(500),
            rx,
        };

        let handle = tokio::spawn(async move {
            let mut m = RaftMetrics::new_initial("node-a".into());
            m.current_term = 2;
            let _ = tx.send(m);
        });

        let got = wait.metrics(|m| m.current_term == 2, "term 2").await.unwrap();
        assert_eq!(got.current_term, 2);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out() {
        let (_tx, rx) = watch::channel(RaftMetrics::new_initial("node-a".into()));
        let wait = Wait {
            timeout: Duration::from_millis(50),
            rx,
        };
        let err = wait.metrics(|m| m.current_term == 99, "never").await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_, _)));
    }
}
