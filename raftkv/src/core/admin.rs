//! Cluster formation and configuration change rules.

use tokio::sync::oneshot;

use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::RoleKind;
use crate::error::CommitError;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::kv::Writes;
use crate::message::ConfigChange;
use crate::message::RaftTransport;
use crate::txn::TxFailure;

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    /// Form a new single-node cluster with this node as its only member.
    ///
    /// Only a pristine node may do this: no log, no term, no cluster. The
    /// node picks a fresh cluster id, votes for itself in term 1 and appends
    /// the config entry adding itself, then assumes leadership.
    pub(super) async fn handle_initialize(
        &mut self,
        address: String,
        resp: oneshot::Sender<Result<(), CommitError>>,
    ) -> RaftResult<()> {
        if self.log.last_index() != 0 || self.log.current_term() != 0 || self.log.cluster_id().is_some() {
            let _ = resp.send(Err(CommitError::Invalid(
                "node already has log state or belongs to a cluster".into(),
            )));
            return Ok(());
        }

        let cluster_id: u32 = rand::random();
        tracing::info!(id=%self.id, cluster_id, "forming new single-node cluster");

        self.log
            .save_term_and_vote(1, Some(self.id.clone()), Some(cluster_id))
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.log
            .append(
                1,
                Writes::new(),
                Some(ConfigChange {
                    identity: self.id.clone(),
                    address: Some(address),
                }),
            )
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.refresh_cluster_config();
        self.current_leader = Some(self.id.clone());
        self.set_target_role(RoleKind::Leader);
        let _ = resp.send(Ok(()));
        Ok(())
    }
}

impl<'a, A: AtomicKvStore, T: RaftTransport> LeaderState<'a, A, T> {
    /// Enforce the configuration change preconditions:
    ///
    /// 1. the leader has committed at least one entry in its current term;
    /// 2. no other config change is in the log and uncommitted;
    /// 3. the last remaining member cannot be removed.
    pub(super) fn validate_config_change(&self, change: &ConfigChange) -> Result<(), TxFailure> {
        if self.core.commit_index < self.first_term_index {
            return Err(TxFailure::Retry(
                "leader has not yet committed an entry in its term".into(),
            ));
        }
        let change_pending = self
            .core
            .log
            .entries_after(self.core.commit_index)
            .any(|e| e.config_change.is_some());
        if change_pending {
            return Err(TxFailure::Retry("another configuration change is in progress".into()));
        }
        if change.address.is_none() {
            if !self.core.cluster_config.contains_key(&change.identity) {
                return Err(TxFailure::Invalid(format!(
                    "{} is not a cluster member",
                    change.identity
                )));
            }
            if self.core.cluster_config.len() == 1 {
                return Err(TxFailure::Invalid(
                    "cannot remove the last remaining cluster member".into(),
                ));
            }
        }
        Ok(())
    }
}
