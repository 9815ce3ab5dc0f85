//! Leader-side replication: heartbeats, pipelined appends, commit
//! advancement, the leader lease, and snapshot transfers.

use std::sync::Arc;

use tokio::time::Instant;

use crate::core::LeaderState;
use crate::core::RoleKind;
use crate::core::SNAPSHOT_CHUNKS_PER_TICK;
use crate::core::SNAPSHOT_TRANSMIT_TIMEOUT;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::kv::Writes;
use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::ConfigChange;
use crate::message::InstallSnapshot;
use crate::message::LogEntry;
use crate::message::Message;
use crate::message::RaftTransport;
use crate::replication::compute_lease_timeout;
use crate::replication::FollowerRep;
use crate::replication::SnapshotTransmit;
use crate::replication::TransmitHandle;
use crate::txn::TxFailure;
use crate::NodeId;

/// Applied entries kept back from eager trimming so open transactions with
/// older bases can still be conflict-checked.
const CONFLICT_CHECK_WINDOW: u64 = 128;

impl<'a, A: AtomicKvStore, T: RaftTransport> LeaderState<'a, A, T> {
    /// One heartbeat tick: refresh the lease, wake any transactions it now
    /// covers, drive replication to every follower, and trim retained
    /// applied entries every member already holds.
    pub(super) async fn on_heartbeat(&mut self) -> RaftResult<()> {
        self.update_lease();
        self.core.check_waiting_transactions();
        let ids: Vec<NodeId> = self.followers.keys().cloned().collect();
        for identity in ids {
            self.drive_follower(&identity).await?;
        }

        // Entry files below every follower's match index are no longer
        // needed for catch-up. A window is kept back for conflict checking
        // of still-open transactions.
        if let Some(min_match) = self.followers.values().map(|fr| fr.match_index).min() {
            let cutoff = min_match.min(self.core.log.last_applied().index.saturating_sub(CONFLICT_CHECK_WINDOW));
            if cutoff > 0 {
                self.core.log.discard_applied(cutoff);
            }
        }
        Ok(())
    }

    /// Reconcile the follower table with the current cluster config.
    ///
    /// Members no longer in the config keep their replication state until
    /// they have replicated the change that removed them, so they still
    /// learn about their own removal.
    pub(super) fn refresh_followers(&mut self) {
        let last_index = self.core.log.last_index();
        for (identity, address) in self.core.cluster_config.clone() {
            if identity == self.core.id {
                continue;
            }
            match self.followers.get_mut(&identity) {
                Some(fr) => fr.address = address,
                None => {
                    tracing::debug!(follower=%identity, "tracking new follower");
                    self.followers.insert(
                        identity.clone(),
                        FollowerRep::new(identity, address, last_index),
                    );
                }
            }
        }

        // Members no longer in the config are dropped only once they have
        // replicated the config change that removed them.
        let keep_until = self.last_config_change_index;
        let config = self.core.cluster_config.clone();
        self.followers
            .retain(|identity, fr| config.contains_key(identity) || fr.match_index < keep_until);
        let followers = &self.followers;
        self.transmits.retain(|identity, _| followers.contains_key(identity));
    }

    /// Recompute the lease timeout from follower echoes.
    pub(super) fn update_lease(&mut self) {
        let timestamps: Vec<Option<u64>> = self
            .core
            .cluster_config
            .keys()
            .filter(|identity| **identity != self.core.id)
            .map(|identity| self.followers.get(identity).and_then(|fr| fr.leader_timestamp))
            .collect();
        self.core.lease_timeout =
            compute_lease_timeout(&timestamps, self.core.config.election_timeout_min);
        self.core.single_follower_echo = match timestamps.as_slice() {
            [echo] => *echo,
            _ => None,
        };
    }

    /// Send whatever this follower needs next: snapshot chunks, pipelined
    /// entries, or a bare probe.
    async fn drive_follower(&mut self, identity: &NodeId) -> RaftResult<()> {
        let mut fr = match self.followers.remove(identity) {
            Some(fr) => fr,
            None => return Ok(()),
        };

        if let Some(handle) = &fr.snapshot_transmit {
            if handle.started.elapsed() > SNAPSHOT_TRANSMIT_TIMEOUT {
                tracing::warn!(follower=%identity, "snapshot transfer timed out, aborting");
                fr.snapshot_transmit = None;
                self.transmits.remove(identity);
            } else {
                self.send_snapshot_chunks(&mut fr);
                self.followers.insert(identity.clone(), fr);
                return Ok(());
            }
        }

        // If the entries this follower needs are no longer retained, stream
        // a snapshot of the applied state instead.
        let needs_snapshot = fr.next_index < self.core.log.first_retained_index()
            || (fr.next_index > 1 && self.core.log.term_at(fr.next_index - 1).is_none());
        if needs_snapshot {
            match self.core.store.snapshot().await {
                Ok(snapshot) => {
                    let snapshot_id = self.core.log.last_applied();
                    let config = self.core.log.metadata().last_applied_config.clone();
                    tracing::info!(
                        follower=%identity,
                        snapshot=%snapshot_id,
                        "follower is behind the retained log, starting snapshot transfer"
                    );
                    fr.snapshot_transmit = Some(TransmitHandle { started: Instant::now() });
                    self.transmits.insert(
                        identity.clone(),
                        SnapshotTransmit::new(snapshot, snapshot_id.term, snapshot_id.index, config),
                    );
                    self.send_snapshot_chunks(&mut fr);
                }
                Err(err) => {
                    tracing::error!(error=%err, "could not snapshot the store for transfer");
                }
            }
            self.followers.insert(identity.clone(), fr);
            return Ok(());
        }

        let sent = if fr.synced { self.send_entries(&mut fr) } else { 0 };
        if sent == 0 {
            self.send_probe(&mut fr);
        }
        self.followers.insert(identity.clone(), fr);
        Ok(())
    }

    /// Queue up to a few snapshot chunks for the follower. When the final
    /// chunk has been queued the transfer ends and ordinary replication
    /// resumes directly above the snapshot.
    fn send_snapshot_chunks(&mut self, fr: &mut FollowerRep) {
        let chunk_size = self.core.config.snapshot_chunk_size as usize;
        for _ in 0..SNAPSHOT_CHUNKS_PER_TICK {
            let (chunk, snapshot_term, snapshot_index, config) = match self.transmits.get_mut(&fr.identity) {
                Some(transmit) => match transmit.next_chunk(chunk_size) {
                    Some(chunk) => {
                        let config = if chunk.pair_index == 0 {
                            Some(transmit.config.clone())
                        } else {
                            None
                        };
                        (chunk, transmit.term, transmit.index, config)
                    }
                    None => break,
                },
                None => {
                    fr.snapshot_transmit = None;
                    return;
                }
            };
            let last_chunk = chunk.last_chunk;
            let msg = Message::InstallSnapshot(InstallSnapshot {
                header: self.core.header_to(&fr.identity),
                snapshot_term,
                snapshot_index,
                pair_index: chunk.pair_index,
                config,
                last_chunk,
                data: chunk.data,
            });
            self.core.send_to_address(&fr.address, msg);
            if last_chunk {
                tracing::info!(follower=%fr.identity, "snapshot transfer fully queued");
                fr.snapshot_transmit = None;
                fr.next_index = snapshot_index + 1;
                fr.synced = false;
                self.transmits.remove(&fr.identity);
                return;
            }
        }
    }

    /// Pipeline entries to a synced follower, bounded by the configured
    /// window of unacknowledged entries.
    fn send_entries(&mut self, fr: &mut FollowerRep) -> usize {
        let last_index = self.core.log.last_index();
        let window = self.core.config.pipeline_window;
        let mut sent = 0;
        while fr.next_index <= last_index && fr.next_index - fr.match_index <= window {
            let index = fr.next_index;
            let msg = match self.build_entry_request(fr, index) {
                Some(msg) => msg,
                None => break,
            };
            self.core.send_to_address(&fr.address.clone(), msg);
            fr.next_index += 1;
            fr.leader_commit = self.core.commit_index;
            sent += 1;
        }
        sent
    }

    fn build_entry_request(&mut self, fr: &FollowerRep, index: u64) -> Option<Message> {
        let prev_log_index = index - 1;
        let prev_log_term = self.core.log.term_at(prev_log_index)?;

        let (entry_term, payload) = match self.core.log.entry_at(index) {
            Some(entry) => (entry.log_id.term, entry.encode_payload()),
            None => match self.core.log.load_entry(index) {
                Ok(Some(entry)) => (entry.log_id.term, entry.encode_payload()),
                Ok(None) => return None,
                Err(err) => {
                    tracing::error!(error=%err, index, "could not load log entry for replication");
                    return None;
                }
            },
        };

        let mutation_data = if fr.skip_data_indexes.contains(&index) {
            None
        } else {
            Some(payload)
        };

        Some(Message::AppendRequest(AppendRequest {
            header: self.core.header_to(&fr.identity),
            leader_timestamp: self.core.now_ts(),
            leader_lease_timeout: self.core.lease_timeout,
            leader_commit: self.core.commit_index,
            prev_log_term,
            prev_log_index,
            entry_term: Some(entry_term),
            mutation_data,
        }))
    }

    /// Send a bare AppendRequest: a heartbeat, a consistency probe, and the
    /// vehicle for commit index and lease updates.
    fn send_probe(&mut self, fr: &mut FollowerRep) {
        let prev_log_index = (fr.next_index - 1).min(self.core.log.last_index());
        let prev_log_term = match self.core.log.term_at(prev_log_index) {
            Some(term) => term,
            None => return,
        };
        let msg = Message::AppendRequest(AppendRequest {
            header: self.core.header_to(&fr.identity),
            leader_timestamp: self.core.now_ts(),
            leader_lease_timeout: self.core.lease_timeout,
            leader_commit: self.core.commit_index,
            prev_log_term,
            prev_log_index,
            entry_term: None,
            mutation_data: None,
        });
        self.core.send_to_address(&fr.address.clone(), msg);
        fr.leader_commit = self.core.commit_index;
    }

    /// Handle a follower's AppendResponse.
    pub(super) async fn handle_append_response(&mut self, m: AppendResponse) -> RaftResult<()> {
        if m.header.term < self.core.log.current_term() {
            return Ok(());
        }
        let identity = m.header.sender_id.clone();
        let mut fr = match self.followers.remove(&identity) {
            Some(fr) => fr,
            None => return Ok(()),
        };

        if m.leader_timestamp > 0 && Some(m.leader_timestamp) > fr.leader_timestamp {
            fr.leader_timestamp = Some(m.leader_timestamp);
        }

        if m.success {
            if m.match_index > fr.match_index {
                fr.match_index = m.match_index;
            }
            fr.next_index = fr
                .next_index
                .max(fr.match_index + 1)
                .min(self.core.log.last_index() + 1);
            fr.synced = true;
            let floor = fr.match_index;
            fr.skip_data_indexes.retain(|index| *index > floor);
            self.send_entries(&mut fr);
        } else {
            fr.synced = false;
            let backed_off = if m.last_log_index + 1 < fr.next_index {
                m.last_log_index + 1
            } else {
                fr.next_index.saturating_sub(1)
            };
            fr.next_index = backed_off.max(fr.match_index + 1).max(1);
            // Whatever we thought it had, resend with payloads attached.
            fr.skip_data_indexes.clear();
            self.send_probe(&mut fr);
        }

        // A removed member that has replicated its own removal no longer
        // needs a replication stream.
        let retire = !self.core.cluster_config.contains_key(&identity)
            && fr.match_index >= self.last_config_change_index;
        if retire {
            tracing::debug!(follower=%identity, "removed member is up to date, dropping its stream");
            self.transmits.remove(&identity);
        } else {
            self.followers.insert(identity, fr);
        }
        self.update_lease();
        self.advance_commit().await?;
        self.core.check_waiting_transactions();
        Ok(())
    }

    /// Advance the commit index to the highest replicated-on-a-majority
    /// index, subject to the current-term restriction (waived when every
    /// member holds the entry).
    pub(super) async fn advance_commit(&mut self) -> RaftResult<()> {
        let members = self.core.cluster_config.len();
        if members == 0 {
            return Ok(());
        }
        let majority = members / 2 + 1;
        let current_term = self.core.log.current_term();
        let self_counts = if self.core.cluster_config.contains_key(&self.core.id) { 1 } else { 0 };

        let mut advanced = false;
        for n in ((self.core.commit_index + 1)..=self.core.log.last_index()).rev() {
            let count = self_counts
                + self
                    .followers
                    .values()
                    .filter(|fr| self.core.cluster_config.contains_key(&fr.identity) && fr.match_index >= n)
                    .count();
            if count < majority {
                continue;
            }
            if self.core.log.term_at(n) == Some(current_term) || count == members {
                tracing::debug!(commit = n, "commit index advanced");
                self.core.commit_index = n;
                advanced = true;
                break;
            }
        }

        if advanced {
            self.core.apply_committed_log_entries().await?;

            // Let synced, idle followers learn the new commit index now
            // rather than at the next heartbeat.
            let ids: Vec<NodeId> = self.followers.keys().cloned().collect();
            for identity in ids {
                if let Some(mut fr) = self.followers.remove(&identity) {
                    if fr.synced
                        && fr.snapshot_transmit.is_none()
                        && fr.leader_commit < self.core.commit_index
                        && fr.next_index > self.core.log.last_index()
                    {
                        self.send_probe(&mut fr);
                    }
                    self.followers.insert(identity, fr);
                }
            }

            self.maybe_step_down_after_removal();
        }
        Ok(())
    }

    /// A leader removed from the cluster steps down once its removal is
    /// committed.
    fn maybe_step_down_after_removal(&mut self) {
        if self.core.cluster_config.contains_key(&self.core.id) {
            return;
        }
        let change_pending = self
            .core
            .log
            .entries_after(self.core.commit_index)
            .any(|e| e.config_change.is_some());
        if change_pending {
            return;
        }
        tracing::info!(id=%self.core.id, "removed from the cluster, stepping down");
        self.core.current_leader = None;
        self.core.leader_address = None;
        self.core.lease_timeout = None;
        self.core.set_target_role(RoleKind::Follower);
    }

    /// Append a new entry in the current term, rebase in-flight
    /// transactions over it, and start replicating it.
    pub(super) async fn append_entry(
        &mut self,
        writes: Writes,
        config_change: Option<ConfigChange>,
    ) -> Result<Arc<LogEntry>, TxFailure> {
        let term = self.core.log.current_term();
        let entry = match self.core.log.append(term, writes, config_change) {
            Ok(entry) => entry,
            Err(err) => {
                let message = err.to_string();
                let _ = self.core.map_fatal_storage_error(err);
                return Err(TxFailure::Durability(message));
            }
        };
        tracing::debug!(entry=%entry.log_id, "appended log entry");

        if entry.config_change.is_some() {
            self.last_config_change_index = entry.log_id.index;
            self.core.refresh_cluster_config();
            self.refresh_followers();
        }
        self.core.rebase_open_transactions(&entry);
        self.core.report_metrics();

        let ids: Vec<NodeId> = self.followers.keys().cloned().collect();
        for identity in ids {
            if let Some(mut fr) = self.followers.remove(&identity) {
                if fr.synced && fr.snapshot_transmit.is_none() {
                    self.send_entries(&mut fr);
                }
                self.followers.insert(identity, fr);
            }
        }

        self.advance_commit().await.map_err(|_| {
            TxFailure::Durability("state machine apply failed".into())
        })?;
        Ok(entry)
    }
}
