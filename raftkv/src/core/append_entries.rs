//! Follower-side handling of log replication requests.

use crate::core::RaftCore;
use crate::core::RoleKind;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::message::decode_entry_payload;
use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::Message;
use crate::message::RaftTransport;
use crate::LogId;
use crate::MessageSummary;

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    /// Handle an AppendRequest: adopt the sender as leader, run the log
    /// consistency check, append or truncate as needed, and advance the
    /// commit index.
    #[tracing::instrument(level="trace", skip(self, m, sender_address), fields(msg=%m.summary()))]
    pub(super) async fn handle_append_request(&mut self, m: AppendRequest, sender_address: String) -> RaftResult<()> {
        let current_term = self.log.current_term();

        // A stale leader gets a failure response carrying our term so it can
        // step down.
        if m.header.term < current_term {
            let response = self.append_response(&m, false);
            self.send_to_address(&sender_address, response);
            return Ok(());
        }

        // Two nodes claiming leadership of the same term cannot both be
        // right; the lexicographically smaller identity defers.
        if self.target_role == RoleKind::Leader && m.header.term == current_term {
            if self.id < m.header.sender_id {
                tracing::error!(
                    peer=%m.header.sender_id,
                    term = current_term,
                    "another leader claims this term; deferring by identity order"
                );
                self.current_leader = None;
                self.leader_address = None;
                self.lease_timeout = None;
                self.set_target_role(RoleKind::Follower);
            } else {
                tracing::error!(
                    peer=%m.header.sender_id,
                    term = current_term,
                    "another leader claims this term; ignoring by identity order"
                );
                return Ok(());
            }
        }

        // A candidate observing a leader of its own term reverts.
        if self.target_role == RoleKind::Candidate {
            self.set_target_role(RoleKind::Follower);
        }

        // Adopt the sender as the known leader and reset the election timer.
        if self.current_leader.as_ref() != Some(&m.header.sender_id) {
            tracing::debug!(leader=%m.header.sender_id, term = m.header.term, "following new leader");
            self.current_leader = Some(m.header.sender_id.clone());
        }
        self.leader_address = Some(sender_address.clone());
        self.lease_timeout = m.leader_lease_timeout;
        self.update_election_timeout();

        // Log consistency check: accept if the previous position matches.
        let prev_ok = m.prev_log_index == 0
            || match self.log.term_at(m.prev_log_index) {
                Some(term) => term == m.prev_log_term,
                // Below the retained window means the entry was applied and
                // discarded; applied entries are committed, and committed
                // prefixes cannot disagree.
                None => m.prev_log_index <= self.log.last_applied().index,
            };
        if !prev_ok {
            let response = self.append_response(&m, false);
            self.send_to_address(&sender_address, response);
            return Ok(());
        }

        if let Some(entry_term) = m.entry_term {
            let index = m.prev_log_index + 1;
            let mut already_present = false;

            if index <= self.log.last_index() {
                let last_applied = self.log.last_applied().index;
                match self.log.term_at(index) {
                    Some(term) if term == entry_term => already_present = true,
                    Some(_) if index <= last_applied => {
                        // Committed entries never legitimately disagree.
                        tracing::error!(index, "leader disagrees with applied entries; dropping request");
                        return Ok(());
                    }
                    // Below the retained window: applied, hence committed,
                    // hence this very entry.
                    None if index <= last_applied => already_present = true,
                    _ => {
                        // A conflicting uncommitted suffix is overwritten.
                        self.log.discard_from(index).map_err(|err| self.map_fatal_storage_error(err))?;
                        self.refresh_cluster_config();
                    }
                }
            }

            // A pipelined predecessor may have been dropped by the
            // transport, leaving a gap; report failure so the leader backs
            // off and resends.
            if !already_present && index != self.log.last_index() + 1 {
                let response = self.append_response(&m, false);
                self.send_to_address(&sender_address, response);
                return Ok(());
            }

            if !already_present {
                let payload = match &m.mutation_data {
                    Some(data) => match decode_entry_payload(data) {
                        Ok(payload) => Some(payload),
                        Err(err) => {
                            tracing::warn!(error=%err, "dropping append with undecodable entry payload");
                            return Ok(());
                        }
                    },
                    // No data: this node is expected to hold the payload
                    // from a commit it forwarded.
                    None => match self.pending_entry_data.remove(&index) {
                        Some((term, writes, config_change)) if term == entry_term => {
                            Some((writes, config_change))
                        }
                        other => {
                            if let Some(data) = other {
                                self.pending_entry_data.insert(index, data);
                            }
                            None
                        }
                    },
                };

                match payload {
                    Some((writes, config_change)) => {
                        let entry = self
                            .log
                            .append_with_id(LogId::new(entry_term, index), writes, config_change)
                            .map_err(|err| self.map_fatal_storage_error(err))?;
                        self.refresh_cluster_config();
                        self.rebase_open_transactions(&entry);
                        self.report_metrics();
                    }
                    None => {
                        // Ask the leader to resend with the payload attached.
                        let response = self.append_response(&m, false);
                        self.send_to_address(&sender_address, response);
                        return Ok(());
                    }
                }
            }
        }

        // The leader's commit index, clamped to our log and kept monotonic.
        let new_commit = m.leader_commit.min(self.log.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }
        self.apply_committed_log_entries().await?;

        let response = self.append_response(&m, true);
        self.send_to_address(&sender_address, response);
        Ok(())
    }

    fn append_response(&self, m: &AppendRequest, success: bool) -> Message {
        let last_log_index = self.log.last_index();
        let match_index = if success {
            // The position this request established, not our whole log: we
            // may hold an uncommitted suffix the leader knows nothing about.
            match m.entry_term {
                Some(_) => m.prev_log_index + 1,
                None => m.prev_log_index.min(last_log_index),
            }
        } else {
            0
        };
        Message::AppendResponse(AppendResponse {
            header: self.header_to(&m.header.sender_id),
            success,
            match_index,
            last_log_index,
            leader_timestamp: m.leader_timestamp,
        })
    }
}
