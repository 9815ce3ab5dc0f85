//! Follower-side handling of streamed snapshot installation.

use crate::core::RaftCore;
use crate::core::RoleKind;
use crate::core::SnapshotReceive;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::kv::KeyRange;
use crate::kv::Writes;
use crate::message::AppendResponse;
use crate::message::InstallSnapshot;
use crate::message::Message;
use crate::message::RaftTransport;
use crate::replication::decode_snapshot_pairs;
use crate::LogId;
use crate::MessageSummary;

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    /// Handle one chunk of a snapshot stream from the leader.
    ///
    /// Each chunk is applied to the store atomically as it arrives; the
    /// first chunk clears the existing contents. Once the last chunk lands
    /// the log is truncated around the snapshot position.
    #[tracing::instrument(level="debug", skip(self, m, sender_address), fields(msg=%m.summary()))]
    pub(super) async fn handle_install_snapshot(&mut self, m: InstallSnapshot, sender_address: String) -> RaftResult<()> {
        if m.header.term < self.log.current_term() {
            return Ok(());
        }
        if self.target_role == RoleKind::Candidate {
            self.set_target_role(RoleKind::Follower);
        }
        if self.target_role == RoleKind::Leader {
            // Same-term duplicate leadership is resolved on the append path;
            // a snapshot stream from a rival leader is just dropped.
            tracing::error!(peer=%m.header.sender_id, "leader received a snapshot stream; dropping");
            return Ok(());
        }

        self.current_leader = Some(m.header.sender_id.clone());
        self.leader_address = Some(sender_address.clone());
        self.update_election_timeout();

        // Sequence the chunk against the receive state.
        if m.pair_index == 0 {
            let config = match &m.config {
                Some(config) => config.clone(),
                None => {
                    tracing::warn!("dropping snapshot stream without a config in its first chunk");
                    return Ok(());
                }
            };
            self.snapshot_receive = Some(SnapshotReceive {
                term: m.snapshot_term,
                index: m.snapshot_index,
                config,
                next_pair_index: 0,
                previous_key: None,
            });
        }

        let receive = match &mut self.snapshot_receive {
            Some(receive)
                if receive.term == m.snapshot_term
                    && receive.index == m.snapshot_index
                    && receive.next_pair_index == m.pair_index =>
            {
                receive
            }
            _ => {
                // A dropped or reordered chunk invalidates the stream; the
                // leader will time the transfer out and restart it.
                tracing::warn!(pair_index = m.pair_index, "out-of-sequence snapshot chunk, aborting receive");
                self.snapshot_receive = None;
                return Ok(());
            }
        };

        let (pairs, new_previous_key) = match decode_snapshot_pairs(&m.data, receive.previous_key.as_deref()) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(error=%err, "undecodable snapshot chunk, aborting receive");
                self.snapshot_receive = None;
                return Ok(());
            }
        };

        receive.next_pair_index += pairs.len() as u64;
        if let Some(key) = new_previous_key {
            receive.previous_key = Some(key);
        }

        // Apply this chunk atomically. The first chunk also clears whatever
        // state the store held before.
        let mut writes = Writes::new();
        if m.pair_index == 0 {
            writes.remove_range(KeyRange::full());
        }
        for (key, value) in pairs {
            writes.put(key, value);
        }
        if !writes.is_empty() {
            self.store
                .mutate(writes, true)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
        }

        if m.last_chunk {
            let receive = self.snapshot_receive.take().expect("receive state present");
            let snapshot_id = LogId::new(receive.term, receive.index);
            tracing::info!(snapshot=%snapshot_id, "snapshot installation complete");
            self.log
                .reset_to_snapshot(snapshot_id, receive.config)
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.commit_index = self.commit_index.max(receive.index);
            self.refresh_cluster_config();
            self.check_waiting_transactions();
            self.report_metrics();

            // Tell the leader where we now stand so it resumes ordinary
            // replication directly above the snapshot.
            let response = Message::AppendResponse(AppendResponse {
                header: self.header_to(&m.header.sender_id),
                success: true,
                match_index: receive.index,
                last_log_index: receive.index,
                leader_timestamp: 0,
            });
            self.send_to_address(&sender_address, response);
        }
        Ok(())
    }
}
