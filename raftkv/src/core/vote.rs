//! Elections: vote requests, vote grants and the optional pre-election
//! liveness probe.

use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::RaftCore;
use crate::core::RoleKind;
use crate::error::RaftResult;
use crate::kv::AtomicKvStore;
use crate::message::GrantVote;
use crate::message::Message;
use crate::message::PingRequest;
use crate::message::PingResponse;
use crate::message::RaftTransport;
use crate::message::RequestVote;

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    /// Handle a RequestVote message (any role).
    ///
    /// A higher term has already been adopted by preprocessing; what remains
    /// is deciding whether to grant. The vote is durably recorded before the
    /// grant is sent.
    #[tracing::instrument(level = "trace", skip(self, m, sender_address), fields(candidate=%m.header.sender_id))]
    pub(super) async fn handle_request_vote(&mut self, m: RequestVote, sender_address: String) -> RaftResult<()> {
        if m.header.term < self.log.current_term() {
            return Ok(());
        }
        if !self.is_voter() {
            return Ok(());
        }
        // A current leader does not vote against itself; it either has this
        // term already or preprocessing just demoted it.
        if self.target_role == RoleKind::Leader {
            return Ok(());
        }

        let can_vote = match self.log.voted_for() {
            None => true,
            Some(candidate) => candidate == &m.header.sender_id,
        };
        // §5.4: only vote for candidates whose log is at least as complete.
        let up_to_date = (m.last_log_term, m.last_log_index) >= (self.log.last_term(), self.log.last_index());

        if !can_vote || !up_to_date {
            tracing::debug!(
                candidate=%m.header.sender_id,
                can_vote,
                up_to_date,
                "withholding vote"
            );
            return Ok(());
        }

        let term = self.log.current_term();
        let cluster_id = self.log.cluster_id();
        self.log
            .save_term_and_vote(term, Some(m.header.sender_id.clone()), cluster_id)
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_election_timeout();

        tracing::debug!(candidate=%m.header.sender_id, term, "granting vote");
        let grant = Message::GrantVote(GrantVote {
            header: self.header_to(&m.header.sender_id),
        });
        self.send_to_address(&sender_address, grant);
        Ok(())
    }

    /// Begin a new election term: bump the term, vote for self, persist,
    /// and solicit votes from every other member.
    pub(super) async fn start_new_election_term(&mut self) -> RaftResult<()> {
        self.update_election_timeout();
        let new_term = self.log.current_term() + 1;
        let cluster_id = self.log.cluster_id();
        self.log
            .save_term_and_vote(new_term, Some(self.id.clone()), cluster_id)
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.current_leader = None;
        self.leader_address = None;
        self.lease_timeout = None;
        self.report_metrics();

        tracing::info!(id=%self.id, term = new_term, "campaigning for leadership");

        let last_log_term = self.log.last_term();
        let last_log_index = self.log.last_index();
        let peers: Vec<_> = self
            .cluster_config
            .iter()
            .filter(|(identity, _)| *identity != &self.id)
            .map(|(identity, address)| (identity.clone(), address.clone()))
            .collect();
        for (identity, address) in peers {
            let msg = Message::RequestVote(RequestVote {
                header: self.header_to(&identity),
                last_log_term,
                last_log_index,
            });
            self.send_to_address(&address, msg);
        }
        Ok(())
    }

    /// The follower's election timer fired.
    ///
    /// Without probing this transitions straight to candidate. With probing
    /// enabled the node first pings its peers and campaigns only if at
    /// least half of the other members answer within one heartbeat
    /// interval, which keeps a partitioned minority from driving terms up
    /// forever.
    pub(super) fn handle_election_timeout(&mut self) {
        if !self.is_voter() {
            self.update_election_timeout();
            return;
        }

        if !self.config.probe_before_election {
            self.update_election_timeout();
            self.set_target_role(RoleKind::Candidate);
            return;
        }

        let other_members = self.cluster_config.len().saturating_sub(1);
        let needed = other_members / 2;
        if self.probe_round.is_some() && self.probe_responses.len() >= needed {
            self.probe_round = None;
            self.probe_responses.clear();
            self.update_election_timeout();
            self.set_target_role(RoleKind::Candidate);
            return;
        }

        tracing::debug!(
            id=%self.id,
            responders = self.probe_responses.len(),
            needed,
            "probing peers before calling an election"
        );
        self.probe_responses.clear();
        self.probe_round = Some(Instant::now());
        let timestamp = self.now_ts();
        let peers: Vec<_> = self
            .cluster_config
            .iter()
            .filter(|(identity, _)| *identity != &self.id)
            .map(|(identity, address)| (identity.clone(), address.clone()))
            .collect();
        for (identity, address) in peers {
            let msg = Message::PingRequest(PingRequest {
                header: self.header_to(&identity),
                timestamp,
            });
            self.send_to_address(&address, msg);
        }

        // Tally this probe round after one heartbeat interval, not a full
        // election timeout.
        self.next_election_timeout =
            Some(Instant::now() + Duration::from_millis(self.config.heartbeat_interval));
    }

    pub(super) fn handle_ping_request(&mut self, m: PingRequest, sender_address: String) {
        let response = Message::PingResponse(PingResponse {
            header: self.header_to(&m.header.sender_id),
            timestamp: m.timestamp,
        });
        self.send_to_address(&sender_address, response);
    }

    pub(super) fn handle_ping_response(&mut self, m: PingResponse) {
        if self.probe_round.is_some() {
            self.probe_responses.insert(m.header.sender_id);
        }
    }
}
