//! The transaction commit paths: local commits on the leader, forwarded
//! commits from followers and candidates, rebase, commit waiting and apply.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::error::CommitError;
use crate::kv::AtomicKvStore;
use crate::kv::MutableView;
use crate::kv::Reads;
use crate::kv::Writes;
use crate::message::CommitOutcome;
use crate::message::CommitRequest;
use crate::message::CommitResponse;
use crate::message::ConfigChange;
use crate::message::LogEntry;
use crate::message::Message;
use crate::message::RaftTransport;
use crate::txn::Consistency;
use crate::txn::TxFailure;
use crate::txn::TxInner;
use crate::txn::TxPhase;
use crate::txn::TxShared;
use crate::watch::completion_pair;
use crate::watch::WatchToken;

/// What a transaction is asking the leader to do.
struct CommitParams {
    tx_id: u64,
    base_term: u64,
    base_index: u64,
    reads: Option<Reads>,
    writes: Writes,
    config_change: Option<ConfigChange>,
    read_only: bool,
}

/// The leader's verdict before any log append happens.
enum CommitDisposition {
    /// No log entry needed; commit at the given position once it is
    /// committed and, for linearizable reads, once the lease covers
    /// `min_lease`.
    ReadOnly {
        commit_term: u64,
        commit_index: u64,
        min_lease: Option<u64>,
    },
    /// Append a new entry carrying the transaction's writes.
    ReadWrite,
}

impl<A: AtomicKvStore, T: RaftTransport> RaftCore<A, T> {
    /// Open a new transaction over a fresh store snapshot.
    pub(super) async fn open_transaction(
        &mut self,
        consistency: Consistency,
        resp: oneshot::Sender<Result<Arc<TxShared<A::Snapshot>>, CommitError>>,
    ) {
        let snapshot = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let _ = resp.send(Err(CommitError::Durability(err.to_string())));
                return;
            }
        };

        let mut view = MutableView::new(snapshot);
        if consistency != Consistency::Linearizable {
            // Only linearizable transactions have their reads validated.
            view.set_track_reads(false);
        }

        let (base_term, base_index) = match consistency {
            Consistency::Uncommitted => {
                // Uncommitted reads also see log entries that have not yet
                // committed and could still be lost.
                let last_applied = self.log.last_applied().index;
                for entry in self.log.entries_after(last_applied) {
                    view.apply_committed(&entry.writes);
                }
                (self.log.last_term(), self.log.last_index())
            }
            _ => (self.log.last_applied().term, self.log.last_applied().index),
        };

        let id = self.next_tx_id;
        self.next_tx_id += 1;
        let shared = Arc::new(TxShared {
            id,
            inner: Mutex::new(TxInner {
                consistency,
                base_term,
                base_index,
                view,
                phase: TxPhase::Executing,
                failure: None,
                read_only: false,
                timeout: Duration::from_millis(self.config.commit_timeout),
                config_change: None,
            }),
        });
        self.txns.insert(id, shared.clone());
        tracing::debug!(tx_id = id, ?consistency, base_term, base_index, "opened transaction");
        let _ = resp.send(Ok(shared));
    }

    /// Drop a transaction from the registry, failing any waiting committer.
    pub(super) fn rollback_transaction(&mut self, tx_id: u64) {
        if let Some(shared) = self.txns.remove(&tx_id) {
            shared
                .inner
                .lock()
                .unwrap()
                .fail(TxFailure::Stale("transaction rolled back".into()));
        }
        if self.high_priority_tx == Some(tx_id) {
            self.high_priority_tx = None;
        }
        self.complete_commit(tx_id, Err(CommitError::Stale("transaction rolled back".into())));
    }

    pub(super) fn set_high_priority(&mut self, tx_id: u64, high_priority: bool) {
        if high_priority {
            if self.txns.contains_key(&tx_id) {
                self.high_priority_tx = Some(tx_id);
            }
        } else if self.high_priority_tx == Some(tx_id) {
            self.high_priority_tx = None;
        }
    }

    pub(super) fn register_watch(&mut self, key: Vec<u8>, resp: oneshot::Sender<WatchToken>) {
        let (handle, token) = completion_pair();
        self.watches.push(crate::core::KeyWatch { key, handle });
        let _ = resp.send(token);
    }

    /// Complete key watches whose key was touched by a committed entry.
    pub(super) fn trigger_key_watches(&mut self, entry: &LogEntry) {
        if entry.writes.is_empty() || self.watches.is_empty() {
            return;
        }
        let touched = entry.writes.touched_ranges();
        self.watches.retain(|watch| {
            if touched.contains_key(&watch.key) {
                watch.handle.complete();
                false
            } else {
                true
            }
        });
    }

    /// Collect a ready transaction's parameters, consuming its commit-ready
    /// state. Returns `None` (and responds) if the transaction cannot
    /// proceed.
    fn take_commit_params(
        &mut self,
        tx_id: u64,
        resp: &mut Option<oneshot::Sender<Result<(), CommitError>>>,
    ) -> Option<CommitParams> {
        let shared = match self.txns.get(&tx_id) {
            Some(shared) => shared.clone(),
            None => {
                if let Some(resp) = resp.take() {
                    let _ = resp.send(Err(CommitError::Stale("unknown transaction".into())));
                }
                return None;
            }
        };
        let inner = shared.inner.lock().unwrap();
        if inner.phase != TxPhase::CommitReady {
            let err = match &inner.failure {
                Some(failure) => failure.to_commit_error(),
                None => CommitError::Stale("transaction is not ready to commit".into()),
            };
            if let Some(resp) = resp.take() {
                let _ = resp.send(Err(err));
            }
            return None;
        }
        let read_only = inner.is_effectively_read_only();
        Some(CommitParams {
            tx_id,
            base_term: inner.base_term,
            base_index: inner.base_index,
            reads: match inner.consistency {
                Consistency::Linearizable => Some(inner.view.reads().clone()),
                _ => None,
            },
            writes: inner.view.writes().clone(),
            config_change: inner.config_change.clone(),
            read_only,
        })
    }

    /// Commit path on a follower or candidate: forward the transaction to
    /// the leader as a CommitRequest and wait for its response.
    pub(super) fn forward_commit(&mut self, tx_id: u64, resp: oneshot::Sender<Result<(), CommitError>>) {
        let mut resp = Some(resp);
        let params = match self.take_commit_params(tx_id, &mut resp) {
            Some(params) => params,
            None => return,
        };
        let resp = resp.take().expect("responder still present");

        let (leader, leader_address) = match (&self.current_leader, &self.leader_address) {
            (Some(leader), Some(address)) => (leader.clone(), address.clone()),
            _ => {
                self.fail_transaction(tx_id, TxFailure::Retry("no cluster leader known".into()));
                let _ = resp.send(Err(CommitError::NotLeader { leader: None }));
                return;
            }
        };

        let msg = Message::CommitRequest(CommitRequest {
            header: self.header_to(&leader),
            tx_id,
            base_term: params.base_term,
            base_index: params.base_index,
            reads_data: params.reads.as_ref().map(|r| r.to_bytes()),
            writes_data: if params.read_only {
                None
            } else {
                Some(params.writes.to_bytes())
            },
            config_change: params.config_change,
            read_only: params.read_only,
        });
        tracing::debug!(tx_id, leader=%leader, "forwarding commit to leader");
        self.send_to_address(&leader_address, msg);
        self.commit_waiters.insert(tx_id, resp);
    }

    /// A CommitResponse arrived for a transaction this node forwarded.
    pub(super) fn handle_commit_response(&mut self, m: CommitResponse) {
        let shared = match self.txns.get(&m.tx_id) {
            Some(shared) => shared.clone(),
            None => return,
        };
        let failure = {
            let mut inner = shared.inner.lock().unwrap();
            if inner.phase != TxPhase::CommitReady {
                return;
            }
            match &m.result {
                CommitOutcome::Committed {
                    commit_term,
                    commit_index,
                    commit_leader_lease_timeout,
                } => {
                    if !inner.is_effectively_read_only() {
                        // The leader may later replicate this entry back to
                        // us without its payload; we already hold it.
                        self.pending_entry_data.insert(
                            *commit_index,
                            (*commit_term, inner.view.writes().clone(), inner.config_change.clone()),
                        );
                    }
                    inner.phase = TxPhase::CommitWaiting {
                        commit_term: *commit_term,
                        commit_index: *commit_index,
                        min_lease: *commit_leader_lease_timeout,
                    };
                    None
                }
                CommitOutcome::Rejected { message } => {
                    let failure = TxFailure::Retry(message.clone());
                    inner.fail(failure.clone());
                    Some(failure)
                }
            }
        };
        match failure {
            Some(failure) => self.complete_commit(m.tx_id, Err(failure.to_commit_error())),
            None => self.check_waiting_transactions(),
        }
    }

    /// Reject a CommitRequest this node cannot serve.
    pub(super) fn reject_commit_request(&mut self, m: &CommitRequest, sender_address: &str) {
        let response = Message::CommitResponse(CommitResponse {
            header: self.header_to(&m.header.sender_id),
            tx_id: m.tx_id,
            result: CommitOutcome::Rejected {
                message: "not the cluster leader".into(),
            },
        });
        self.send_to_address(sender_address, response);
    }

    /// Advance executing read-write transactions past a newly appended
    /// entry. Transactions whose reads conflict with the entry's writes are
    /// failed with a retry error instead.
    pub(super) fn rebase_open_transactions(&mut self, entry: &LogEntry) {
        for shared in self.txns.values() {
            let mut inner = shared.inner.lock().unwrap();
            if inner.phase != TxPhase::Executing {
                continue;
            }
            // Read-only transactions keep their stable snapshot; their reads
            // are validated at commit time against the committed timeline.
            if inner.view.is_read_only() {
                continue;
            }
            if inner.base_index + 1 != entry.log_id.index {
                continue;
            }
            if inner.consistency == Consistency::Linearizable
                && inner.view.reads().find_conflict(&entry.writes)
            {
                tracing::debug!(tx_id = shared.id, index = entry.log_id.index, "rebase conflict");
                inner.fail(TxFailure::Retry(
                    "transaction reads conflict with a newly appended entry".into(),
                ));
                continue;
            }
            inner.view.apply_committed(&entry.writes);
            inner.base_term = entry.log_id.term;
            inner.base_index = entry.log_id.index;
        }
    }

    /// Apply all committed-but-unapplied entries to the state machine.
    pub(super) async fn apply_committed_log_entries(&mut self) -> crate::error::RaftResult<()> {
        while self.log.last_applied().index < self.commit_index {
            let next = self.log.last_applied().index + 1;
            let entry = match self.log.entry_at(next) {
                Some(entry) => entry.clone(),
                // Committed entries we have not received yet.
                None => break,
            };
            if !entry.writes.is_empty() {
                self.store
                    .mutate(entry.writes.clone(), true)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
            }
            self.log.apply_next().map_err(|err| self.map_fatal_storage_error(err))?;
            self.pending_entry_data.remove(&entry.log_id.index);
            self.trigger_key_watches(&entry);
            tracing::trace!(index = entry.log_id.index, "applied log entry");
        }
        self.check_waiting_transactions();
        self.report_metrics();
        Ok(())
    }

    /// Complete every waiting transaction whose commit position has become
    /// durable (committed, applied, and lease-covered where required).
    pub(super) fn check_waiting_transactions(&mut self) {
        enum Outcome {
            Wait,
            Done,
            Fail(TxFailure),
        }

        let waiting: Vec<u64> = self.commit_waiters.keys().copied().collect();
        for tx_id in waiting {
            let shared = match self.txns.get(&tx_id) {
                Some(shared) => shared.clone(),
                None => {
                    self.complete_commit(tx_id, Err(CommitError::Stale("transaction rolled back".into())));
                    continue;
                }
            };

            let outcome = {
                let mut inner = shared.inner.lock().unwrap();
                match inner.phase {
                    TxPhase::CommitWaiting {
                        commit_term,
                        commit_index,
                        min_lease,
                    } => match self.log.term_at(commit_index) {
                        Some(term) if term != commit_term => {
                            inner.fail(TxFailure::Retry("commit log entry was overwritten".into()));
                            Outcome::Fail(TxFailure::Retry("commit log entry was overwritten".into()))
                        }
                        None if commit_index > self.log.last_index() => Outcome::Wait,
                        _ => {
                            if commit_index > self.commit_index
                                || commit_index > self.log.last_applied().index
                            {
                                Outcome::Wait
                            } else if let Some(required) = min_lease {
                                match self.lease_timeout {
                                    Some(lease) if lease > required => {
                                        inner.phase = TxPhase::Completed;
                                        Outcome::Done
                                    }
                                    _ => Outcome::Wait,
                                }
                            } else {
                                inner.phase = TxPhase::Completed;
                                Outcome::Done
                            }
                        }
                    },
                    TxPhase::Completed => Outcome::Done,
                    TxPhase::RolledBack => Outcome::Fail(
                        inner
                            .failure
                            .clone()
                            .unwrap_or_else(|| TxFailure::Stale("transaction rolled back".into())),
                    ),
                    TxPhase::CommitReady | TxPhase::Executing => Outcome::Wait,
                }
            };

            match outcome {
                Outcome::Wait => {}
                Outcome::Done => self.complete_commit(tx_id, Ok(())),
                Outcome::Fail(failure) => self.complete_commit(tx_id, Err(failure.to_commit_error())),
            }
        }
    }

    pub(super) fn complete_commit(&mut self, tx_id: u64, result: Result<(), CommitError>) {
        if let Some(waiter) = self.commit_waiters.remove(&tx_id) {
            tracing::debug!(tx_id, ok = result.is_ok(), "transaction commit resolved");
            let _ = waiter.send(result);
        }
    }

    /// Mark a transaction failed without completing any waiter.
    pub(super) fn fail_transaction(&mut self, tx_id: u64, failure: TxFailure) {
        if let Some(shared) = self.txns.get(&tx_id) {
            shared.inner.lock().unwrap().fail(failure);
        }
    }

    /// Abort every open transaction, e.g. on shutdown or a fatal storage
    /// error.
    pub(super) fn fail_all_transactions(&mut self, make: impl Fn() -> TxFailure) {
        for shared in self.txns.values() {
            shared.inner.lock().unwrap().fail(make());
        }
        let waiting: Vec<u64> = self.commit_waiters.keys().copied().collect();
        for tx_id in waiting {
            self.complete_commit(tx_id, Err(make().to_commit_error()));
        }
    }
}

impl<'a, A: AtomicKvStore, T: RaftTransport> LeaderState<'a, A, T> {
    /// Commit path for a transaction on the leader itself.
    pub(super) async fn check_ready_transaction(
        &mut self,
        tx_id: u64,
        resp: oneshot::Sender<Result<(), CommitError>>,
    ) -> crate::error::RaftResult<()> {
        let mut resp = Some(resp);
        let params = match self.core.take_commit_params(tx_id, &mut resp) {
            Some(params) => params,
            None => return Ok(()),
        };
        let resp = resp.take().expect("responder still present");

        match self.assess_commit(&params) {
            Err(failure) => {
                self.core.fail_transaction(tx_id, failure.clone());
                let _ = resp.send(Err(failure.to_commit_error()));
            }
            Ok(CommitDisposition::ReadOnly {
                commit_term,
                commit_index,
                min_lease,
            }) => {
                self.set_commit_waiting(tx_id, commit_term, commit_index, min_lease);
                self.core.commit_waiters.insert(tx_id, resp);
                self.core.check_waiting_transactions();
            }
            Ok(CommitDisposition::ReadWrite) => {
                match self.append_entry(params.writes, params.config_change).await {
                    Ok(entry) => {
                        self.set_commit_waiting(tx_id, entry.log_id.term, entry.log_id.index, None);
                        self.core.commit_waiters.insert(tx_id, resp);
                        self.core.check_waiting_transactions();
                    }
                    Err(failure) => {
                        self.core.fail_transaction(tx_id, failure.clone());
                        let _ = resp.send(Err(failure.to_commit_error()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Commit path for a CommitRequest forwarded by a follower or candidate.
    pub(super) async fn handle_commit_request(
        &mut self,
        m: CommitRequest,
        sender_address: String,
    ) -> crate::error::RaftResult<()> {
        let reads = match &m.reads_data {
            Some(data) => match Reads::from_bytes(data) {
                Ok(reads) => Some(reads),
                Err(err) => {
                    tracing::warn!(error=%err, "dropping commit request with undecodable reads");
                    return Ok(());
                }
            },
            None => None,
        };
        let writes = match &m.writes_data {
            Some(data) => match Writes::from_bytes(data) {
                Ok(writes) => writes,
                Err(err) => {
                    tracing::warn!(error=%err, "dropping commit request with undecodable writes");
                    return Ok(());
                }
            },
            None => Writes::new(),
        };
        let params = CommitParams {
            tx_id: m.tx_id,
            base_term: m.base_term,
            base_index: m.base_index,
            reads,
            writes,
            config_change: m.config_change.clone(),
            read_only: m.read_only,
        };

        let result = match self.assess_commit(&params) {
            Err(failure) => CommitOutcome::Rejected {
                message: failure.to_commit_error().to_string(),
            },
            Ok(CommitDisposition::ReadOnly {
                commit_term,
                commit_index,
                min_lease,
            }) => CommitOutcome::Committed {
                commit_term,
                commit_index,
                commit_leader_lease_timeout: min_lease,
            },
            Ok(CommitDisposition::ReadWrite) => {
                // The requester already holds this entry's payload; note
                // that before replicating so the send can skip the data.
                let predicted_index = self.core.log.last_index() + 1;
                if let Some(fr) = self.followers.get_mut(&m.header.sender_id) {
                    fr.skip_data_indexes.insert(predicted_index);
                }
                match self.append_entry(params.writes, params.config_change).await {
                    Ok(entry) => CommitOutcome::Committed {
                        commit_term: entry.log_id.term,
                        commit_index: entry.log_id.index,
                        commit_leader_lease_timeout: None,
                    },
                    Err(failure) => {
                        if let Some(fr) = self.followers.get_mut(&m.header.sender_id) {
                            fr.skip_data_indexes.remove(&predicted_index);
                        }
                        CommitOutcome::Rejected {
                            message: failure.to_commit_error().to_string(),
                        }
                    }
                }
            }
        };

        let response = Message::CommitResponse(CommitResponse {
            header: self.core.header_to(&m.header.sender_id),
            tx_id: m.tx_id,
            result,
        });
        self.core.send_to_address(&sender_address, response);
        Ok(())
    }

    /// Verify a commit against the log: base validity, read conflicts,
    /// config change rules and the high-priority transaction.
    fn assess_commit(&mut self, params: &CommitParams) -> Result<CommitDisposition, TxFailure> {
        let last_index = self.core.log.last_index();

        // (a) The base position must still lie on this log.
        if params.base_index > last_index {
            return Err(TxFailure::Retry("transaction base is beyond the leader's log".into()));
        }
        match self.core.log.term_at(params.base_index) {
            Some(term) if term != params.base_term => {
                return Err(TxFailure::Retry("transaction base log entry was overwritten".into()));
            }
            // Below the retained window the entry was committed and applied
            // long ago; committed prefixes cannot have been overwritten.
            _ => {}
        }

        // (b) The reads must not conflict with any entry after the base.
        if let Some(reads) = &params.reads {
            if !reads.is_empty() {
                for index in (params.base_index + 1)..=last_index {
                    let conflicts = match self.core.log.entry_at(index) {
                        Some(entry) => reads.find_conflict(&entry.writes),
                        None => match self.core.log.load_entry(index) {
                            Ok(Some(entry)) => reads.find_conflict(&entry.writes),
                            Ok(None) => {
                                return Err(TxFailure::Retry(
                                    "log entries needed for conflict checking were discarded".into(),
                                ));
                            }
                            Err(err) => return Err(TxFailure::Durability(err.to_string())),
                        },
                    };
                    if conflicts {
                        return Err(TxFailure::Conflict(format!(
                            "transaction reads conflict with committed writes at index {}",
                            index
                        )));
                    }
                }
            }
        }

        if params.read_only {
            let now = self.core.now_ts();
            let min_lease = match self.core.lease_timeout {
                Some(lease) if lease > now => None,
                _ => Some(now),
            };
            return Ok(CommitDisposition::ReadOnly {
                commit_term: self.core.log.last_term(),
                commit_index: last_index,
                min_lease,
            });
        }

        if let Some(change) = &params.config_change {
            self.validate_config_change(change)?;
        }

        // A high-priority transaction wins conflicts: anyone else's writes
        // that would invalidate its reads are refused instead.
        if let Some(hp_id) = self.core.high_priority_tx {
            if hp_id != params.tx_id {
                if let Some(hp) = self.core.txns.get(&hp_id) {
                    let hp_inner = hp.inner.lock().unwrap();
                    if hp_inner.phase == TxPhase::Executing
                        && hp_inner.view.reads().find_conflict(&params.writes)
                    {
                        return Err(TxFailure::Conflict(
                            "writes conflict with a higher-priority transaction's reads".into(),
                        ));
                    }
                }
            }
        }

        Ok(CommitDisposition::ReadWrite)
    }

    fn set_commit_waiting(&mut self, tx_id: u64, commit_term: u64, commit_index: u64, min_lease: Option<u64>) {
        if let Some(shared) = self.core.txns.get(&tx_id) {
            let mut inner = shared.inner.lock().unwrap();
            if inner.phase == TxPhase::CommitReady {
                inner.phase = TxPhase::CommitWaiting {
                    commit_term,
                    commit_index,
                    min_lease,
                };
            }
        }
    }
}
