//! Raft wire messages and their binary encoding.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::codec::DecodeError;
use crate::codec::DecodeResult;
use crate::kv::Writes;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The wire format version this node speaks.
pub const WIRE_VERSION: u8 = 1;

/// The cluster membership configuration: identity to network address.
pub type ClusterConfig = BTreeMap<NodeId, String>;

/// A single cluster configuration delta carried by a log entry.
///
/// An `address` of `Some` adds (or re-addresses) the identity; `None` removes
/// it from the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub identity: NodeId,
    pub address: Option<String>,
}

impl ConfigChange {
    /// Apply this delta to a configuration in place.
    pub fn apply_to(&self, config: &mut ClusterConfig) {
        match &self.address {
            Some(address) => {
                config.insert(self.identity.clone(), address.clone());
            }
            None => {
                config.remove(&self.identity);
            }
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_string(buf, &self.identity);
        match &self.address {
            Some(address) => {
                codec::put_u8(buf, 1);
                codec::put_string(buf, address);
            }
            None => codec::put_u8(buf, 0),
        }
    }

    pub fn decode(input: &mut &[u8]) -> DecodeResult<Self> {
        let identity = codec::get_string(input)?;
        let address = match codec::get_u8(input)? {
            0 => None,
            1 => Some(codec::get_string(input)?),
            _ => return Err(DecodeError::Malformed("bad config change tag")),
        };
        Ok(Self { identity, address })
    }
}

/// A Raft log entry.
///
/// `index` strictly increases by one along the log and `term` is monotonically
/// non-decreasing. The writes are applied to the state machine when the entry
/// commits; an optional config change adjusts the cluster membership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: LogId,
    pub writes: Writes,
    pub config_change: Option<ConfigChange>,
}

impl LogEntry {
    /// Serialize the entry payload (writes plus optional config change); the
    /// index and term travel separately, in file names and message fields.
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_entry_payload(&self.writes, &self.config_change)
    }
}

pub fn encode_entry_payload(writes: &Writes, config_change: &Option<ConfigChange>) -> Vec<u8> {
    let mut buf = Vec::new();
    match config_change {
        Some(change) => {
            codec::put_u8(&mut buf, 1);
            change.encode(&mut buf);
        }
        None => codec::put_u8(&mut buf, 0),
    }
    writes.encode(&mut buf);
    buf
}

pub fn decode_entry_payload(bytes: &[u8]) -> DecodeResult<(Writes, Option<ConfigChange>)> {
    let mut input = bytes;
    let config_change = match codec::get_u8(&mut input)? {
        0 => None,
        1 => Some(ConfigChange::decode(&mut input)?),
        _ => return Err(DecodeError::Malformed("bad entry payload tag")),
    };
    let writes = Writes::decode(&mut input)?;
    if !input.is_empty() {
        return Err(DecodeError::Malformed("trailing bytes after entry payload"));
    }
    Ok((writes, config_change))
}

impl MessageSummary for LogEntry {
    fn summary(&self) -> String {
        match &self.config_change {
            Some(change) => format!("{}:config-change({:?})", self.log_id, change),
            None => format!("{}:{:?}", self.log_id, self.writes),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The header shared by every wire message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Wire format version.
    pub version: u8,
    /// The cluster this message belongs to; messages for another cluster are
    /// dropped on receipt.
    pub cluster_id: u32,
    pub sender_id: NodeId,
    pub recipient_id: NodeId,
    /// The sender's current term when the message was composed.
    pub term: u64,
}

impl MessageHeader {
    pub fn new(cluster_id: u32, sender_id: NodeId, recipient_id: NodeId, term: u64) -> Self {
        Self {
            version: WIRE_VERSION,
            cluster_id,
            sender_id,
            recipient_id,
            term,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_u8(buf, self.version);
        codec::put_u32(buf, self.cluster_id);
        codec::put_string(buf, &self.sender_id);
        codec::put_string(buf, &self.recipient_id);
        codec::put_u64(buf, self.term);
    }

    fn decode(input: &mut &[u8]) -> DecodeResult<Self> {
        let version = codec::get_u8(input)?;
        if version != WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            cluster_id: codec::get_u32(input)?,
            sender_id: codec::get_string(input)?,
            recipient_id: codec::get_string(input)?,
            term: codec::get_u64(input)?,
        })
    }
}

/// Sent by the leader to replicate a log entry, or with no entry as a probe
/// and heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub header: MessageHeader,
    /// The leader's timestamp at send time, echoed back by the follower and
    /// used for lease computation. Milliseconds on the leader's own clock.
    pub leader_timestamp: u64,
    /// The leader's current lease timeout, if one is established.
    pub leader_lease_timeout: Option<u64>,
    /// The leader's commit index, clamped to what this follower has.
    pub leader_commit: u64,
    pub prev_log_term: u64,
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index + 1`; absent for a probe.
    pub entry_term: Option<u64>,
    /// The serialized entry payload; may be absent even when `entry_term` is
    /// present if the follower is known to already hold the data.
    pub mutation_data: Option<Vec<u8>>,
}

/// The follower's reply to an [`AppendRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub header: MessageHeader,
    pub success: bool,
    /// The recipient's last log index matching the leader, valid on success.
    pub match_index: u64,
    /// The recipient's last log index, used to cap `next_index` on failure.
    pub last_log_index: u64,
    /// The `leader_timestamp` of the request, echoed.
    pub leader_timestamp: u64,
}

/// A transaction commit forwarded from a follower or candidate to the leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub header: MessageHeader,
    pub tx_id: u64,
    pub base_term: u64,
    pub base_index: u64,
    /// Serialized [`crate::kv::Reads`]; absent when read tracking is off.
    pub reads_data: Option<Vec<u8>>,
    /// Serialized [`Writes`]; absent for a read-only transaction.
    pub writes_data: Option<Vec<u8>>,
    pub config_change: Option<ConfigChange>,
    pub read_only: bool,
}

/// The leader's reply to a [`CommitRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub header: MessageHeader,
    pub tx_id: u64,
    /// On success, where the transaction will commit; on failure, an error.
    pub result: CommitOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Committed {
        commit_term: u64,
        commit_index: u64,
        /// For read-only transactions: the leader lease timestamp the
        /// requester must wait out, if the lease did not already cover the
        /// request.
        commit_leader_lease_timeout: Option<u64>,
    },
    Rejected {
        message: String,
    },
}

/// One chunk of a snapshot stream from the leader to a lagging follower.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub header: MessageHeader,
    pub snapshot_term: u64,
    pub snapshot_index: u64,
    /// The ordinal of the first key/value pair in this chunk.
    pub pair_index: u64,
    /// The cluster config as of the snapshot; present only when
    /// `pair_index == 0`.
    pub config: Option<ClusterConfig>,
    pub last_chunk: bool,
    /// Prefix-compressed key/value pairs.
    pub data: Vec<u8>,
}

/// Sent by a candidate to request a vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub header: MessageHeader,
    pub last_log_term: u64,
    pub last_log_index: u64,
}

/// Grants the sender's vote to the recipient for the header's term.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantVote {
    pub header: MessageHeader,
}

/// A liveness probe, used by the optional pre-election follower probing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub header: MessageHeader,
    pub timestamp: u64,
}

/// The reply to a [`PingRequest`], echoing its timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub header: MessageHeader,
    pub timestamp: u64,
}

/// Any Raft wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
    CommitRequest(CommitRequest),
    CommitResponse(CommitResponse),
    InstallSnapshot(InstallSnapshot),
    RequestVote(RequestVote),
    GrantVote(GrantVote),
    PingRequest(PingRequest),
    PingResponse(PingResponse),
}

const TYPE_APPEND_REQUEST: u8 = 1;
const TYPE_APPEND_RESPONSE: u8 = 2;
const TYPE_COMMIT_REQUEST: u8 = 3;
const TYPE_COMMIT_RESPONSE: u8 = 4;
const TYPE_INSTALL_SNAPSHOT: u8 = 5;
const TYPE_REQUEST_VOTE: u8 = 6;
const TYPE_GRANT_VOTE: u8 = 7;
const TYPE_PING_REQUEST: u8 = 8;
const TYPE_PING_RESPONSE: u8 = 9;

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::AppendRequest(m) => &m.header,
            Message::AppendResponse(m) => &m.header,
            Message::CommitRequest(m) => &m.header,
            Message::CommitResponse(m) => &m.header,
            Message::InstallSnapshot(m) => &m.header,
            Message::RequestVote(m) => &m.header,
            Message::GrantVote(m) => &m.header,
            Message::PingRequest(m) => &m.header,
            Message::PingResponse(m) => &m.header,
        }
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::AppendRequest(m) => {
                codec::put_u8(&mut buf, TYPE_APPEND_REQUEST);
                m.header.encode(&mut buf);
                codec::put_u64(&mut buf, m.leader_timestamp);
                match m.leader_lease_timeout {
                    Some(t) => {
                        codec::put_u8(&mut buf, 1);
                        codec::put_u64(&mut buf, t);
                    }
                    None => codec::put_u8(&mut buf, 0),
                }
                codec::put_uvarint(&mut buf, m.leader_commit);
                codec::put_uvarint(&mut buf, m.prev_log_term);
                codec::put_uvarint(&mut buf, m.prev_log_index);
                match m.entry_term {
                    Some(t) => {
                        codec::put_u8(&mut buf, 1);
                        codec::put_uvarint(&mut buf, t);
                    }
                    None => codec::put_u8(&mut buf, 0),
                }
                codec::put_opt_bytes(&mut buf, &m.mutation_data);
            }
            Message::AppendResponse(m) => {
                codec::put_u8(&mut buf, TYPE_APPEND_RESPONSE);
                m.header.encode(&mut buf);
                codec::put_u8(&mut buf, m.success as u8);
                codec::put_uvarint(&mut buf, m.match_index);
                codec::put_uvarint(&mut buf, m.last_log_index);
                codec::put_u64(&mut buf, m.leader_timestamp);
            }
            Message::CommitRequest(m) => {
                codec::put_u8(&mut buf, TYPE_COMMIT_REQUEST);
                m.header.encode(&mut buf);
                codec::put_uvarint(&mut buf, m.tx_id);
                codec::put_uvarint(&mut buf, m.base_term);
                codec::put_uvarint(&mut buf, m.base_index);
                codec::put_opt_bytes(&mut buf, &m.reads_data);
                codec::put_opt_bytes(&mut buf, &m.writes_data);
                match &m.config_change {
                    Some(change) => {
                        codec::put_u8(&mut buf, 1);
                        change.encode(&mut buf);
                    }
                    None => codec::put_u8(&mut buf, 0),
                }
                codec::put_u8(&mut buf, m.read_only as u8);
            }
            Message::CommitResponse(m) => {
                codec::put_u8(&mut buf, TYPE_COMMIT_RESPONSE);
                m.header.encode(&mut buf);
                codec::put_uvarint(&mut buf, m.tx_id);
                match &m.result {
                    CommitOutcome::Committed {
                        commit_term,
                        commit_index,
                        commit_leader_lease_timeout,
                    } => {
                        codec::put_u8(&mut buf, 1);
                        codec::put_uvarint(&mut buf, *commit_term);
                        codec::put_uvarint(&mut buf, *commit_index);
                        match commit_leader_lease_timeout {
                            Some(t) => {
                                codec::put_u8(&mut buf, 1);
                                codec::put_u64(&mut buf, *t);
                            }
                            None => codec::put_u8(&mut buf, 0),
                        }
                    }
                    CommitOutcome::Rejected { message } => {
                        codec::put_u8(&mut buf, 0);
                        codec::put_string(&mut buf, message);
                    }
                }
            }
            Message::InstallSnapshot(m) => {
                codec::put_u8(&mut buf, TYPE_INSTALL_SNAPSHOT);
                m.header.encode(&mut buf);
                codec::put_uvarint(&mut buf, m.snapshot_term);
                codec::put_uvarint(&mut buf, m.snapshot_index);
                codec::put_uvarint(&mut buf, m.pair_index);
                match &m.config {
                    Some(config) => {
                        codec::put_u8(&mut buf, 1);
                        codec::put_uvarint(&mut buf, config.len() as u64);
                        for (identity, address) in config {
                            codec::put_string(&mut buf, identity);
                            codec::put_string(&mut buf, address);
                        }
                    }
                    None => codec::put_u8(&mut buf, 0),
                }
                codec::put_u8(&mut buf, m.last_chunk as u8);
                codec::put_bytes(&mut buf, &m.data);
            }
            Message::RequestVote(m) => {
                codec::put_u8(&mut buf, TYPE_REQUEST_VOTE);
                m.header.encode(&mut buf);
                codec::put_uvarint(&mut buf, m.last_log_term);
                codec::put_uvarint(&mut buf, m.last_log_index);
            }
            Message::GrantVote(m) => {
                codec::put_u8(&mut buf, TYPE_GRANT_VOTE);
                m.header.encode(&mut buf);
            }
            Message::PingRequest(m) => {
                codec::put_u8(&mut buf, TYPE_PING_REQUEST);
                m.header.encode(&mut buf);
                codec::put_u64(&mut buf, m.timestamp);
            }
            Message::PingResponse(m) => {
                codec::put_u8(&mut buf, TYPE_PING_RESPONSE);
                m.header.encode(&mut buf);
                codec::put_u64(&mut buf, m.timestamp);
            }
        }
        buf
    }

    /// Deserialize from the wire format.
    pub fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        let mut input = bytes;
        let msg_type = codec::get_u8(&mut input)?;
        let header = MessageHeader::decode(&mut input)?;
        let message = match msg_type {
            TYPE_APPEND_REQUEST => {
                let leader_timestamp = codec::get_u64(&mut input)?;
                let leader_lease_timeout = match codec::get_u8(&mut input)? {
                    0 => None,
                    1 => Some(codec::get_u64(&mut input)?),
                    _ => return Err(DecodeError::Malformed("bad lease tag")),
                };
                let leader_commit = codec::get_uvarint(&mut input)?;
                let prev_log_term = codec::get_uvarint(&mut input)?;
                let prev_log_index = codec::get_uvarint(&mut input)?;
                let entry_term = match codec::get_u8(&mut input)? {
                    0 => None,
                    1 => Some(codec::get_uvarint(&mut input)?),
                    _ => return Err(DecodeError::Malformed("bad entry term tag")),
                };
                let mutation_data = codec::get_opt_bytes(&mut input)?;
                Message::AppendRequest(AppendRequest {
                    header,
                    leader_timestamp,
                    leader_lease_timeout,
                    leader_commit,
                    prev_log_term,
                    prev_log_index,
                    entry_term,
                    mutation_data,
                })
            }
            TYPE_APPEND_RESPONSE => Message::AppendResponse(AppendResponse {
                header,
                success: codec::get_u8(&mut input)? != 0,
                match_index: codec::get_uvarint(&mut input)?,
                last_log_index: codec::get_uvarint(&mut input)?,
                leader_timestamp: codec::get_u64(&mut input)?,
            }),
            TYPE_COMMIT_REQUEST => {
                let tx_id = codec::get_uvarint(&mut input)?;
                let base_term = codec::get_uvarint(&mut input)?;
                let base_index = codec::get_uvarint(&mut input)?;
                let reads_data = codec::get_opt_bytes(&mut input)?;
                let writes_data = codec::get_opt_bytes(&mut input)?;
                let config_change = match codec::get_u8(&mut input)? {
                    0 => None,
                    1 => Some(ConfigChange::decode(&mut input)?),
                    _ => return Err(DecodeError::Malformed("bad config change tag")),
                };
                let read_only = codec::get_u8(&mut input)? != 0;
                Message::CommitRequest(CommitRequest {
                    header,
                    tx_id,
                    base_term,
                    base_index,
                    reads_data,
                    writes_data,
                    config_change,
                    read_only,
                })
            }
            TYPE_COMMIT_RESPONSE => {
                let tx_id = codec::get_uvarint(&mut input)?;
                let result = match codec::get_u8(&mut input)? {
                    1 => {
                        let commit_term = codec::get_uvarint(&mut input)?;
                        let commit_index = codec::get_uvarint(&mut input)?;
                        let commit_leader_lease_timeout = match codec::get_u8(&mut input)? {
                            0 => None,
                            1 => Some(codec::get_u64(&mut input)?),
                            _ => return Err(DecodeError::Malformed("bad lease tag")),
                        };
                        CommitOutcome::Committed {
                            commit_term,
                            commit_index,
                            commit_leader_lease_timeout,
                        }
                    }
                    0 => CommitOutcome::Rejected {
                        message: codec::get_string(&mut input)?,
                    },
                    _ => return Err(DecodeError::Malformed("bad commit outcome tag")),
                };
                Message::CommitResponse(CommitResponse { header, tx_id, result })
            }
            TYPE_INSTALL_SNAPSHOT => {
                let snapshot_term = codec::get_uvarint(&mut input)?;
                let snapshot_index = codec::get_uvarint(&mut input)?;
                let pair_index = codec::get_uvarint(&mut input)?;
                let config = match codec::get_u8(&mut input)? {
                    0 => None,
                    1 => {
                        let len = codec::get_uvarint(&mut input)?;
                        let mut config = ClusterConfig::new();
                        for _ in 0..len {
                            let identity = codec::get_string(&mut input)?;
                            let address = codec::get_string(&mut input)?;
                            config.insert(identity, address);
                        }
                        Some(config)
                    }
                    _ => return Err(DecodeError::Malformed("bad config tag")),
                };
                let last_chunk = codec::get_u8(&mut input)? != 0;
                let data = codec::get_bytes(&mut input)?;
                Message::InstallSnapshot(InstallSnapshot {
                    header,
                    snapshot_term,
                    snapshot_index,
                    pair_index,
                    config,
                    last_chunk,
                    data,
                })
            }
            TYPE_REQUEST_VOTE => Message::RequestVote(RequestVote {
                header,
                last_log_term: codec::get_uvarint(&mut input)?,
                last_log_index: codec::get_uvarint(&mut input)?,
            }),
            TYPE_GRANT_VOTE => Message::GrantVote(GrantVote { header }),
            TYPE_PING_REQUEST => Message::PingRequest(PingRequest {
                header,
                timestamp: codec::get_u64(&mut input)?,
            }),
            TYPE_PING_RESPONSE => Message::PingResponse(PingResponse {
                header,
                timestamp: codec::get_u64(&mut input)?,
            }),
            other => return Err(DecodeError::UnknownMessageType(other)),
        };
        if !input.is_empty() {
            return Err(DecodeError::Malformed("trailing bytes after message"));
        }
        Ok(message)
    }
}

impl MessageSummary for AppendRequest {
    fn summary(&self) -> String {
        format!(
            "AppendRequest[{}→{} term={}] prev={}-{} entry_term={:?} data={} commit={}",
            self.header.sender_id,
            self.header.recipient_id,
            self.header.term,
            self.prev_log_term,
            self.prev_log_index,
            self.entry_term,
            self.mutation_data.as_ref().map(|d| d.len()).unwrap_or(0),
            self.leader_commit
        )
    }
}

impl MessageSummary for InstallSnapshot {
    fn summary(&self) -> String {
        format!(
            "InstallSnapshot[{}→{} term={}] {}-{} pair={} last={} bytes={}",
            self.header.sender_id,
            self.header.recipient_id,
            self.header.term,
            self.snapshot_term,
            self.snapshot_index,
            self.pair_index,
            self.last_chunk,
            self.data.len()
        )
    }
}

impl MessageSummary for Message {
    fn summary(&self) -> String {
        let h = self.header();
        let body = match self {
            Message::AppendRequest(m) => format!(
                "AppendRequest prev={}-{} entry_term={:?} data={} commit={}",
                m.prev_log_term,
                m.prev_log_index,
                m.entry_term,
                m.mutation_data.as_ref().map(|d| d.len()).unwrap_or(0),
                m.leader_commit
            ),
            Message::AppendResponse(m) => format!(
                "AppendResponse success={} match={} last={}",
                m.success, m.match_index, m.last_log_index
            ),
            Message::CommitRequest(m) => format!(
                "CommitRequest tx={} base={}-{} read_only={}",
                m.tx_id, m.base_term, m.base_index, m.read_only
            ),
            Message::CommitResponse(m) => format!("CommitResponse tx={} {:?}", m.tx_id, m.result),
            Message::InstallSnapshot(m) => format!(
                "InstallSnapshot {}-{} pair={} last={} bytes={}",
                m.snapshot_term,
                m.snapshot_index,
                m.pair_index,
                m.last_chunk,
                m.data.len()
            ),
            Message::RequestVote(m) => {
                format!("RequestVote last={}-{}", m.last_log_term, m.last_log_index)
            }
            Message::GrantVote(_) => "GrantVote".to_string(),
            Message::PingRequest(m) => format!("PingRequest ts={}", m.timestamp),
            Message::PingResponse(m) => format!("PingResponse ts={}", m.timestamp),
        };
        format!("{} [{}→{} term={}]", body, h.sender_id, h.recipient_id, h.term)
    }
}

/// The transport used to deliver messages between nodes.
///
/// Implementations must deliver messages to a given address in send order
/// (FIFO per address); messages may be dropped but never reordered. `send`
/// should enqueue and return promptly.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send(&self, address: &str, msg: Message) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::kv::Reads;

    fn header() -> MessageHeader {
        MessageHeader::new(7, "node-a".into(), "node-b".into(), 3)
    }

    fn roundtrip(msg: Message) {
        let bytes = msg.to_bytes();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn append_request_roundtrip() {
        let mut writes = Writes::new();
        writes.put(b"k".to_vec(), b"v".to_vec());
        roundtrip(Message::AppendRequest(AppendRequest {
            header: header(),
            leader_timestamp: 12345,
            leader_lease_timeout: Some(99999),
            leader_commit: 17,
            prev_log_term: 2,
            prev_log_index: 41,
            entry_term: Some(3),
            mutation_data: Some(encode_entry_payload(&writes, &None)),
        }));
        roundtrip(Message::AppendRequest(AppendRequest {
            header: header(),
            leader_timestamp: 0,
            leader_lease_timeout: None,
            leader_commit: 0,
            prev_log_term: 0,
            prev_log_index: 0,
            entry_term: None,
            mutation_data: None,
        }));
    }

    #[test]
    fn append_response_roundtrip() {
        roundtrip(Message::AppendResponse(AppendResponse {
            header: header(),
            success: true,
            match_index: 42,
            last_log_index: 42,
            leader_timestamp: 12345,
        }));
    }

    #[test]
    fn commit_request_roundtrip() {
        let mut reads = Reads::new();
        reads.record_key(b"x");
        let mut writes = Writes::new();
        writes.put(b"x".to_vec(), b"1".to_vec());
        roundtrip(Message::CommitRequest(CommitRequest {
            header: header(),
            tx_id: 9,
            base_term: 1,
            base_index: 5,
            reads_data: Some(reads.to_bytes()),
            writes_data: Some(writes.to_bytes()),
            config_change: Some(ConfigChange {
                identity: "node-c".into(),
                address: Some("addr:c".into()),
            }),
            read_only: false,
        }));
    }

    #[test]
    fn commit_response_roundtrip() {
        roundtrip(Message::CommitResponse(CommitResponse {
            header: header(),
            tx_id: 9,
            result: CommitOutcome::Committed {
                commit_term: 3,
                commit_index: 44,
                commit_leader_lease_timeout: Some(1000),
            },
        }));
        roundtrip(Message::CommitResponse(CommitResponse {
            header: header(),
            tx_id: 10,
            result: CommitOutcome::Rejected {
                message: "reads conflict with committed writes".into(),
            },
        }));
    }

    #[test]
    fn install_snapshot_roundtrip() {
        let mut config = ClusterConfig::new();
        config.insert("node-a".into(), "addr:a".into());
        config.insert("node-b".into(), "addr:b".into());
        roundtrip(Message::InstallSnapshot(InstallSnapshot {
            header: header(),
            snapshot_term: 2,
            snapshot_index: 100,
            pair_index: 0,
            config: Some(config),
            last_chunk: false,
            data: vec![1, 2, 3],
        }));
        roundtrip(Message::InstallSnapshot(InstallSnapshot {
            header: header(),
            snapshot_term: 2,
            snapshot_index: 100,
            pair_index: 250,
            config: None,
            last_chunk: true,
            data: Vec::new(),
        }));
    }

    #[test]
    fn vote_messages_roundtrip() {
        roundtrip(Message::RequestVote(RequestVote {
            header: header(),
            last_log_term: 2,
            last_log_index: 10,
        }));
        roundtrip(Message::GrantVote(GrantVote { header: header() }));
        roundtrip(Message::PingRequest(PingRequest {
            header: header(),
            timestamp: 5,
        }));
        roundtrip(Message::PingResponse(PingResponse {
            header: header(),
            timestamp: 5,
        }));
    }

    #[test]
    fn entry_payload_roundtrip() {
        let mut writes = Writes::new();
        writes.put(b"a".to_vec(), b"1".to_vec());
        writes.adjust(b"ctr", 5);
        let change = Some(ConfigChange {
            identity: "node-d".into(),
            address: None,
        });
        let bytes = encode_entry_payload(&writes, &change);
        let (decoded_writes, decoded_change) = decode_entry_payload(&bytes).unwrap();
        assert_eq!(decoded_writes, writes);
        assert_eq!(decoded_change, change);
    }

    #[test]
    fn garbage_is_rejected_without_panicking() {
        assert!(Message::from_bytes(&[]).is_err());
        assert!(Message::from_bytes(&[42]).is_err());
        let mut bytes = Message::GrantVote(GrantVote { header: header() }).to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(Message::from_bytes(&bytes).is_err());
    }
}
