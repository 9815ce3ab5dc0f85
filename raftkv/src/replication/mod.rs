//! Leader-side replication bookkeeping and outbound message plumbing.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::codec;
use crate::codec::DecodeError;
use crate::codec::DecodeResult;
use crate::config::MAX_CLOCK_DRIFT;
use crate::kv::KvPair;
use crate::kv::KvSnapshot;
use crate::message::ClusterConfig;
use crate::message::Message;
use crate::message::RaftTransport;
use crate::MessageSummary;
use crate::NodeId;

/// Per-peer outbound queue capacity. A full queue drops messages, which the
/// transport contract already permits; ordering is what must be preserved.
const PEER_QUEUE_DEPTH: usize = 256;

/// Outbound message queues, one task per peer address.
///
/// Each address gets a dedicated sender task draining a FIFO channel, so
/// messages to a given peer are delivered in send order while the core task
/// never blocks on the network.
pub(crate) struct PeerQueues<T: RaftTransport> {
    transport: Arc<T>,
    queues: HashMap<String, mpsc::Sender<Message>>,
}

impl<T: RaftTransport> PeerQueues<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            queues: HashMap::new(),
        }
    }

    /// Enqueue `msg` for delivery to `address`. Never blocks; drops the
    /// message if the peer's queue is full.
    pub fn send(&mut self, address: &str, msg: Message) {
        let queue = self.queues.entry(address.to_string()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_DEPTH);
            let transport = self.transport.clone();
            let address = address.to_string();
            tokio::spawn(
                async move {
                    while let Some(msg) = rx.recv().await {
                        if let Err(err) = transport.send(&address, msg).await {
                            tracing::debug!(address=%address, error=%err, "dropping undeliverable message");
                        }
                    }
                }
                .instrument(tracing::debug_span!("peer-queue")),
            );
            tx
        });

        if let Err(err) = queue.try_send(msg) {
            match err {
                mpsc::error::TrySendError::Full(msg) => {
                    tracing::debug!(address, "peer queue full, dropping {}", msg.summary());
                }
                mpsc::error::TrySendError::Closed(_) => {
                    // The sender task only exits when its channel closes, so
                    // recreate it on the next send.
                    self.queues.remove(address);
                }
            }
        }
    }
}

/// The leader's view of one follower.
#[derive(Debug)]
pub(crate) struct FollowerRep {
    pub identity: NodeId,
    pub address: String,
    /// Index of the next log entry to send; in `[1, last_index + 1]`.
    pub next_index: u64,
    /// Highest index known replicated on the follower.
    pub match_index: u64,
    /// The commit index most recently sent to this follower.
    pub leader_commit: u64,
    /// True once the follower has acknowledged an entry at `next_index - 1`,
    /// enabling pipelined sends.
    pub synced: bool,
    /// The most recent leader-clock timestamp echoed by this follower.
    pub leader_timestamp: Option<u64>,
    /// In-progress snapshot transfer, if any; ordinary appends are
    /// suppressed while this is set.
    pub snapshot_transmit: Option<TransmitHandle>,
    /// Indexes of entries whose data this follower is known to already hold
    /// (it forwarded the commit that produced them), so the leader can send
    /// the entry header without the payload.
    pub skip_data_indexes: HashSet<u64>,
}

impl FollowerRep {
    pub fn new(identity: NodeId, address: String, last_log_index: u64) -> Self {
        Self {
            identity,
            address,
            next_index: last_log_index + 1,
            match_index: 0,
            leader_commit: 0,
            synced: false,
            leader_timestamp: None,
            snapshot_transmit: None,
            skip_data_indexes: HashSet::new(),
        }
    }
}

/// Marks a snapshot transfer to one follower, with its start time.
#[derive(Debug)]
pub(crate) struct TransmitHandle {
    pub started: Instant,
}

/// A chunk produced by [`SnapshotTransmit::next_chunk`].
pub(crate) struct SnapshotChunk {
    pub pair_index: u64,
    pub data: Vec<u8>,
    pub last_chunk: bool,
}

/// Streams the key/value pairs of a store snapshot as bounded chunks.
///
/// Keys are shared-prefix compressed, with the compression context carried
/// across chunk boundaries; the receiver must decode chunks in order. At
/// least one (possibly empty) chunk is always produced.
pub(crate) struct SnapshotTransmit<S: KvSnapshot> {
    pub term: u64,
    pub index: u64,
    pub config: ClusterConfig,
    snapshot: S,
    pair_index: u64,
    previous_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl<S: KvSnapshot> SnapshotTransmit<S> {
    pub fn new(snapshot: S, term: u64, index: u64, config: ClusterConfig) -> Self {
        Self {
            term,
            index,
            config,
            snapshot,
            pair_index: 0,
            previous_key: None,
            exhausted: false,
        }
    }

    /// Produce the next chunk of at most roughly `max_bytes` of pair data,
    /// or `None` once the final chunk has been produced.
    pub fn next_chunk(&mut self, max_bytes: usize) -> Option<SnapshotChunk> {
        if self.exhausted {
            return None;
        }
        let first_pair_index = self.pair_index;
        let mut data = Vec::new();
        loop {
            let cursor = match &self.previous_key {
                Some(key) => crate::kv::key_successor(key),
                None => Vec::new(),
            };
            let pair = match self.snapshot.next_pair(&cursor) {
                Some(pair) => pair,
                None => {
                    self.exhausted = true;
                    return Some(SnapshotChunk {
                        pair_index: first_pair_index,
                        data,
                        last_chunk: true,
                    });
                }
            };
            codec::put_key(&mut data, self.previous_key.as_deref().unwrap_or(b""), &pair.0);
            codec::put_bytes(&mut data, &pair.1);
            self.previous_key = Some(pair.0);
            self.pair_index += 1;
            if data.len() >= max_bytes {
                return Some(SnapshotChunk {
                    pair_index: first_pair_index,
                    data,
                    last_chunk: false,
                });
            }
        }
    }
}

/// Decode the pairs of one snapshot chunk. `previous_key` is the last key of
/// the preceding chunk (`None` for the first); returns the pairs and the new
/// compression context.
pub(crate) fn decode_snapshot_pairs(
    data: &[u8],
    previous_key: Option<&[u8]>,
) -> DecodeResult<(Vec<KvPair>, Option<Vec<u8>>)> {
    let mut input = data;
    let mut prev: Option<Vec<u8>> = previous_key.map(|k| k.to_vec());
    let mut pairs = Vec::new();
    while !input.is_empty() {
        let key = codec::get_key(&mut input, prev.as_deref().unwrap_or(b""))?;
        let value = codec::get_bytes(&mut input)?;
        if let Some(prev) = &prev {
            if &key <= prev {
                return Err(DecodeError::Malformed("snapshot pairs out of order"));
            }
        }
        prev = Some(key.clone());
        pairs.push((key, value));
    }
    Ok((pairs, prev))
}

/// Compute the leader lease timeout from the followers' most recently echoed
/// leader timestamps (`None` for a follower never heard from).
///
/// The lease is the earliest instant, on the leader's clock, at which a
/// different leader could legitimately be elected: any rival majority must
/// include the follower at the pivot position chosen here, and that follower
/// cannot start an election until a full minimum election timeout after it
/// last heard from us, discounted by the assumed clock drift.
pub(crate) fn compute_lease_timeout(follower_timestamps: &[Option<u64>], min_election_timeout: u64) -> Option<u64> {
    if follower_timestamps.is_empty() {
        // Single-node cluster: no other leader is possible.
        return Some(u64::MAX);
    }
    let mut sorted: Vec<Option<u64>> = follower_timestamps.to_vec();
    // None sorts first.
    sorted.sort();
    let pivot = sorted[(sorted.len() + 1) / 2]?;
    let grace = (min_election_timeout as f64 * (1.0 - MAX_CLOCK_DRIFT)) as u64;
    Some(pivot + grace - 1)
}
