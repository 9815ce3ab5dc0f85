//! An MVCC view over a store snapshot.

use crate::kv::key_successor;
use crate::kv::KeyRange;
use crate::kv::KvPair;
use crate::kv::KvSnapshot;
use crate::kv::Reads;
use crate::kv::Writes;

/// A mutable, isolated view of the key/value state as of one log position.
///
/// The view composes three layers, bottom to top:
///
/// 1. `snapshot` — the store contents at the position the view was opened;
/// 2. `committed` — writes of log entries committed after the view's base
///    which have been folded in by rebase;
/// 3. `writes` — the owning transaction's own mutations.
///
/// Reads resolve through the layers top-down and are recorded in `reads`
/// (when tracking is enabled) for later conflict detection.
pub struct MutableView<S: KvSnapshot> {
    snapshot: S,
    committed: Writes,
    writes: Writes,
    reads: Reads,
    track_reads: bool,
}

impl<S: KvSnapshot> MutableView<S> {
    pub fn new(snapshot: S) -> Self {
        Self {
            snapshot,
            committed: Writes::new(),
            writes: Writes::new(),
            reads: Reads::new(),
            track_reads: true,
        }
    }

    /// Enable or disable read tracking.
    pub fn set_track_reads(&mut self, track: bool) {
        self.track_reads = track;
    }

    pub fn reads(&self) -> &Reads {
        &self.reads
    }

    pub fn writes(&self) -> &Writes {
        &self.writes
    }

    /// True if the view has recorded no mutations.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Fold the writes of a committed log entry beneath this view's own
    /// writes. The caller has already verified the entry does not conflict
    /// with this view's reads.
    pub fn apply_committed(&mut self, writes: &Writes) {
        self.committed.merge(writes);
    }

    /// Get the value for `key`, if any.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        if self.track_reads {
            self.reads.record_key(key);
        }
        self.resolve(key)
    }

    /// The first pair with key in `[min, max)`, if any.
    pub fn get_at_least(&mut self, min: &[u8], max: Option<&[u8]>) -> Option<KvPair> {
        let found = self.next_entry(min, max);
        if self.track_reads {
            let upper = match &found {
                Some((key, _)) => Some(key_successor(key)),
                None => max.map(|m| m.to_vec()),
            };
            self.reads.record_range(KeyRange::new(min.to_vec(), upper));
        }
        found
    }

    /// The last pair with key in `[min, max)`, if any.
    pub fn get_at_most(&mut self, min: &[u8], max: Option<&[u8]>) -> Option<KvPair> {
        let found = self.prev_entry(min, max);
        if self.track_reads {
            let lower = match &found {
                Some((key, _)) => key.clone(),
                None => min.to_vec(),
            };
            self.reads.record_range(KeyRange::new(lower, max.map(|m| m.to_vec())));
        }
        found
    }

    /// All pairs with keys in `[min, max)`, in key order (reversed when
    /// `reverse` is set).
    pub fn get_range(&mut self, min: &[u8], max: Option<&[u8]>, reverse: bool) -> Vec<KvPair> {
        let mut pairs = Vec::new();
        let mut cursor = min.to_vec();
        loop {
            match self.next_entry(&cursor, max) {
                Some((key, value)) => {
                    cursor = key_successor(&key);
                    pairs.push((key, value));
                }
                None => break,
            }
        }
        if self.track_reads {
            self.reads.record_range(KeyRange::new(min.to_vec(), max.map(|m| m.to_vec())));
        }
        if reverse {
            pairs.reverse();
        }
        pairs
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.put(key, value);
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.writes.remove(key);
    }

    pub fn remove_range(&mut self, range: KeyRange) {
        self.writes.remove_range(range);
    }

    pub fn adjust(&mut self, key: &[u8], delta: i64) {
        // An adjust folds onto the current visible value only at apply time;
        // locally we just accumulate the delta.
        self.writes.adjust(key, delta);
    }

    /// Resolve `key` through all three layers without recording a read.
    fn resolve(&self, key: &[u8]) -> Option<Vec<u8>> {
        let base = self.snapshot.get(key);
        let base = self.committed.apply_to(key, base);
        self.writes.apply_to(key, base)
    }

    /// The first visible pair at or above `lower` and strictly below `max`.
    fn next_entry(&self, lower: &[u8], max: Option<&[u8]>) -> Option<KvPair> {
        let mut bound = lower.to_vec();
        loop {
            let mut candidate: Option<Vec<u8>> = None;
            let mut consider = |key: &[u8]| {
                if let Some(limit) = max {
                    if key >= limit {
                        return;
                    }
                }
                match &candidate {
                    Some(current) if &current[..] <= key => {}
                    _ => candidate = Some(key.to_vec()),
                }
            };

            if let Some((key, _)) = self.snapshot.next_pair(&bound) {
                consider(&key);
            }
            for overlay in [&self.committed, &self.writes] {
                if let Some((key, _)) = overlay.puts.range(bound.clone()..).next() {
                    consider(key);
                }
                if let Some((key, _)) = overlay.adjusts.range(bound.clone()..).next() {
                    consider(key);
                }
            }

            let key = candidate?;
            if let Some(value) = self.resolve(&key) {
                return Some((key, value));
            }
            // The candidate is shadowed by a remove above it; step past it.
            bound = key_successor(&key);
        }
    }

    /// The last visible pair strictly below `max` and at or above `lower`.
    fn prev_entry(&self, lower: &[u8], max: Option<&[u8]>) -> Option<KvPair> {
        let mut bound: Option<Vec<u8>> = max.map(|m| m.to_vec());
        loop {
            let mut candidate: Option<Vec<u8>> = None;
            let mut consider = |key: &[u8]| {
                if key < lower {
                    return;
                }
                match &candidate {
                    Some(current) if &current[..] >= key => {}
                    _ => candidate = Some(key.to_vec()),
                }
            };

            if let Some((key, _)) = self.snapshot.prev_pair(bound.as_deref()) {
                consider(&key);
            }
            for overlay in [&self.committed, &self.writes] {
                let mut range = match &bound {
                    Some(upper) => overlay.puts.range(..upper.clone()),
                    None => overlay.puts.range::<Vec<u8>, _>(..),
                };
                if let Some((key, _)) = range.next_back() {
                    consider(key);
                }
                let mut range = match &bound {
                    Some(upper) => overlay.adjusts.range(..upper.clone()),
                    None => overlay.adjusts.range::<Vec<u8>, _>(..),
                };
                if let Some((key, _)) = range.next_back() {
                    consider(key);
                }
            }

            let key = candidate?;
            if let Some(value) = self.resolve(&key) {
                return Some((key, value));
            }
            bound = Some(key);
        }
    }
}
