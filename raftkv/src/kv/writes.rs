//! Batched mutations and read tracking.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::codec::DecodeError;
use crate::codec::DecodeResult;
use crate::kv::KeyRange;
use crate::kv::KeyRanges;

/// A batch of mutations to apply atomically to a key/value store.
///
/// Application order is always: remove the `remove_ranges`, then apply the
/// `puts`, then apply the counter `adjusts`. The mutating helpers on this
/// type keep the three components canonical with respect to that order, so
/// two batches with the same effect compare equal.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Writes {
    /// Key ranges to remove, in minimal form.
    pub remove_ranges: KeyRanges,
    /// Key/value pairs to store, in key order.
    pub puts: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Counter deltas, in key order.
    pub adjusts: BTreeMap<Vec<u8>, i64>,
}

impl Writes {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this batch mutates nothing.
    pub fn is_empty(&self) -> bool {
        self.remove_ranges.is_empty() && self.puts.is_empty() && self.adjusts.is_empty()
    }

    /// Record a put, superseding any earlier adjust of the same key.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.adjusts.remove(&key);
        self.puts.insert(key, value);
    }

    /// Record removal of a single key.
    pub fn remove(&mut self, key: &[u8]) {
        self.puts.remove(key);
        self.adjusts.remove(key);
        self.remove_ranges.add_key(key);
    }

    /// Record removal of the half-open range `[min, max)`.
    pub fn remove_range(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let keys: Vec<Vec<u8>> = self.puts.keys().filter(|k| range.contains(k)).cloned().collect();
        for key in keys {
            self.puts.remove(&key);
        }
        let keys: Vec<Vec<u8>> = self.adjusts.keys().filter(|k| range.contains(k)).cloned().collect();
        for key in keys {
            self.adjusts.remove(&key);
        }
        self.remove_ranges.add(range);
    }

    /// Record a counter adjustment, folding into an earlier put if present.
    pub fn adjust(&mut self, key: &[u8], delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(value) = self.puts.get_mut(key) {
            let folded = decode_counter(value).wrapping_add(delta);
            *value = encode_counter(folded).to_vec();
            return;
        }
        let slot = self.adjusts.entry(key.to_vec()).or_insert(0);
        *slot = slot.wrapping_add(delta);
        if *slot == 0 {
            self.adjusts.remove(key);
        }
    }

    /// The effect of this batch on a single key, given the value beneath it.
    pub fn apply_to(&self, key: &[u8], base: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let mut value = if self.remove_ranges.contains_key(key) { None } else { base };
        if let Some(put) = self.puts.get(key) {
            value = Some(put.clone());
        }
        if let Some(delta) = self.adjusts.get(key) {
            let counter = value.as_deref().map(decode_counter).unwrap_or(0);
            value = Some(encode_counter(counter.wrapping_add(*delta)).to_vec());
        }
        value
    }

    /// Fold `other` on top of this batch, preserving batch semantics.
    pub fn merge(&mut self, other: &Writes) {
        for range in other.remove_ranges.as_list() {
            self.remove_range(range.clone());
        }
        for (key, value) in &other.puts {
            self.put(key.clone(), value.clone());
        }
        for (key, delta) in &other.adjusts {
            self.adjust(key, *delta);
        }
    }

    /// All keys and ranges this batch touches, as a `KeyRanges`.
    pub fn touched_ranges(&self) -> KeyRanges {
        let mut ranges = self.remove_ranges.clone();
        for key in self.puts.keys() {
            ranges.add_key(key);
        }
        for key in self.adjusts.keys() {
            ranges.add_key(key);
        }
        ranges
    }

    /// Serialize into `buf` in the wire/log file format.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_uvarint(buf, self.remove_ranges.len() as u64);
        let mut prev: Vec<u8> = Vec::new();
        for range in self.remove_ranges.as_list() {
            codec::put_key(buf, &prev, &range.min);
            prev = range.min.clone();
            match &range.max {
                Some(max) => {
                    codec::put_u8(buf, 1);
                    codec::put_key(buf, &prev, max);
                    prev = max.clone();
                }
                None => codec::put_u8(buf, 0),
            }
        }

        codec::put_uvarint(buf, self.puts.len() as u64);
        let mut prev: Vec<u8> = Vec::new();
        for (key, value) in &self.puts {
            codec::put_key(buf, &prev, key);
            codec::put_bytes(buf, value);
            prev = key.clone();
        }

        codec::put_uvarint(buf, self.adjusts.len() as u64);
        let mut prev: Vec<u8> = Vec::new();
        for (key, delta) in &self.adjusts {
            codec::put_key(buf, &prev, key);
            codec::put_ivarint(buf, *delta);
            prev = key.clone();
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Deserialize from the wire/log file format.
    pub fn decode(input: &mut &[u8]) -> DecodeResult<Self> {
        let mut writes = Writes::new();

        let num_ranges = codec::get_uvarint(input)?;
        let mut prev: Vec<u8> = Vec::new();
        for _ in 0..num_ranges {
            let min = codec::get_key(input, &prev)?;
            prev = min.clone();
            let max = match codec::get_u8(input)? {
                0 => None,
                1 => {
                    let max = codec::get_key(input, &prev)?;
                    prev = max.clone();
                    Some(max)
                }
                _ => return Err(DecodeError::Malformed("bad range bound tag")),
            };
            writes.remove_ranges.add(KeyRange::new(min, max));
        }

        let num_puts = codec::get_uvarint(input)?;
        let mut prev: Vec<u8> = Vec::new();
        for _ in 0..num_puts {
            let key = codec::get_key(input, &prev)?;
            let value = codec::get_bytes(input)?;
            prev = key.clone();
            writes.puts.insert(key, value);
        }

        let num_adjusts = codec::get_uvarint(input)?;
        let mut prev: Vec<u8> = Vec::new();
        for _ in 0..num_adjusts {
            let key = codec::get_key(input, &prev)?;
            let delta = codec::get_ivarint(input)?;
            prev = key.clone();
            writes.adjusts.insert(key, delta);
        }

        Ok(writes)
    }

    pub fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        let mut input = bytes;
        let writes = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::Malformed("trailing bytes after writes"));
        }
        Ok(writes)
    }
}

impl fmt::Debug for Writes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writes")
            .field("remove_ranges", &self.remove_ranges)
            .field("puts", &self.puts.len())
            .field("adjusts", &self.adjusts.len())
            .finish()
    }
}

/// The set of keys a transaction has actually read.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reads {
    ranges: KeyRanges,
}

impl Reads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &KeyRanges {
        &self.ranges
    }

    /// Record that a single key was read.
    pub fn record_key(&mut self, key: &[u8]) {
        self.ranges.add_key(key);
    }

    /// Record that the half-open range `[min, max)` was scanned.
    pub fn record_range(&mut self, range: KeyRange) {
        self.ranges.add(range);
    }

    /// True if any read intersects any remove range, put key or adjust key
    /// of `writes`.
    pub fn find_conflict(&self, writes: &Writes) -> bool {
        if self.ranges.is_empty() || writes.is_empty() {
            return false;
        }
        if self.ranges.intersects(&writes.remove_ranges) {
            return true;
        }
        writes.puts.keys().any(|k| self.ranges.contains_key(k))
            || writes.adjusts.keys().any(|k| self.ranges.contains_key(k))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_uvarint(buf, self.ranges.len() as u64);
        let mut prev: Vec<u8> = Vec::new();
        for range in self.ranges.as_list() {
            codec::put_key(buf, &prev, &range.min);
            prev = range.min.clone();
            match &range.max {
                Some(max) => {
                    codec::put_u8(buf, 1);
                    codec::put_key(buf, &prev, max);
                    prev = max.clone();
                }
                None => codec::put_u8(buf, 0),
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(input: &mut &[u8]) -> DecodeResult<Self> {
        let num_ranges = codec::get_uvarint(input)?;
        let mut ranges = KeyRanges::new();
        let mut prev: Vec<u8> = Vec::new();
        for _ in 0..num_ranges {
            let min = codec::get_key(input, &prev)?;
            prev = min.clone();
            let max = match codec::get_u8(input)? {
                0 => None,
                1 => {
                    let max = codec::get_key(input, &prev)?;
                    prev = max.clone();
                    Some(max)
                }
                _ => return Err(DecodeError::Malformed("bad range bound tag")),
            };
            ranges.add(KeyRange::new(min, max));
        }
        Ok(Reads { ranges })
    }

    pub fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        let mut input = bytes;
        let reads = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::Malformed("trailing bytes after reads"));
        }
        Ok(reads)
    }
}

/// Decode a counter value. Values are 8-byte big-endian; anything else reads
/// as zero so an adjust can repair a clobbered counter.
pub fn decode_counter(value: &[u8]) -> i64 {
    if value.len() != 8 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(value);
    i64::from_be_bytes(bytes)
}

/// Encode a counter value as 8 big-endian bytes.
pub fn encode_counter(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn range(min: &[u8], max: &[u8]) -> KeyRange {
        KeyRange::new(min.to_vec(), Some(max.to_vec()))
    }

    #[test]
    fn put_supersedes_adjust() {
        let mut w = Writes::new();
        w.adjust(b"ctr", 5);
        w.put(b"ctr".to_vec(), encode_counter(7).to_vec());
        assert!(w.adjusts.is_empty());
        assert_eq!(w.apply_to(b"ctr", None), Some(encode_counter(7).to_vec()));
    }

    #[test]
    fn adjust_folds_into_put() {
        let mut w = Writes::new();
        w.put(b"ctr".to_vec(), encode_counter(7).to_vec());
        w.adjust(b"ctr", -2);
        assert_eq!(w.apply_to(b"ctr", None), Some(encode_counter(5).to_vec()));
        assert!(w.adjusts.is_empty());
    }

    #[test]
    fn adjust_on_missing_key_creates_counter() {
        let mut w = Writes::new();
        w.adjust(b"ctr", 3);
        assert_eq!(w.apply_to(b"ctr", None), Some(encode_counter(3).to_vec()));
        assert_eq!(
            w.apply_to(b"ctr", Some(encode_counter(10).to_vec())),
            Some(encode_counter(13).to_vec())
        );
    }

    #[test]
    fn remove_range_drops_covered_puts() {
        let mut w = Writes::new();
        w.put(b"a".to_vec(), b"1".to_vec());
        w.put(b"m".to_vec(), b"2".to_vec());
        w.adjust(b"n", 4);
        w.remove_range(range(b"m", b"z"));
        assert_eq!(w.puts.len(), 1);
        assert!(w.adjusts.is_empty());
        assert_eq!(w.apply_to(b"m", Some(b"old".to_vec())), None);
        assert_eq!(w.apply_to(b"a", None), Some(b"1".to_vec()));
    }

    #[test]
    fn apply_order_is_removes_then_puts_then_adjusts() {
        let mut w = Writes::new();
        w.remove_ranges.add(range(b"a", b"z"));
        w.puts.insert(b"k".to_vec(), encode_counter(100).to_vec());
        w.adjusts.insert(b"k".to_vec(), 1);
        // The put survives its own remove range, and the adjust applies last.
        assert_eq!(
            w.apply_to(b"k", Some(b"stale".to_vec())),
            Some(encode_counter(101).to_vec())
        );
        // A key only covered by the remove range reads as absent.
        assert_eq!(w.apply_to(b"q", Some(b"stale".to_vec())), None);
    }

    #[test]
    fn merge_matches_sequential_application() {
        let mut first = Writes::new();
        first.put(b"a".to_vec(), b"1".to_vec());
        first.put(b"b".to_vec(), encode_counter(10).to_vec());

        let mut second = Writes::new();
        second.remove(b"a");
        second.adjust(b"b", 5);
        second.put(b"c".to_vec(), b"3".to_vec());

        let mut merged = first.clone();
        merged.merge(&second);

        for key in [&b"a"[..], b"b", b"c", b"d"] {
            let sequential = second.apply_to(key, first.apply_to(key, None));
            assert_eq!(merged.apply_to(key, None), sequential, "key {:?}", key);
        }
    }

    #[test]
    fn writes_roundtrip() {
        let mut w = Writes::new();
        w.remove_range(range(b"gone/a", b"gone/z"));
        w.remove_range(KeyRange::new(b"tail".to_vec(), None));
        w.put(b"row/alpha".to_vec(), b"one".to_vec());
        w.put(b"row/alphabet".to_vec(), vec![0u8; 100]);
        w.adjust(b"counters/hits", -42);

        let bytes = w.to_bytes();
        let decoded = Writes::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, w);
    }

    #[test]
    fn empty_writes_roundtrip() {
        let w = Writes::new();
        assert_eq!(Writes::from_bytes(&w.to_bytes()).unwrap(), w);
    }

    #[test]
    fn reads_roundtrip() {
        let mut r = Reads::new();
        r.record_key(b"k1");
        r.record_range(range(b"scan/a", b"scan/m"));
        let decoded = Reads::from_bytes(&r.to_bytes()).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn find_conflict() {
        let mut r = Reads::new();
        r.record_range(range(b"b", b"f"));

        let mut w = Writes::new();
        w.put(b"x".to_vec(), b"1".to_vec());
        assert!(!r.find_conflict(&w));

        w.put(b"c".to_vec(), b"1".to_vec());
        assert!(r.find_conflict(&w));

        let mut w = Writes::new();
        w.adjust(b"e", 1);
        assert!(r.find_conflict(&w));

        let mut w = Writes::new();
        w.remove_range(range(b"a", b"c"));
        assert!(r.find_conflict(&w));

        let mut w = Writes::new();
        w.remove_range(range(b"f", b"z"));
        assert!(!r.find_conflict(&w));
    }

    #[test]
    fn truncated_writes_fail_to_decode() {
        let mut w = Writes::new();
        w.put(b"key".to_vec(), b"value".to_vec());
        let bytes = w.to_bytes();
        assert!(Writes::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }
}
