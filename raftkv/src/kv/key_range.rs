//! Half-open key ranges and normalized sets of them.

use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::kv::key_successor;

/// A half-open range of byte keys `[min, max)` in unsigned lexicographic order.
///
/// A `max` of `None` denotes an unbounded upper end. The empty key is the
/// smallest possible key, so `KeyRange::full()` covers the entire key space.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub min: Vec<u8>,
    /// Exclusive upper bound; `None` means unbounded.
    pub max: Option<Vec<u8>>,
}

impl KeyRange {
    /// Create a new range `[min, max)`.
    pub fn new(min: Vec<u8>, max: Option<Vec<u8>>) -> Self {
        Self { min, max }
    }

    /// The range containing only the given key.
    pub fn single(key: &[u8]) -> Self {
        Self {
            min: key.to_vec(),
            max: Some(key_successor(key)),
        }
    }

    /// The range covering the entire key space.
    pub fn full() -> Self {
        Self {
            min: Vec::new(),
            max: None,
        }
    }

    /// True if this range contains no keys.
    pub fn is_empty(&self) -> bool {
        match &self.max {
            Some(max) => *max <= self.min,
            None => false,
        }
    }

    /// True if `key` falls within this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < &self.min[..] {
            return false;
        }
        match &self.max {
            Some(max) => key < &max[..],
            None => true,
        }
    }

    /// True if this range and `other` share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        !range_max_le_min(&self.max, &other.min) && !range_max_le_min(&other.max, &self.min)
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.max {
            Some(max) => write!(f, "[{}..{})", hex(&self.min), hex(max)),
            None => write!(f, "[{}..)", hex(&self.min)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// True if `max` (an exclusive upper bound) sits at or below `min`.
fn range_max_le_min(max: &Option<Vec<u8>>, min: &[u8]) -> bool {
    match max {
        Some(max) => &max[..] <= min,
        None => false,
    }
}

/// Compare two exclusive upper bounds, where `None` is greatest.
fn cmp_max(a: &Option<Vec<u8>>, b: &Option<Vec<u8>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// A normalized set of non-overlapping, non-adjacent key ranges.
///
/// The ranges are kept sorted by `min` and in minimal form: any two ranges
/// that overlap or abut are coalesced into one. This invariant is maintained
/// by every mutating operation.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRanges {
    ranges: Vec<KeyRange>,
}

impl KeyRanges {
    /// Create an empty set.
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Create a set covering the full key space.
    pub fn full() -> Self {
        let mut kr = Self::new();
        kr.add(KeyRange::full());
        kr
    }

    /// True if the set contains no keys.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The number of distinct ranges in minimal form.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// The ranges in ascending order.
    pub fn as_list(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// Remove all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Add a single range, coalescing as needed.
    pub fn add(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }

        // Find the window of existing ranges which overlap or abut the new
        // range, widen the new range to cover them, and splice it in.
        let start = self.ranges.partition_point(|r| range_max_lt_or_adjacent(&r.max, &range.min));
        let mut min = range.min;
        let mut max = range.max;
        let mut end = start;
        while end < self.ranges.len() {
            let existing = &self.ranges[end];
            let touches = match &max {
                Some(m) => existing.min <= *m,
                None => true,
            };
            if !touches {
                break;
            }
            if existing.min < min {
                min = existing.min.clone();
            }
            if cmp_max(&existing.max, &max) == Ordering::Greater {
                max = existing.max.clone();
            }
            end += 1;
        }
        self.ranges.splice(start..end, std::iter::once(KeyRange::new(min, max)));
    }

    /// Add the single-key range for `key`.
    pub fn add_key(&mut self, key: &[u8]) {
        self.add(KeyRange::single(key));
    }

    /// True if `key` is a member of any range in the set.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        match self.seek_lower(key) {
            Some(range) => range.contains(key),
            None => false,
        }
    }

    /// True if `range` intersects any range in the set.
    pub fn intersects_range(&self, range: &KeyRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let idx = self.ranges.partition_point(|r| range_max_le_min(&r.max, &range.min));
        match self.ranges.get(idx) {
            Some(r) => r.intersects(range),
            None => false,
        }
    }

    /// True if any key belongs to both sets.
    pub fn intersects(&self, other: &KeyRanges) -> bool {
        other.ranges.iter().any(|r| self.intersects_range(r))
    }

    /// The last range whose `min` is at or below `key`, if any.
    pub fn seek_lower(&self, key: &[u8]) -> Option<&KeyRange> {
        let idx = self.ranges.partition_point(|r| &r.min[..] <= key);
        idx.checked_sub(1).map(|i| &self.ranges[i])
    }

    /// The first range containing `key` or lying entirely above it, if any.
    pub fn seek_higher(&self, key: &[u8]) -> Option<&KeyRange> {
        let idx = self.ranges.partition_point(|r| range_max_le_min(&r.max, key));
        self.ranges.get(idx)
    }

    /// The union of this set and `other`.
    pub fn union(&self, other: &KeyRanges) -> KeyRanges {
        let mut result = self.clone();
        for range in &other.ranges {
            result.add(range.clone());
        }
        result
    }

    /// Merge `other` into this set in place.
    pub fn extend(&mut self, other: &KeyRanges) {
        for range in &other.ranges {
            self.add(range.clone());
        }
    }

    /// The intersection of this set and `other`.
    pub fn intersection(&self, other: &KeyRanges) -> KeyRanges {
        let mut result = KeyRanges::new();
        let mut i = 0;
        let mut j = 0;
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = &self.ranges[i];
            let b = &other.ranges[j];
            let min = if a.min >= b.min { a.min.clone() } else { b.min.clone() };
            let max = match cmp_max(&a.max, &b.max) {
                Ordering::Less | Ordering::Equal => a.max.clone(),
                Ordering::Greater => b.max.clone(),
            };
            let candidate = KeyRange::new(min, max);
            if !candidate.is_empty() {
                result.add(candidate);
            }
            // Advance whichever range ends first.
            match cmp_max(&a.max, &b.max) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        result
    }

    /// The complement of this set over the full key space.
    pub fn inverse(&self) -> KeyRanges {
        let mut result = KeyRanges::new();
        let mut cursor: Vec<u8> = Vec::new();
        let mut unbounded_tail = true;
        for range in &self.ranges {
            if range.min > cursor {
                result.add(KeyRange::new(cursor.clone(), Some(range.min.clone())));
            }
            match &range.max {
                Some(max) => cursor = max.clone(),
                None => {
                    unbounded_tail = false;
                    break;
                }
            }
        }
        if unbounded_tail {
            result.add(KeyRange::new(cursor, None));
        }
        result
    }

    /// Remove all keys in `range` from this set, splitting ranges as needed.
    pub fn remove(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        let mut replacement = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if !existing.intersects(range) {
                replacement.push(existing);
                continue;
            }
            // Keep the part below the removed range.
            if existing.min < range.min {
                replacement.push(KeyRange::new(existing.min.clone(), Some(range.min.clone())));
            }
            // Keep the part above the removed range.
            if let Some(rmax) = &range.max {
                if cmp_max(&existing.max, &range.max) == Ordering::Greater {
                    replacement.push(KeyRange::new(rmax.clone(), existing.max.clone()));
                }
            }
        }
        self.ranges = replacement;
    }
}

impl fmt::Debug for KeyRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges.iter()).finish()
    }
}

impl From<KeyRange> for KeyRanges {
    fn from(range: KeyRange) -> Self {
        let mut kr = KeyRanges::new();
        kr.add(range);
        kr
    }
}

/// True if `max` sits strictly below `min` with a gap, i.e. the two ranges
/// neither overlap nor abut.
fn range_max_lt_or_adjacent(max: &Option<Vec<u8>>, min: &[u8]) -> bool {
    match max {
        Some(max) => &max[..] < min,
        None => false,
    }
}
