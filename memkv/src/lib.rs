//! An in-memory implementation of the `raftkv::AtomicKvStore` trait.
//!
//! `MemKv` keeps its contents in an ordered map behind an async lock and
//! serves snapshots by cloning the map, which is plenty for testing and for
//! use as the fallback controller's standalone store.

use std::collections::BTreeMap;

use anyhow::Result;
use raftkv::async_trait::async_trait;
use raftkv::kv::decode_counter;
use raftkv::kv::encode_counter;
use raftkv::AtomicKvStore;
use raftkv::KvPair;
use raftkv::KvSnapshot;
use raftkv::Writes;
use tokio::sync::RwLock;

/// An in-memory atomic key/value store.
#[derive(Default)]
pub struct MemKv {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// All pairs in key order; handy for test assertions.
    pub async fn dump(&self) -> Vec<KvPair> {
        let data = self.data.read().await;
        data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Directly read one value; handy for test assertions.
    pub async fn read(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().await.get(key).cloned()
    }
}

/// A point-in-time copy of the store contents.
pub struct MemSnapshot {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl KvSnapshot for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn next_pair(&self, min: &[u8]) -> Option<KvPair> {
        self.data.range(min.to_vec()..).next().map(|(k, v)| (k.clone(), v.clone()))
    }

    fn prev_pair(&self, max: Option<&[u8]>) -> Option<KvPair> {
        let mut range = match max {
            Some(max) => self.data.range(..max.to_vec()),
            None => self.data.range::<Vec<u8>, _>(..),
        };
        range.next_back().map(|(k, v)| (k.clone(), v.clone()))
    }
}

#[async_trait]
impl AtomicKvStore for MemKv {
    type Snapshot = MemSnapshot;

    async fn snapshot(&self) -> Result<MemSnapshot> {
        let data = self.data.read().await;
        Ok(MemSnapshot { data: data.clone() })
    }

    async fn mutate(&self, writes: Writes, _sync: bool) -> Result<()> {
        let mut data = self.data.write().await;

        // Removes first, then puts, then counter adjusts.
        for range in writes.remove_ranges.as_list() {
            let doomed: Vec<Vec<u8>> = data.range(range.min.clone()..).map(|(k, _)| k.clone()).take_while(|k| range.contains(k)).collect();
            for key in doomed {
                data.remove(&key);
            }
        }
        for (key, value) in writes.puts {
            data.insert(key, value);
        }
        for (key, delta) in writes.adjusts {
            let current = data.get(&key).map(|v| decode_counter(v)).unwrap_or(0);
            data.insert(key, encode_counter(current.wrapping_add(delta)).to_vec());
        }
        Ok(())
    }
}
