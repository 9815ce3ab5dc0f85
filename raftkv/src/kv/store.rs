//! The interface to the underlying single-node key/value store.

use anyhow::Result;
use async_trait::async_trait;

use crate::kv::Writes;

/// A key/value pair.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A point-in-time, read-only view of an [`AtomicKvStore`].
///
/// Snapshots are lifetime-scoped: dropping the value releases whatever the
/// backing store pinned to serve it. Reads never observe mutations applied
/// after the snapshot was taken.
pub trait KvSnapshot: Send + Sync + 'static {
    /// Get the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// The first pair with key at or above `min`, if any.
    fn next_pair(&self, min: &[u8]) -> Option<KvPair>;

    /// The last pair with key strictly below `max` (or the greatest pair when
    /// `max` is `None`), if any.
    fn prev_pair(&self, max: Option<&[u8]>) -> Option<KvPair>;
}

/// A single-node key/value store primitive providing an atomic snapshot and
/// an atomic batched mutation.
///
/// This is the state machine the replication engine applies committed log
/// entries to; the engine owns durability sequencing but delegates the
/// actual storage to implementations of this trait.
#[async_trait]
pub trait AtomicKvStore: Send + Sync + 'static {
    type Snapshot: KvSnapshot;

    /// Take a consistent snapshot of the current contents.
    async fn snapshot(&self) -> Result<Self::Snapshot>;

    /// Atomically apply `writes` (removes, then puts, then adjusts).
    ///
    /// With `sync` set, the mutation must be durable before this returns.
    async fn mutate(&self, writes: Writes, sync: bool) -> Result<()>;
}
