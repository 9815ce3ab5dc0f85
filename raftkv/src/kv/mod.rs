//! The key/value data model: keys, ranges, batched writes and MVCC views.

mod key_range;
mod store;
mod view;
mod writes;

pub use key_range::KeyRange;
pub use key_range::KeyRanges;
pub use store::AtomicKvStore;
pub use store::KvPair;
pub use store::KvSnapshot;
pub use view::MutableView;
pub use writes::decode_counter;
pub use writes::encode_counter;
pub use writes::Reads;
pub use writes::Writes;

/// Returns the immediate successor of `key` in unsigned lexicographic order.
///
/// The successor of a key is the smallest key strictly greater than it, which
/// is always the key with a single zero byte appended.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut succ = Vec::with_capacity(key.len() + 1);
    succ.extend_from_slice(key);
    succ.push(0);
    succ
}
