//! Durable storage for the Raft log and node metadata.
//!
//! Each log entry is persisted as one file whose name encodes its index and
//! term; node metadata (current term, voted for, cluster id, last applied
//! position and config) lives in a single durably rewritten file. All writes
//! go through a temp-then-rename protocol and are fsynced unless sync is
//! disabled, so a crash leaves the log either at a strictly earlier last
//! index or at an index whose term matches the recorded metadata.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fs;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::codec;
use crate::kv::Writes;
use crate::message::decode_entry_payload;
use crate::message::ClusterConfig;
use crate::message::ConfigChange;
use crate::message::LogEntry;
use crate::LogId;
use crate::NodeId;

/// Maximum number of applied entries retained for lagging followers.
pub const MAX_APPLIED: usize = 256;

const METADATA_FILE: &str = "meta";
const LOCK_FILE: &str = "lock";
const ENTRY_SUFFIX: &str = ".entry";
const METADATA_MAGIC: u32 = 0x52414654;

/// Durable per-node metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub cluster_id: Option<u32>,
    pub last_applied: LogId,
    /// The cluster config as of `last_applied`.
    pub last_applied_config: ClusterConfig,
}

impl Metadata {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_u32(&mut buf, METADATA_MAGIC);
        codec::put_u64(&mut buf, self.current_term);
        match &self.voted_for {
            Some(id) => {
                codec::put_u8(&mut buf, 1);
                codec::put_string(&mut buf, id);
            }
            None => codec::put_u8(&mut buf, 0),
        }
        match self.cluster_id {
            Some(id) => {
                codec::put_u8(&mut buf, 1);
                codec::put_u32(&mut buf, id);
            }
            None => codec::put_u8(&mut buf, 0),
        }
        codec::put_u64(&mut buf, self.last_applied.term);
        codec::put_u64(&mut buf, self.last_applied.index);
        codec::put_uvarint(&mut buf, self.last_applied_config.len() as u64);
        for (identity, address) in &self.last_applied_config {
            codec::put_string(&mut buf, identity);
            codec::put_string(&mut buf, address);
        }
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let magic = codec::get_u32(&mut input)?;
        if magic != METADATA_MAGIC {
            bail!("bad metadata magic {:#010x}", magic);
        }
        let current_term = codec::get_u64(&mut input)?;
        let voted_for = match codec::get_u8(&mut input)? {
            0 => None,
            _ => Some(codec::get_string(&mut input)?),
        };
        let cluster_id = match codec::get_u8(&mut input)? {
            0 => None,
            _ => Some(codec::get_u32(&mut input)?),
        };
        let last_applied = LogId::new(codec::get_u64(&mut input)?, codec::get_u64(&mut input)?);
        let num_members = codec::get_uvarint(&mut input)?;
        let mut last_applied_config = ClusterConfig::new();
        for _ in 0..num_members {
            let identity = codec::get_string(&mut input)?;
            let address = codec::get_string(&mut input)?;
            last_applied_config.insert(identity, address);
        }
        Ok(Self {
            current_term,
            voted_for,
            cluster_id,
            last_applied,
            last_applied_config,
        })
    }
}

/// A retained applied entry id whose file is still on disk.
#[derive(Clone, Copy, Debug)]
struct AppliedSlot {
    log_id: LogId,
}

/// The persistent Raft log.
///
/// In memory the store holds the unapplied tail of the log (entries above
/// `last_applied`, with their writes) and a bounded ring of applied entry
/// ids whose files are kept on disk for followers that lag. Once the ring is
/// full the oldest applied entry's file is deleted as new entries are
/// applied.
pub struct LogStore {
    dir: PathBuf,
    disable_sync: bool,
    metadata: Metadata,
    /// Entries above `last_applied`, ascending and contiguous.
    unapplied: VecDeque<Arc<LogEntry>>,
    /// Applied entry ids still retained, ascending; at most `max_applied`.
    applied: VecDeque<AppliedSlot>,
    max_applied: usize,
    /// Guard file handle; held for the lifetime of the store.
    _lock: File,
}

impl LogStore {
    /// Open (or create) the log store rooted at `dir`.
    ///
    /// Scans the log directory for entry files; entries whose indices are
    /// out of order or contain a gap are truncated from the gap upward.
    pub fn open(dir: &Path, disable_sync: bool) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating log directory {:?}", dir))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .with_context(|| format!("log directory {:?} is locked by another process", dir))?;

        let metadata = Self::read_metadata(dir)?;

        // Collect entry files sorted by index.
        let mut files: BTreeMap<u64, (u64, PathBuf)> = BTreeMap::new();
        for dirent in fs::read_dir(dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if let Some((index, term)) = parse_entry_file_name(&name) {
                files.insert(index, (term, dirent.path()));
            }
        }

        // Truncate from the first gap or term regression upward.
        let mut keep: Vec<(LogId, PathBuf)> = Vec::new();
        let mut expected_index: Option<u64> = None;
        let mut previous_term = 0u64;
        let mut truncating = false;
        for (index, (term, path)) in files {
            let gap = match expected_index {
                Some(expected) => index != expected,
                None => false,
            };
            if truncating || gap || term < previous_term {
                if !truncating {
                    tracing::warn!(index, "log hole or disorder detected, truncating from here");
                    truncating = true;
                }
                fs::remove_file(&path)?;
                continue;
            }
            expected_index = Some(index + 1);
            previous_term = term;
            keep.push((LogId::new(term, index), path));
        }

        // Entries at or below last_applied are retained applied entries;
        // anything above is the unapplied tail and must be loaded.
        let mut applied = VecDeque::new();
        let mut unapplied = VecDeque::new();
        for (log_id, path) in keep {
            if log_id.index <= metadata.last_applied.index {
                applied.push_back(AppliedSlot { log_id });
                continue;
            }
            let payload = fs::read(&path)?;
            let (writes, config_change) =
                decode_entry_payload(&payload).with_context(|| format!("corrupt log entry {:?}", path))?;
            unapplied.push_back(Arc::new(LogEntry {
                log_id,
                writes,
                config_change,
            }));
        }

        // The unapplied tail must start directly above last_applied, else it
        // is unusable and is discarded.
        if let Some(first) = unapplied.front() {
            if first.log_id.index != metadata.last_applied.index + 1 {
                tracing::warn!(
                    first = first.log_id.index,
                    last_applied = metadata.last_applied.index,
                    "unapplied log tail is not contiguous with applied state, discarding"
                );
                for entry in unapplied.drain(..) {
                    let path = dir.join(entry_file_name(entry.log_id));
                    let _ = fs::remove_file(path);
                }
            }
        }

        let mut store = Self {
            dir: dir.to_path_buf(),
            disable_sync,
            metadata,
            unapplied,
            applied,
            max_applied: MAX_APPLIED,
            _lock: lock,
        };
        store.trim_applied();
        Ok(store)
    }

    fn read_metadata(dir: &Path) -> Result<Metadata> {
        let path = dir.join(METADATA_FILE);
        match File::open(&path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                Metadata::decode(&bytes).with_context(|| format!("corrupt metadata file {:?}", path))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn current_term(&self) -> u64 {
        self.metadata.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.metadata.voted_for.as_ref()
    }

    pub fn cluster_id(&self) -> Option<u32> {
        self.metadata.cluster_id
    }

    pub fn last_applied(&self) -> LogId {
        self.metadata.last_applied
    }

    /// Durably update term/vote/cluster metadata.
    ///
    /// Must complete before acting on a vote or on an append in a new term.
    pub fn save_term_and_vote(
        &mut self,
        current_term: u64,
        voted_for: Option<NodeId>,
        cluster_id: Option<u32>,
    ) -> Result<()> {
        self.metadata.current_term = current_term;
        self.metadata.voted_for = voted_for;
        self.metadata.cluster_id = cluster_id;
        self.write_metadata()
    }

    fn write_metadata(&self) -> Result<()> {
        let bytes = self.metadata.encode();
        self.write_file_durably(&self.dir.join(METADATA_FILE), &bytes)
    }

    /// Write `bytes` to `path` via a temp file and atomic rename.
    fn write_file_durably(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            if !self.disable_sync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, path)?;
        if !self.disable_sync {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }

    /// The index of the last entry in the log (0 for an empty log).
    pub fn last_index(&self) -> u64 {
        match self.unapplied.back() {
            Some(entry) => entry.log_id.index,
            None => self.metadata.last_applied.index,
        }
    }

    /// The term of the last entry in the log.
    pub fn last_term(&self) -> u64 {
        match self.unapplied.back() {
            Some(entry) => entry.log_id.term,
            None => self.metadata.last_applied.term,
        }
    }

    pub fn last_log_id(&self) -> LogId {
        LogId::new(self.last_term(), self.last_index())
    }

    /// The smallest index whose entry file is still on disk.
    pub fn first_retained_index(&self) -> u64 {
        if let Some(slot) = self.applied.front() {
            return slot.log_id.index;
        }
        match self.unapplied.front() {
            Some(entry) => entry.log_id.index,
            None => self.metadata.last_applied.index + 1,
        }
    }

    /// The term of the entry at `index`, if known.
    ///
    /// Index 0 is the empty prefix of every log and reports term 0. The term
    /// of `last_applied` is known even after its entry file was discarded.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index > self.last_index() {
            return None;
        }
        if index > self.metadata.last_applied.index {
            let offset = (index - self.metadata.last_applied.index - 1) as usize;
            return self.unapplied.get(offset).map(|e| e.log_id.term);
        }
        if index == self.metadata.last_applied.index {
            return Some(self.metadata.last_applied.term);
        }
        self.applied_slot(index).map(|slot| slot.log_id.term)
    }

    fn applied_slot(&self, index: u64) -> Option<&AppliedSlot> {
        let first = self.applied.front()?.log_id.index;
        if index < first {
            return None;
        }
        self.applied.get((index - first) as usize)
    }

    /// The in-memory entry at `index`, available for unapplied entries only.
    pub fn entry_at(&self, index: u64) -> Option<&Arc<LogEntry>> {
        if index <= self.metadata.last_applied.index {
            return None;
        }
        let offset = (index - self.metadata.last_applied.index - 1) as usize;
        self.unapplied.get(offset)
    }

    /// The unapplied entries with indices in `(after, last_index]`.
    pub fn entries_after(&self, after: u64) -> impl Iterator<Item = &Arc<LogEntry>> {
        self.unapplied.iter().filter(move |e| e.log_id.index > after)
    }

    /// Load the entry at `index`, reading an applied entry back from disk if
    /// its file is still retained.
    pub fn load_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        if let Some(entry) = self.entry_at(index) {
            return Ok(Some(LogEntry::clone(entry)));
        }
        let slot = match self.applied_slot(index) {
            Some(slot) => *slot,
            None => return Ok(None),
        };
        let path = self.dir.join(entry_file_name(slot.log_id));
        let payload = fs::read(&path).with_context(|| format!("reading retained entry {:?}", path))?;
        let (writes, config_change) = decode_entry_payload(&payload)?;
        Ok(Some(LogEntry {
            log_id: slot.log_id,
            writes,
            config_change,
        }))
    }

    /// Append a new entry at `last_index + 1`.
    pub fn append(&mut self, term: u64, writes: Writes, config_change: Option<ConfigChange>) -> Result<Arc<LogEntry>> {
        let log_id = LogId::new(term, self.last_index() + 1);
        self.append_with_id(log_id, writes, config_change)
    }

    /// Append an entry with an explicit id (used on followers, where the
    /// leader dictates index and term).
    pub fn append_with_id(
        &mut self,
        log_id: LogId,
        writes: Writes,
        config_change: Option<ConfigChange>,
    ) -> Result<Arc<LogEntry>> {
        if log_id.index != self.last_index() + 1 {
            bail!(
                "append at index {} but last index is {}",
                log_id.index,
                self.last_index()
            );
        }
        if log_id.term < self.last_term() {
            bail!(
                "append with term {} below last term {}",
                log_id.term,
                self.last_term()
            );
        }
        let entry = Arc::new(LogEntry {
            log_id,
            writes,
            config_change,
        });
        let payload = entry.encode_payload();
        self.write_file_durably(&self.dir.join(entry_file_name(log_id)), &payload)?;
        self.unapplied.push_back(entry.clone());
        Ok(entry)
    }

    /// Delete all unapplied entries with index at or above `starting_index`.
    ///
    /// Used when the leader overwrites a conflicting suffix. Applied entries
    /// can never be discarded this way.
    pub fn discard_from(&mut self, starting_index: u64) -> Result<()> {
        if starting_index <= self.metadata.last_applied.index {
            bail!(
                "cannot discard from {}: entries through {} are applied",
                starting_index,
                self.metadata.last_applied.index
            );
        }
        while let Some(entry) = self.unapplied.back() {
            if entry.log_id.index < starting_index {
                break;
            }
            let path = self.dir.join(entry_file_name(entry.log_id));
            fs::remove_file(&path)?;
            self.unapplied.pop_back();
        }
        Ok(())
    }

    /// Advance `last_applied` past the next unapplied entry, returning it.
    ///
    /// The entry's writes stay reachable only through its retained file; the
    /// in-memory copy moves to the applied ring and, when the ring is full,
    /// the oldest retained file is deleted.
    pub fn apply_next(&mut self) -> Result<Arc<LogEntry>> {
        let entry = self.unapplied.pop_front().ok_or_else(|| anyhow!("no unapplied entries"))?;
        self.metadata.last_applied = entry.log_id;
        if let Some(change) = &entry.config_change {
            change.apply_to(&mut self.metadata.last_applied_config);
        }
        self.write_metadata()?;
        self.applied.push_back(AppliedSlot { log_id: entry.log_id });
        self.trim_applied();
        Ok(entry)
    }

    /// Discard retained applied entries with index at or below `max_index`.
    pub fn discard_applied(&mut self, max_index: u64) {
        while let Some(slot) = self.applied.front() {
            if slot.log_id.index > max_index {
                break;
            }
            let path = self.dir.join(entry_file_name(slot.log_id));
            let _ = fs::remove_file(path);
            self.applied.pop_front();
        }
    }

    fn trim_applied(&mut self) {
        while self.applied.len() > self.max_applied {
            let slot = self.applied.pop_front().expect("ring not empty");
            let path = self.dir.join(entry_file_name(slot.log_id));
            let _ = fs::remove_file(path);
        }
    }

    /// Reset the log around an installed snapshot: discard every entry and
    /// record the snapshot position and config as applied state.
    pub fn reset_to_snapshot(&mut self, snapshot: LogId, config: ClusterConfig) -> Result<()> {
        for entry in self.unapplied.drain(..) {
            let _ = fs::remove_file(self.dir.join(entry_file_name(entry.log_id)));
        }
        for slot in self.applied.drain(..) {
            let _ = fs::remove_file(self.dir.join(entry_file_name(slot.log_id)));
        }
        self.metadata.last_applied = snapshot;
        self.metadata.last_applied_config = config;
        self.write_metadata()
    }

    /// The cluster config derived from the applied config plus the deltas of
    /// every unapplied log entry above it.
    pub fn current_config(&self) -> ClusterConfig {
        let mut config = self.metadata.last_applied_config.clone();
        for entry in &self.unapplied {
            if let Some(change) = &entry.config_change {
                change.apply_to(&mut config);
            }
        }
        config
    }

    /// The index of the newest unapplied config change, if any.
    pub fn unapplied_config_change_index(&self) -> Option<u64> {
        self.unapplied
            .iter()
            .rev()
            .find(|e| e.config_change.is_some())
            .map(|e| e.log_id.index)
    }

    /// Number of applied entries currently retained.
    pub fn retained_applied(&self) -> usize {
        self.applied.len()
    }

    /// Number of unapplied entries.
    pub fn unapplied_len(&self) -> usize {
        self.unapplied.len()
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.dir.join(LOCK_FILE));
    }
}

fn entry_file_name(log_id: LogId) -> String {
    format!("{:016x}-{:016x}{}", log_id.index, log_id.term, ENTRY_SUFFIX)
}

fn parse_entry_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(ENTRY_SUFFIX)?;
    let (index, term) = stem.split_once('-')?;
    Some((u64::from_str_radix(index, 16).ok()?, u64::from_str_radix(term, 16).ok()?))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn writes_for(key: &[u8], value: &[u8]) -> Writes {
        let mut w = Writes::new();
        w.put(key.to_vec(), value.to_vec());
        w
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), false).unwrap();
            store.save_term_and_vote(1, Some("node-a".into()), Some(7)).unwrap();
            store.append(1, writes_for(b"k1", b"v1"), None).unwrap();
            store.append(1, writes_for(b"k2", b"v2"), None).unwrap();
            assert_eq!(store.last_index(), 2);
            assert_eq!(store.last_term(), 1);
        }

        let store = LogStore::open(dir.path(), false).unwrap();
        assert_eq!(store.current_term(), 1);
        assert_eq!(store.voted_for(), Some(&"node-a".to_string()));
        assert_eq!(store.cluster_id(), Some(7));
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.term_at(1), Some(1));
        assert_eq!(store.term_at(0), Some(0));
        assert_eq!(store.term_at(3), None);
        let entry = store.entry_at(2).unwrap();
        assert_eq!(entry.writes, writes_for(b"k2", b"v2"));
    }

    #[test]
    fn lock_file_excludes_second_opener() {
        let dir = tempfile::tempdir().unwrap();
        let _store = LogStore::open(dir.path(), false).unwrap();
        assert!(LogStore::open(dir.path(), false).is_err());
    }

    #[test]
    fn lock_file_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _store = LogStore::open(dir.path(), false).unwrap();
        }
        assert!(LogStore::open(dir.path(), false).is_ok());
    }

    #[test]
    fn gap_in_log_truncates_from_gap_upward() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), false).unwrap();
            for i in 1..=4u64 {
                store.append(1, writes_for(format!("k{}", i).as_bytes(), b"v"), None).unwrap();
            }
        }
        // Punch a hole at index 3.
        fs::remove_file(dir.path().join(entry_file_name(LogId::new(1, 3)))).unwrap();

        let store = LogStore::open(dir.path(), false).unwrap();
        assert_eq!(store.last_index(), 2);
        assert!(!dir.path().join(entry_file_name(LogId::new(1, 4))).exists());
    }

    #[test]
    fn discard_from_removes_conflicting_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        for i in 1..=3u64 {
            store.append(1, writes_for(format!("k{}", i).as_bytes(), b"v"), None).unwrap();
        }
        store.discard_from(2).unwrap();
        assert_eq!(store.last_index(), 1);
        // Overwrite with a higher-term entry.
        store.append(2, writes_for(b"other", b"v"), None).unwrap();
        assert_eq!(store.last_log_id(), LogId::new(2, 2));
    }

    #[test]
    fn apply_next_advances_and_retains() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        for i in 1..=3u64 {
            store.append(1, writes_for(format!("k{}", i).as_bytes(), b"v"), None).unwrap();
        }
        let entry = store.apply_next().unwrap();
        assert_eq!(entry.log_id.index, 1);
        assert_eq!(store.last_applied(), LogId::new(1, 1));
        assert_eq!(store.retained_applied(), 1);
        assert_eq!(store.unapplied_len(), 2);

        // Applied entries can still be loaded from disk.
        let loaded = store.load_entry(1).unwrap().unwrap();
        assert_eq!(loaded.writes, writes_for(b"k1", b"v"));

        // The applied prefix is protected from discard_from.
        assert!(store.discard_from(1).is_err());
    }

    #[test]
    fn applied_ring_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        store.max_applied = 4;
        for i in 1..=10u64 {
            store.append(1, writes_for(format!("k{}", i).as_bytes(), b"v"), None).unwrap();
            store.apply_next().unwrap();
        }
        assert_eq!(store.retained_applied(), 4);
        // Retained indices are exactly (last_applied - retained, last_applied].
        assert_eq!(store.first_retained_index(), 7);
        assert!(store.load_entry(6).unwrap().is_none());
        assert!(store.load_entry(7).unwrap().is_some());
    }

    #[test]
    fn discard_applied_trims_retained_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        for i in 1..=5u64 {
            store.append(1, writes_for(format!("k{}", i).as_bytes(), b"v"), None).unwrap();
            store.apply_next().unwrap();
        }
        store.discard_applied(3);
        assert_eq!(store.first_retained_index(), 4);
        assert!(store.load_entry(3).unwrap().is_none());
    }

    #[test]
    fn config_changes_flow_into_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        let add = |id: &str, addr: &str| ConfigChange {
            identity: id.into(),
            address: Some(addr.into()),
        };
        store.append(1, Writes::new(), Some(add("node-a", "addr:a"))).unwrap();
        store.append(1, Writes::new(), Some(add("node-b", "addr:b"))).unwrap();

        let config = store.current_config();
        assert_eq!(config.len(), 2);
        assert_eq!(config.get("node-a").map(String::as_str), Some("addr:a"));
        assert_eq!(store.unapplied_config_change_index(), Some(2));

        // Applying folds the delta into the durable applied config.
        store.apply_next().unwrap();
        store.apply_next().unwrap();
        assert_eq!(store.metadata().last_applied_config.len(), 2);
        assert_eq!(store.unapplied_config_change_index(), None);

        // Removal.
        store
            .append(
                1,
                Writes::new(),
                Some(ConfigChange {
                    identity: "node-b".into(),
                    address: None,
                }),
            )
            .unwrap();
        assert_eq!(store.current_config().len(), 1);
    }

    #[test]
    fn reset_to_snapshot_truncates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        for i in 1..=3u64 {
            store.append(1, writes_for(format!("k{}", i).as_bytes(), b"v"), None).unwrap();
        }
        store.apply_next().unwrap();

        let mut config = ClusterConfig::new();
        config.insert("node-a".into(), "addr:a".into());
        store.reset_to_snapshot(LogId::new(2, 100), config.clone()).unwrap();
        assert_eq!(store.last_index(), 100);
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.last_applied(), LogId::new(2, 100));
        assert_eq!(store.current_config(), config);
        assert_eq!(store.unapplied_len(), 0);
        assert_eq!(store.retained_applied(), 0);

        // Reopen sees the snapshot state.
        drop(store);
        let store = LogStore::open(dir.path(), false).unwrap();
        assert_eq!(store.last_applied(), LogId::new(2, 100));
    }

    #[test]
    fn metadata_roundtrip() {
        let mut config = ClusterConfig::new();
        config.insert("node-a".into(), "addr:a".into());
        let meta = Metadata {
            current_term: 9,
            voted_for: Some("node-b".into()),
            cluster_id: Some(0xfeed),
            last_applied: LogId::new(3, 77),
            last_applied_config: config,
        };
        assert_eq!(Metadata::decode(&meta.encode()).unwrap(), meta);
    }
}
