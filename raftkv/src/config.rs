//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Fraction by which peer clocks are assumed to drift, used when computing
/// the leader lease timeout.
pub const MAX_CLOCK_DRIFT: f64 = 0.01;

/// Default maximum size of one snapshot chunk in bytes.
pub const DEFAULT_SNAPSHOT_CHUNK_SIZE: u64 = 128 * 1024;

/// An error returned by [`ConfigBuilder::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout minimum must be smaller than its maximum")]
    InvalidElectionTimeouts,
    #[error("heartbeat interval must be smaller than the election timeout minimum")]
    InvalidHeartbeatInterval,
    #[error("commit timeout must be greater than zero")]
    InvalidCommitTimeout,
    #[error("snapshot chunk size must be greater than zero")]
    InvalidSnapshotChunkSize,
}

/// The runtime configuration of a Raft node.
///
/// Use [`Config::build`] to construct one; `validate` checks the invariants
/// between the timing values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The name of the cluster this node belongs to, used in logging.
    pub cluster_name: String,
    /// Minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// Maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// Interval at which the leader sends heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
    /// Default deadline for a transaction commit, in milliseconds.
    pub commit_timeout: u64,
    /// Maximum number of entries in flight to a synced follower.
    pub pipeline_window: u64,
    /// Maximum bytes of key/value data per snapshot chunk.
    pub snapshot_chunk_size: u64,
    /// When set, a follower probes its peers for liveness before starting an
    /// election, avoiding election storms on partitioned minorities.
    pub probe_before_election: bool,
    /// Skip fsync on log and metadata writes. Only for tests.
    pub disable_sync: bool,
}

impl Config {
    /// Start a builder with default values.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            commit_timeout: None,
            pipeline_window: None,
            snapshot_chunk_size: None,
            probe_before_election: None,
            disable_sync: None,
        }
    }

    /// Generate a new random election timeout within the configured range.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    commit_timeout: Option<u64>,
    pipeline_window: Option<u64>,
    snapshot_chunk_size: Option<u64>,
    probe_before_election: Option<bool>,
    disable_sync: Option<bool>,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    pub fn commit_timeout(mut self, val: u64) -> Self {
        self.commit_timeout = Some(val);
        self
    }

    pub fn pipeline_window(mut self, val: u64) -> Self {
        self.pipeline_window = Some(val);
        self
    }

    pub fn snapshot_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_chunk_size = Some(val);
        self
    }

    pub fn probe_before_election(mut self, val: bool) -> Self {
        self.probe_before_election = Some(val);
        self
    }

    pub fn disable_sync(mut self, val: bool) -> Self {
        self.disable_sync = Some(val);
        self
    }

    /// Validate the state of the builder, returning the final config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = Config {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min.unwrap_or(150),
            election_timeout_max: self.election_timeout_max.unwrap_or(300),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(50),
            commit_timeout: self.commit_timeout.unwrap_or(5000),
            pipeline_window: self.pipeline_window.unwrap_or(8),
            snapshot_chunk_size: self.snapshot_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNK_SIZE),
            probe_before_election: self.probe_before_election.unwrap_or(false),
            disable_sync: self.disable_sync.unwrap_or(false),
        };
        if config.election_timeout_min >= config.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeouts);
        }
        if config.heartbeat_interval >= config.election_timeout_min {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if config.commit_timeout == 0 {
            return Err(ConfigError::InvalidCommitTimeout);
        }
        if config.snapshot_chunk_size == 0 {
            return Err(ConfigError::InvalidSnapshotChunkSize);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::build("test".into()).validate().unwrap();
        assert!(config.election_timeout_min < config.election_timeout_max);
        assert!(config.heartbeat_interval < config.election_timeout_min);
    }

    #[test]
    fn rand_election_timeout_stays_in_range() {
        let config = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.election_timeout_min);
            assert!(t < config.election_timeout_max);
        }
    }

    #[test]
    fn invalid_timeouts_are_rejected() {
        let res = Config::build("test".into())
            .election_timeout_min(300)
            .election_timeout_max(200)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeouts);

        let res = Config::build("test".into())
            .heartbeat_interval(500)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidHeartbeatInterval);
    }
}
