//! # config
//!
//! why: timing parameters shared by every peer in a cluster
//! relations: read by raft-peer's ticker and applier, loaded from json by the demo binary
//! what: RaftConfig with defaults, validation and json loading

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Timing configuration for a Raft peer. All durations are in milliseconds.
///
/// The election timeout is drawn uniformly from
/// `election_timeout_min..election_timeout_max` on every wait, so that
/// competing candidates drift apart after a split vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: u64,
    /// Exclusive upper bound of the randomized election timeout.
    pub election_timeout_max: u64,
    /// How often a leader sends AppendEntries to every follower.
    pub heartbeat_interval: u64,
    /// Capacity for the bounded apply channel handed to a peer.
    pub apply_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 300,
            election_timeout_max: 600,
            heartbeat_interval: 100,
            apply_channel_capacity: 256,
        }
    }
}

impl RaftConfig {
    /// Checks that the election timeout dominates the heartbeat cadence.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min == 0 {
            return Err(ConfigError::ZeroElectionTimeout);
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::InvertedElectionTimeout {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        // a follower must see at least two heartbeats before it may time out
        if self.heartbeat_interval.saturating_mul(2) > self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.apply_channel_capacity == 0 {
            return Err(ConfigError::ZeroApplyCapacity);
        }
        Ok(())
    }

    /// Parses and validates a json document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a json config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn election_timeout_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min),
            Duration::from_millis(self.election_timeout_max),
        )
    }
}
