//! # error
//!
//! why: typed failures surfaced by the state machine and its configuration
//! relations: wrapped by raft-peer's PeerError
//! what: RaftError (protocol-level refusals), ConfigError (invalid or unreadable config)

use thiserror::Error;

use crate::NodeId;

/// Refusals returned synchronously by [`RaftNode`](crate::RaftNode) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// Commands can only be started on the leader; retry against `leader_hint`.
    #[error("not the leader for term {term} (leader hint: {leader_hint:?})")]
    NotLeader {
        term: u64,
        leader_hint: Option<NodeId>,
    },

    /// The application asked to snapshot entries it has not been given yet.
    #[error("cannot snapshot through index {index}: entries applied only through {last_applied}")]
    SnapshotBeyondApplied { index: u64, last_applied: u64 },
}

/// Problems with a [`RaftConfig`](crate::RaftConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout must be greater than zero")]
    ZeroElectionTimeout,

    #[error("election_timeout_min ({min}ms) must be below election_timeout_max ({max}ms)")]
    InvertedElectionTimeout { min: u64, max: u64 },

    #[error("heartbeat interval {heartbeat}ms is too slow for an election timeout of {min}ms")]
    HeartbeatTooSlow { heartbeat: u64, min: u64 },

    #[error("apply channel capacity must be greater than zero")]
    ZeroApplyCapacity,

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
}
