//! # error
//!
//! why: one error type for everything the public peer api can refuse
//! relations: wraps raft-core and raft-storage errors
//! what: PeerError

use raft_core::{ConfigError, NodeId, RaftError};
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("peer {0} has been killed")]
    Killed(NodeId),

    #[error("peer id {me} is outside a cluster of {peers} endpoints")]
    InvalidTopology { me: NodeId, peers: usize },
}

impl PeerError {
    /// The current leader, when the error is a refusal from a non-leader that knows one.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            Self::Raft(RaftError::NotLeader { leader_hint, .. }) => *leader_hint,
            _ => None,
        }
    }

    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::Raft(RaftError::NotLeader { .. }))
    }
}
