//! # raft-peer
//!
//! why: run raft-core's state machine as a live peer: timers, rpc fan-out, apply delivery
//! relations: built on raft-core and raft-storage, talks to other peers through a Transport
//! what: Raft handle, Transport trait, simulated Network for tests and demos
//!
//! a peer is a single lock around a [`raft_core::RaftNode`] plus three kinds
//! of tokio tasks: the ticker (election timeouts and heartbeats), one task
//! per outgoing rpc, and the applier that feeds committed entries into a
//! bounded channel. the lock is never held across an await.

mod applier;
mod election;
pub mod error;
pub mod network;
mod peer;
mod replication;
mod ticker;
pub mod transport;

pub use error::PeerError;
pub use network::{ClientEnd, Network, RpcHandler};
pub use peer::{Proposal, Raft};
pub use transport::Transport;

pub use raft_core::{ApplyMsg, NodeId, NodeState, NodeStatus, RaftConfig};
