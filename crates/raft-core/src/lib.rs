//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-peer (lock, timers, rpc fan-out), persisted via raft-storage
//! what: role state machine, election and replication logic, log store, snapshots, message types

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;

pub use config::RaftConfig;
pub use error::{ConfigError, RaftError};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, InFlight, InstallSnapshotArgs, InstallSnapshotReply,
    RaftMessage, RequestVoteArgs, RequestVoteReply,
};
pub use node::{
    ApplyMsg, NodeId, NodeState, NodeStatus, PersistLevel, PersistentState, RaftNode,
    ReplicationRequest,
};
