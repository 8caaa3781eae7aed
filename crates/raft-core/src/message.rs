//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by raft-peer transports
//! what: RequestVote, AppendEntries, InstallSnapshot args/replies and the RaftMessage envelope

use serde::{Deserialize, Serialize};

use crate::{LogEntry, NodeId};

/// Sent by candidates to gather votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesArgs {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry this request covers.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }

    /// What the leader needs to remember to interpret the reply.
    pub fn in_flight(&self) -> InFlight {
        InFlight {
            term: self.term,
            prev_log_index: self.prev_log_index,
            last_index: self.last_index(),
        }
    }
}

/// Response to AppendEntries.
///
/// `last_log_index` is the follower's last index at reply time; leaders use
/// it to skip a short follower's missing tail when backing off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
}

/// Summary of an outstanding AppendEntries request, kept by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub term: u64,
    pub prev_log_index: u64,
    pub last_index: u64,
}

/// Sent by the leader when a follower needs entries it has already compacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(RequestVoteArgs),
    VoteResponse(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesResponse(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotArgs),
    InstallSnapshotResponse(InstallSnapshotReply),
}

impl RaftMessage {
    /// The sender's term, carried by every message.
    pub fn term(&self) -> u64 {
        match self {
            Self::VoteRequest(m) => m.term,
            Self::VoteResponse(m) => m.term,
            Self::AppendEntries(m) => m.term,
            Self::AppendEntriesResponse(m) => m.term,
            Self::InstallSnapshot(m) => m.term,
            Self::InstallSnapshotResponse(m) => m.term,
        }
    }

    /// Short name for logs and rpc counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VoteRequest(_) => "request_vote",
            Self::VoteResponse(_) => "request_vote_reply",
            Self::AppendEntries(_) => "append_entries",
            Self::AppendEntriesResponse(_) => "append_entries_reply",
            Self::InstallSnapshot(_) => "install_snapshot",
            Self::InstallSnapshotResponse(_) => "install_snapshot_reply",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::VoteRequest(_) | Self::AppendEntries(_) | Self::InstallSnapshot(_)
        )
    }
}

impl From<RequestVoteArgs> for RaftMessage {
    fn from(args: RequestVoteArgs) -> Self {
        Self::VoteRequest(args)
    }
}

impl From<RequestVoteReply> for RaftMessage {
    fn from(reply: RequestVoteReply) -> Self {
        Self::VoteResponse(reply)
    }
}

impl From<AppendEntriesArgs> for RaftMessage {
    fn from(args: AppendEntriesArgs) -> Self {
        Self::AppendEntries(args)
    }
}

impl From<AppendEntriesReply> for RaftMessage {
    fn from(reply: AppendEntriesReply) -> Self {
        Self::AppendEntriesResponse(reply)
    }
}

impl From<InstallSnapshotArgs> for RaftMessage {
    fn from(args: InstallSnapshotArgs) -> Self {
        Self::InstallSnapshot(args)
    }
}

impl From<InstallSnapshotReply> for RaftMessage {
    fn from(reply: InstallSnapshotReply) -> Self {
        Self::InstallSnapshotResponse(reply)
    }
}
