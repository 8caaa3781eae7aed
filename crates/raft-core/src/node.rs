//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, driven by raft-peer
//! what: NodeState enum, RaftNode struct, election, replication, commit and snapshot logic
//!
//! the node never performs i/o. every handler mutates in-memory state and
//! records how much of it must be persisted; the caller drains that with
//! [`RaftNode::take_persist`] and writes it out before any reply leaves.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{
    AppendEntriesArgs, AppendEntriesReply, InFlight, InstallSnapshotArgs, InstallSnapshotReply,
    LogEntry, RaftError, RaftLog, RaftMessage, RequestVoteArgs, RequestVoteReply,
};

/// Identifies a peer; peers are numbered by position in the cluster list.
pub type NodeId = u64;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Delivered to the application, in order, for every committed entry or
/// installed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    Command {
        index: u64,
        term: u64,
        command: Vec<u8>,
    },
    /// A snapshot received from the leader. The application must answer it
    /// with `cond_install_snapshot` before further commands are delivered.
    Snapshot { term: u64, index: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            Self::Command { index, .. } | Self::Snapshot { index, .. } => *index,
        }
    }
}

/// How much state changed since the last persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PersistLevel {
    #[default]
    Clean,
    State,
    StateAndSnapshot,
}

/// The fields that must survive a crash. The snapshot bytes are stored beside it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
}

/// What a leader sends next to one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRequest {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

impl From<ReplicationRequest> for RaftMessage {
    fn from(request: ReplicationRequest) -> Self {
        match request {
            ReplicationRequest::Append(args) => args.into(),
            ReplicationRequest::Snapshot(args) => args.into(),
        }
    }
}

/// Point-in-time view of a node for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    /// Handed to the applier, not necessarily received by the application yet
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<NodeId>,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Leader of the current term, once known
    pub leader_id: Option<NodeId>,
    pub log: RaftLog,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the apply pipeline. The applier may still be
    /// waiting to push those entries into the channel, so the application
    /// can lag behind this until it drains what it was given.
    pub last_applied: u64,
    /// Leader only: next index to send to each follower
    pub next_index: BTreeMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each node
    pub match_index: BTreeMap<NodeId, u64>,
    /// Candidate only: peers that granted their vote this term
    pub votes_received: BTreeSet<NodeId>,

    snapshot: Vec<u8>,
    pending_snapshot: Option<InstallSnapshotArgs>,
    awaiting_snapshot: bool,
    dirty: PersistLevel,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self {
            id,
            cluster_nodes,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            votes_received: BTreeSet::new(),
            snapshot: Vec::new(),
            pending_snapshot: None,
            awaiting_snapshot: false,
            dirty: PersistLevel::Clean,
        }
    }

    /// Reload what a previous incarnation persisted.
    ///
    /// Everything through the snapshot counts as committed and applied; the
    /// application restores its own state from the same snapshot.
    pub fn restore(&mut self, state: PersistentState, snapshot: Vec<u8>) {
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        self.log = state.log;
        self.commit_index = self.log.snapshot_index();
        self.last_applied = self.log.snapshot_index();
        self.snapshot = snapshot;
        self.dirty = PersistLevel::Clean;
        info!(
            node = self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            snapshot_index = self.log.snapshot_index(),
            "restored persisted state"
        );
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    pub fn snapshot_data(&self) -> &[u8] {
        &self.snapshot
    }

    /// Returns and clears the pending persist level.
    pub fn take_persist(&mut self) -> PersistLevel {
        std::mem::take(&mut self.dirty)
    }

    pub fn mark_dirty(&mut self, level: PersistLevel) {
        self.dirty = self.dirty.max(level);
    }

    // -- cluster helpers --

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |id| *id != self.id)
    }

    /// Smallest majority of the cluster.
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self, votes: usize) -> bool {
        votes >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    // -- role transitions --

    /// Step down to follower, adopting `term` if it is newer.
    ///
    /// The recorded vote is only forgotten when the term moves forward.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            info!(node = self.id, term, old_term = self.current_term, "adopting newer term");
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.mark_dirty(PersistLevel::State);
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
            self.state = NodeState::Follower;
        }
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.mark_dirty(PersistLevel::State);
        info!(node = self.id, term = self.current_term, "became candidate");
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index = peers.iter().map(|peer| (*peer, next)).collect();
        self.match_index = peers.iter().map(|peer| (*peer, 0)).collect();
        self.match_index.insert(self.id, self.log.last_index());
        info!(node = self.id, term = self.current_term, last_log_index = next - 1, "became leader");
    }

    // -- election --

    /// Starts a new election and returns the request to send to every peer.
    ///
    /// A single-node cluster wins immediately.
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.become_candidate();
        if self.has_quorum(self.votes_received.len()) {
            self.become_leader();
        }
        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    /// Decides a vote. The caller resets its election timer when the vote is granted.
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> RequestVoteReply {
        if args.term < self.current_term {
            trace!(node = self.id, term = self.current_term, candidate = args.candidate_id, "rejecting stale vote request");
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            };
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let free = self.voted_for.map_or(true, |id| id == args.candidate_id);
        let up_to_date = self.log.is_up_to_date(args.last_log_index, args.last_log_term);
        let vote_granted = free && up_to_date;
        if vote_granted && self.voted_for.is_none() {
            self.voted_for = Some(args.candidate_id);
            self.mark_dirty(PersistLevel::State);
        }
        debug!(
            node = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            vote_granted,
            up_to_date,
            "vote decided"
        );
        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Counts a vote reply to a request sent in `request_term`.
    /// Returns true when this reply won the election.
    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        request_term: u64,
        reply: &RequestVoteReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Candidate || request_term != self.current_term {
            return false;
        }
        if !reply.vote_granted {
            return false;
        }

        self.votes_received.insert(from);
        debug!(node = self.id, term = self.current_term, from, votes = self.votes_received.len(), "vote received");
        if self.has_quorum(self.votes_received.len()) {
            self.become_leader();
            return true;
        }
        false
    }

    // -- replication (leader side) --

    /// Appends a client command to the leader's log.
    ///
    /// The entry is not yet durable: persist, then call
    /// [`advance_commit`](Self::advance_commit), or undo with
    /// [`rollback_append`](Self::rollback_append) if persisting fails.
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<LogEntry, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                term: self.current_term,
                leader_hint: self.leader_id,
            });
        }
        let entry = self.log.append(self.current_term, command).clone();
        self.match_index.insert(self.id, entry.index);
        self.mark_dirty(PersistLevel::State);
        trace!(node = self.id, term = self.current_term, index = entry.index, "appended command");
        Ok(entry)
    }

    /// Removes an entry just appended by [`append_entry`](Self::append_entry).
    pub fn rollback_append(&mut self, index: u64) {
        if index == self.log.last_index() && index > self.commit_index {
            self.log.truncate_from(index);
            self.match_index.insert(self.id, self.log.last_index());
        }
    }

    /// Builds the next request for `peer`, or `None` when not leading.
    pub fn replication_request(&self, peer: NodeId) -> Option<ReplicationRequest> {
        if !self.is_leader() {
            return None;
        }
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        if next <= self.log.snapshot_index() {
            return Some(ReplicationRequest::Snapshot(InstallSnapshotArgs {
                term: self.current_term,
                leader_id: self.id,
                last_included_index: self.log.snapshot_index(),
                last_included_term: self.log.snapshot_term(),
                data: self.snapshot.clone(),
            }));
        }

        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        Some(ReplicationRequest::Append(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        }))
    }

    /// Processes a follower's reply to the request summarised by `sent`.
    /// Returns true when the commit index moved.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        sent: InFlight,
        reply: &AppendEntriesReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if !self.is_leader() || sent.term != self.current_term {
            return false;
        }

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        if reply.success {
            let matched = matched.max(sent.last_index);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, matched + 1);
            trace!(node = self.id, term = self.current_term, peer = from, matched, "follower caught up");
            return self.advance_commit();
        }

        let next = self.next_index.get(&from).copied().unwrap_or(1);
        let backoff = sent
            .prev_log_index
            .min(reply.last_log_index + 1)
            .max(matched + 1)
            .max(1);
        if backoff < next {
            debug!(node = self.id, term = self.current_term, peer = from, next = backoff, "log mismatch, backing off");
            self.next_index.insert(from, backoff);
        }
        false
    }

    /// Processes a follower's reply to an InstallSnapshot sent in `request_term`.
    pub fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        request_term: u64,
        last_included_index: u64,
        reply: &InstallSnapshotReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if !self.is_leader() || request_term != self.current_term {
            return false;
        }
        let matched = self
            .match_index
            .get(&from)
            .copied()
            .unwrap_or(0)
            .max(last_included_index);
        self.match_index.insert(from, matched);
        self.next_index.insert(from, matched + 1);
        self.advance_commit()
    }

    /// Moves the commit index to the highest index stored on a majority,
    /// if that entry belongs to the current term.
    pub fn advance_commit(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        self.match_index.insert(self.id, self.log.last_index());

        let mut matched: Vec<u64> = self
            .cluster_nodes
            .iter()
            .map(|id| self.match_index.get(id).copied().unwrap_or(0))
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let Some(&candidate) = matched.get(self.quorum_size() - 1) else {
            return false;
        };

        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            debug!(node = self.id, term = self.current_term, commit_index = candidate, "commit index advanced");
            self.commit_index = candidate;
            return true;
        }
        false
    }

    // -- replication (follower side) --

    /// Handles AppendEntries. The flag is true when the request came from the
    /// current leader and the election timer should be reset.
    pub fn handle_append_entries(&mut self, args: AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            trace!(node = self.id, term = self.current_term, leader = args.leader_id, "rejecting stale append entries");
            return (self.append_reply(false), false);
        }
        if args.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(args.term);
        }
        self.leader_id = Some(args.leader_id);

        if !self.log.matches(args.prev_log_index, args.prev_log_term) {
            debug!(
                node = self.id,
                term = self.current_term,
                prev_log_index = args.prev_log_index,
                prev_log_term = args.prev_log_term,
                last_log_index = self.log.last_index(),
                "log mismatch"
            );
            return (self.append_reply(false), true);
        }

        let verified = args.last_index();
        let leader_commit = args.leader_commit;
        if self.log.merge(args.entries) {
            self.mark_dirty(PersistLevel::State);
        }

        let commit = leader_commit.min(verified);
        if commit > self.commit_index {
            debug!(node = self.id, term = self.current_term, commit_index = commit, "follower commit advanced");
            self.commit_index = commit;
        }
        (self.append_reply(true), true)
    }

    fn append_reply(&self, success: bool) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success,
            last_log_index: self.log.last_index(),
        }
    }

    // -- snapshots --

    /// The application has captured its state through `index`; drop the log
    /// prefix it covers.
    pub fn snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<(), RaftError> {
        if index <= self.log.snapshot_index() {
            return Ok(());
        }
        if index > self.last_applied {
            return Err(RaftError::SnapshotBeyondApplied {
                index,
                last_applied: self.last_applied,
            });
        }
        self.log.compact_to(index);
        self.snapshot = data;
        self.mark_dirty(PersistLevel::StateAndSnapshot);
        debug!(node = self.id, term = self.current_term, snapshot_index = index, "log compacted");
        Ok(())
    }

    /// Handles InstallSnapshot. The snapshot is not installed here; it is
    /// queued for the application, which decides through
    /// [`cond_install_snapshot`](Self::cond_install_snapshot).
    pub fn handle_install_snapshot(&mut self, args: InstallSnapshotArgs) -> (InstallSnapshotReply, bool) {
        if args.term < self.current_term {
            return (InstallSnapshotReply { term: self.current_term }, false);
        }
        if args.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(args.term);
        }
        self.leader_id = Some(args.leader_id);

        let newer_than_queued = self
            .pending_snapshot
            .as_ref()
            .map_or(true, |queued| queued.last_included_index < args.last_included_index);
        if args.last_included_index > self.commit_index && newer_than_queued {
            debug!(
                node = self.id,
                term = self.current_term,
                last_included_index = args.last_included_index,
                "snapshot queued for the application"
            );
            self.pending_snapshot = Some(args);
        }
        (InstallSnapshotReply { term: self.current_term }, true)
    }

    /// The application's answer to a delivered snapshot. Returns whether the
    /// snapshot was installed; it is refused when the log has meanwhile
    /// committed through `index`.
    pub fn cond_install_snapshot(&mut self, term: u64, index: u64, data: Vec<u8>) -> bool {
        self.awaiting_snapshot = false;
        if index <= self.commit_index {
            debug!(node = self.id, term = self.current_term, index, commit_index = self.commit_index, "refusing outdated snapshot");
            return false;
        }

        if self.log.term_at(index) == Some(term) {
            self.log.compact_to(index);
        } else {
            self.log.reset_to(index, term);
        }
        self.snapshot = data;
        self.commit_index = index;
        self.last_applied = index;
        if self
            .pending_snapshot
            .as_ref()
            .is_some_and(|queued| queued.last_included_index <= index)
        {
            self.pending_snapshot = None;
        }
        self.mark_dirty(PersistLevel::StateAndSnapshot);
        info!(node = self.id, term = self.current_term, snapshot_index = index, "installed snapshot");
        true
    }

    // -- apply pipeline --

    /// True when [`take_apply_batch`](Self::take_apply_batch) would return something.
    pub fn has_pending_apply(&self) -> bool {
        !self.awaiting_snapshot && (self.pending_snapshot.is_some() || self.commit_index > self.last_applied)
    }

    /// Hands out everything ready for the application, advancing `last_applied`.
    ///
    /// `last_applied` moves when the batch is taken, not when the application
    /// receives it. `snapshot` only checks against this cursor, which is
    /// never behind anything the application can have seen.
    ///
    /// A queued snapshot goes out alone, and nothing more is released until
    /// the application has answered it.
    pub fn take_apply_batch(&mut self) -> Vec<ApplyMsg> {
        if self.awaiting_snapshot {
            return Vec::new();
        }
        if let Some(args) = self.pending_snapshot.take() {
            if args.last_included_index > self.commit_index {
                self.awaiting_snapshot = true;
                return vec![ApplyMsg::Snapshot {
                    term: args.last_included_term,
                    index: args.last_included_index,
                    data: args.data,
                }];
            }
        }
        if self.commit_index <= self.last_applied {
            return Vec::new();
        }

        let batch: Vec<ApplyMsg> = self
            .log
            .entries_between(self.last_applied + 1, self.commit_index)
            .into_iter()
            .map(|entry| ApplyMsg::Command {
                index: entry.index,
                term: entry.term,
                command: entry.command,
            })
            .collect();
        if let Some(last) = batch.last() {
            self.last_applied = last.index();
        }
        batch
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
        }
    }
}
