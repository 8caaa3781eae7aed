//! # peer
//!
//! why: run one raft node concurrently, behind a single lock, with its own timers
//! relations: wraps raft-core's RaftNode, persists through raft-storage, spawns ticker.rs and applier.rs
//! what: Raft handle (public api + rpc handlers), Shared state, Core (node + storage)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    NodeId, NodeStatus, PersistLevel, RaftConfig, RaftMessage, RaftNode, RequestVoteArgs,
    RequestVoteReply,
};
use raft_storage::{Storage, StorageError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::{applier, ticker, PeerError, Transport};

/// The node plus the storage it persists to. Only reachable through the lock.
pub(crate) struct Core {
    pub(crate) node: RaftNode,
    storage: Box<dyn Storage>,
}

impl Core {
    /// Writes out whatever the node marked dirty. On failure the mark is
    /// restored so the next attempt writes it again.
    ///
    /// The write happens under the state lock. On a multi-thread runtime the
    /// worker is handed over with `block_in_place` first, so a slow disk
    /// stalls this peer but not the other tasks; a current-thread runtime
    /// simply blocks.
    pub(crate) fn persist(&mut self) -> Result<(), StorageError> {
        let level = self.node.take_persist();
        let snapshot = match level {
            PersistLevel::Clean => return Ok(()),
            PersistLevel::State => None,
            PersistLevel::StateAndSnapshot => Some(self.node.snapshot_data()),
        };
        let state = self.node.persistent_state();
        let storage = self.storage.as_mut();
        let result = off_worker(|| raft_storage::save(storage, &state, snapshot));
        if result.is_err() {
            self.node.mark_dirty(level);
        }
        result
    }

    /// Persists before an rpc reply leaves. Returns false, after logging, if that failed.
    pub(crate) fn persist_or_log(&mut self, context: &'static str) -> bool {
        match self.persist() {
            Ok(()) => true,
            Err(err) => {
                error!(node = self.node.id, term = self.node.current_term, %err, context, "failed to persist raft state");
                false
            }
        }
    }
}

/// Runs blocking disk work, moving other tasks off this worker when the
/// runtime allows it. `block_in_place` panics on a current-thread runtime.
fn off_worker<R>(work: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

pub(crate) struct Shared<T> {
    pub(crate) me: NodeId,
    pub(crate) peers: Vec<T>,
    pub(crate) config: RaftConfig,
    core: Mutex<Core>,
    killed: AtomicBool,
    /// a valid leader was heard from, or a vote was granted
    pub(crate) heartbeat: Notify,
    pub(crate) won_election: Notify,
    /// the leader has new entries to send
    pub(crate) replicate: Notify,
    /// there is something for the applier
    pub(crate) apply: Notify,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.peers.len() as NodeId).filter(move |id| *id != self.me)
    }

    pub(crate) fn endpoint(&self, peer: NodeId) -> Option<&T> {
        usize::try_from(peer).ok().and_then(|index| self.peers.get(index))
    }

    /// A fresh randomized election timeout.
    pub(crate) fn election_timeout(&self) -> Duration {
        let (min, max) = self.config.election_timeout_bounds();
        rand::thread_rng().gen_range(min..max)
    }

    /// Wakes the applier if the node has something ready.
    pub(crate) fn wake_applier(&self, core: &Core) {
        if core.node.has_pending_apply() {
            self.apply.notify_one();
        }
    }
}

/// Index and term a started command will occupy if it commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// Handle to one running raft peer. Clones share the same peer.
pub struct Raft<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Raft<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> Raft<T> {
    /// Starts a peer with the default timing. See [`Raft::with_config`].
    pub fn new(
        peers: Vec<T>,
        me: NodeId,
        storage: impl Storage + 'static,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self, PeerError> {
        Self::with_config(peers, me, storage, apply_tx, RaftConfig::default())
    }

    /// Starts a peer. `peers` holds one endpoint per cluster member, indexed
    /// by id; the entry at `me` is never called. Persisted state is restored
    /// from `storage`, then the ticker and applier tasks are spawned on the
    /// current tokio runtime and the handle returned immediately.
    pub fn with_config(
        peers: Vec<T>,
        me: NodeId,
        storage: impl Storage + 'static,
        apply_tx: mpsc::Sender<ApplyMsg>,
        config: RaftConfig,
    ) -> Result<Self, PeerError> {
        config.validate()?;
        if usize::try_from(me).map_or(true, |index| index >= peers.len()) {
            return Err(PeerError::InvalidTopology {
                me,
                peers: peers.len(),
            });
        }

        let (state, snapshot) = raft_storage::load(&storage)?;
        let mut node = RaftNode::new(me, (0..peers.len() as NodeId).collect());
        node.restore(state, snapshot);

        let shared = Arc::new(Shared {
            me,
            peers,
            config,
            core: Mutex::new(Core {
                node,
                storage: Box::new(storage),
            }),
            killed: AtomicBool::new(false),
            heartbeat: Notify::new(),
            won_election: Notify::new(),
            replicate: Notify::new(),
            apply: Notify::new(),
        });

        tokio::spawn(ticker::run(Arc::clone(&shared)));
        tokio::spawn(applier::run(Arc::clone(&shared), apply_tx));
        info!(node = me, cluster = shared.peers.len(), "peer started");

        Ok(Self { shared })
    }

    pub fn me(&self) -> NodeId {
        self.shared.me
    }

    /// Current term and whether this peer believes it is the leader.
    pub fn get_state(&self) -> (u64, bool) {
        let core = self.shared.lock();
        (core.node.current_term, core.node.is_leader())
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.lock().node.status()
    }

    /// Proposes a command. Returns where it will land if it commits; there
    /// is no guarantee it ever does.
    pub fn start(&self, command: Vec<u8>) -> Result<Proposal, PeerError> {
        if self.killed() {
            return Err(PeerError::Killed(self.shared.me));
        }
        let mut core = self.shared.lock();
        let entry = core.node.append_entry(command)?;
        if let Err(err) = core.persist() {
            error!(node = self.shared.me, term = entry.term, index = entry.index, %err, "failed to persist new command");
            core.node.rollback_append(entry.index);
            return Err(err.into());
        }
        if core.node.advance_commit() {
            self.shared.wake_applier(&core);
        }
        drop(core);

        self.shared.replicate.notify_one();
        Ok(Proposal {
            index: entry.index,
            term: entry.term,
        })
    }

    /// The application has captured its state through `index`.
    pub fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<(), PeerError> {
        let mut core = self.shared.lock();
        core.node.snapshot(index, data)?;
        core.persist()?;
        Ok(())
    }

    /// Answers a delivered [`ApplyMsg::Snapshot`]. Returns whether the
    /// application should switch to it.
    pub fn cond_install_snapshot(&self, term: u64, index: u64, data: Vec<u8>) -> Result<bool, PeerError> {
        let mut core = self.shared.lock();
        let installed = core.node.cond_install_snapshot(term, index, data);
        let persisted = core.persist();
        // the applier was paused on this snapshot either way
        self.shared.apply.notify_one();
        persisted?;
        Ok(installed)
    }

    // -- rpc handlers --

    pub fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut core = self.shared.lock();
        let mut reply = core.node.handle_vote_request(&args);
        if !core.persist_or_log("request_vote") {
            reply.vote_granted = false;
        }
        if reply.vote_granted {
            self.shared.heartbeat.notify_one();
        }
        reply
    }

    pub fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut core = self.shared.lock();
        let (mut reply, from_leader) = core.node.handle_append_entries(args);
        if !core.persist_or_log("append_entries") {
            reply.success = false;
        }
        if from_leader {
            self.shared.heartbeat.notify_one();
        }
        self.shared.wake_applier(&core);
        reply
    }

    pub fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut core = self.shared.lock();
        let (reply, from_leader) = core.node.handle_install_snapshot(args);
        core.persist_or_log("install_snapshot");
        if from_leader {
            self.shared.heartbeat.notify_one();
        }
        self.shared.wake_applier(&core);
        reply
    }

    /// Dispatches an incoming request to its handler. Replies, and anything
    /// sent to a killed peer, get no answer.
    pub fn handle(&self, msg: RaftMessage) -> Option<RaftMessage> {
        if self.killed() {
            return None;
        }
        match msg {
            RaftMessage::VoteRequest(args) => Some(self.request_vote(args).into()),
            RaftMessage::AppendEntries(args) => Some(self.append_entries(args).into()),
            RaftMessage::InstallSnapshot(args) => Some(self.install_snapshot(args).into()),
            other => {
                warn!(node = self.shared.me, kind = other.kind(), "ignoring reply delivered as a request");
                None
            }
        }
    }

    /// Stops the peer's tasks. Idempotent.
    pub fn kill(&self) {
        if self.shared.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = self.shared.me, "peer killed");
        for notify in [
            &self.shared.heartbeat,
            &self.shared.won_election,
            &self.shared.replicate,
            &self.shared.apply,
        ] {
            notify.notify_waiters();
            notify.notify_one();
        }
    }

    pub fn killed(&self) -> bool {
        self.shared.killed()
    }

    /// Bytes of persisted state, for tests that bound log growth.
    pub fn persisted_state_size(&self) -> Result<usize, PeerError> {
        let core = self.shared.lock();
        core.storage
            .state_size()
            .map_err(|err| PeerError::Storage(err.into()))
    }
}
