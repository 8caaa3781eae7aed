//! # ticker
//!
//! why: drive time-based behaviour: election timeouts and leader heartbeats
//! relations: spawned by peer.rs, starts election.rs rounds and replication.rs broadcasts
//! what: one loop that waits according to the current role

use std::sync::Arc;

use raft_core::NodeState;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::peer::Shared;
use crate::{election, replication, Transport};

pub(crate) async fn run<T: Transport>(shared: Arc<Shared<T>>) {
    while !shared.killed() {
        let role = shared.lock().node.state;
        match role {
            NodeState::Follower => follow(&shared).await,
            NodeState::Candidate => campaign(&shared).await,
            NodeState::Leader => lead(&shared).await,
        }
    }
    debug!(node = shared.me, "ticker stopped");
}

/// Waits for a sign of a live leader; without one, stands for election.
async fn follow<T: Transport>(shared: &Arc<Shared<T>>) {
    let timeout = shared.election_timeout();
    tokio::select! {
        _ = shared.heartbeat.notified() => {}
        _ = sleep(timeout) => {
            if !shared.killed() {
                election::start(shared);
            }
        }
    }
}

/// Waits for the outcome of the current round; a timeout starts the next one.
async fn campaign<T: Transport>(shared: &Arc<Shared<T>>) {
    let term = shared.lock().node.current_term;
    let deadline = Instant::now() + shared.election_timeout();
    loop {
        tokio::select! {
            _ = shared.won_election.notified() => {}
            _ = shared.heartbeat.notified() => {}
            _ = sleep_until(deadline) => {
                if !shared.killed() && still_candidate(shared, term) {
                    election::start(shared);
                }
                return;
            }
        }
        if shared.killed() || !still_candidate(shared, term) {
            return;
        }
    }
}

fn still_candidate<T: Transport>(shared: &Shared<T>, term: u64) -> bool {
    let core = shared.lock();
    core.node.state == NodeState::Candidate && core.node.current_term == term
}

/// Replicates to everyone, then waits for new commands or the next heartbeat.
async fn lead<T: Transport>(shared: &Arc<Shared<T>>) {
    replication::broadcast(shared);
    tokio::select! {
        _ = shared.replicate.notified() => {}
        _ = sleep(shared.config.heartbeat()) => {}
    }
}
