//! # election
//!
//! why: turn an election timeout into a round of vote requests
//! relations: started by ticker.rs, counts votes in raft-core's RaftNode
//! what: start a round, one task per peer, signal the ticker on a win

use std::sync::Arc;

use raft_core::{NodeId, RaftMessage, RequestVoteArgs};
use tracing::{debug, error, trace, warn};

use crate::peer::Shared;
use crate::Transport;

/// Becomes candidate for the next term and asks every peer for its vote.
pub(crate) fn start<T: Transport>(shared: &Arc<Shared<T>>) {
    let args = {
        let mut core = shared.lock();
        let args = core.node.start_election();
        if let Err(err) = core.persist() {
            // a vote for ourselves that is not durable must not be used
            let term = core.node.current_term;
            error!(node = shared.me, term, %err, "failed to persist candidacy, abandoning election");
            core.node.become_follower(term);
            return;
        }
        if core.node.is_leader() {
            shared.won_election.notify_one();
            return;
        }
        args
    };

    debug!(node = shared.me, term = args.term, "requesting votes");
    for peer in shared.peer_ids() {
        tokio::spawn(request_vote(Arc::clone(shared), peer, args.clone()));
    }
}

async fn request_vote<T: Transport>(shared: Arc<Shared<T>>, peer: NodeId, args: RequestVoteArgs) {
    let term = args.term;
    let Some(endpoint) = shared.endpoint(peer) else {
        return;
    };
    let reply = match endpoint.call(args.into()).await {
        Some(RaftMessage::VoteResponse(reply)) => reply,
        Some(other) => {
            warn!(node = shared.me, peer, kind = other.kind(), "unexpected reply to request_vote");
            return;
        }
        None => {
            trace!(node = shared.me, term, peer, "request_vote got no answer");
            return;
        }
    };
    if shared.killed() {
        return;
    }

    let mut core = shared.lock();
    let won = core.node.handle_vote_response(peer, term, &reply);
    core.persist_or_log("request_vote reply");
    drop(core);

    if won {
        shared.won_election.notify_one();
    }
}
