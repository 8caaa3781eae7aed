//! # replication
//!
//! why: push the leader's log to every follower and learn how far each got
//! relations: triggered by ticker.rs each heartbeat or on new commands
//! what: broadcast one request per follower, retry at once after a mismatch

use std::sync::Arc;

use raft_core::{NodeId, RaftMessage, ReplicationRequest};
use tracing::{trace, warn};

use crate::peer::Shared;
use crate::Transport;

/// Sends AppendEntries or InstallSnapshot to every follower.
pub(crate) fn broadcast<T: Transport>(shared: &Arc<Shared<T>>) {
    let requests: Vec<(NodeId, ReplicationRequest)> = {
        let core = shared.lock();
        if !core.node.is_leader() {
            return;
        }
        shared
            .peer_ids()
            .filter_map(|peer| core.node.replication_request(peer).map(|request| (peer, request)))
            .collect()
    };

    for (peer, request) in requests {
        tokio::spawn(replicate_to(Arc::clone(shared), peer, request));
    }
}

/// Sends `request` to `peer`, then keeps going while the follower rejects
/// and the leader still has an earlier point to try.
async fn replicate_to<T: Transport>(shared: Arc<Shared<T>>, peer: NodeId, mut request: ReplicationRequest) {
    let Some(endpoint) = shared.endpoint(peer) else {
        return;
    };
    loop {
        let msg: RaftMessage = request.clone().into();
        let kind = msg.kind();
        let Some(reply) = endpoint.call(msg).await else {
            trace!(node = shared.me, peer, kind, "no answer");
            return;
        };
        if shared.killed() {
            return;
        }

        let retry = {
            let mut core = shared.lock();
            let before = core.node.next_index.get(&peer).copied();
            let advanced = match (&request, reply) {
                (ReplicationRequest::Append(args), RaftMessage::AppendEntriesResponse(reply)) => {
                    core.node.handle_append_entries_response(peer, args.in_flight(), &reply)
                }
                (ReplicationRequest::Snapshot(args), RaftMessage::InstallSnapshotResponse(reply)) => core
                    .node
                    .handle_install_snapshot_response(peer, args.term, args.last_included_index, &reply),
                (_, other) => {
                    warn!(node = shared.me, peer, kind = other.kind(), "mismatched reply");
                    return;
                }
            };
            core.persist_or_log("replication reply");
            if advanced {
                shared.wake_applier(&core);
            }

            // a rejection that moved next_index back is worth retrying immediately
            let backed_off = core.node.next_index.get(&peer).copied() < before;
            if backed_off {
                core.node.replication_request(peer)
            } else {
                None
            }
        };

        match retry {
            Some(next) => request = next,
            None => return,
        }
    }
}
